//! Room table and the pairing state machine.
//!
//! A room goes `half-open -> paired`, after which a non-retryable room leaves
//! the table right away while a retryable one stays so a dropped side can
//! rejoin under the same code. Rooms are shared with the connection tasks
//! through `Arc`, so leaving the table never pulls a room out from under a
//! running pipe.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;

use crate::error::RelayError;
use crate::handshake::{Handshake, Role};

/// Write side of a peer's socket. Only the opposite direction's pipe writes to it.
pub type PeerWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Identifies a slot's occupant without keeping its socket open.
pub type PeerHandle = Weak<tokio::sync::Mutex<OwnedWriteHalf>>;

pub struct Peer {
    pub addr: SocketAddr,
    pub writer: PeerWriter,
}

impl Peer {
    pub fn new(addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Peer {
            addr,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
        }
    }

    pub fn handle(&self) -> PeerHandle {
        Arc::downgrade(&self.writer)
    }

    fn same_as(&self, handle: &PeerHandle) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.writer), handle.as_ptr())
    }
}

/// Why the sweeper evicted a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    Abandoned,
    RetryWindowExpired,
}

pub struct RoomState {
    pub sender: Option<Peer>,
    pub receiver: Option<Peer>,
    pub sender_disconnected: bool,
    pub receiver_disconnected: bool,
    pub created_at: Instant,
    pub last_activity: Instant,
    evicted: Option<Eviction>,
}

impl RoomState {
    fn slot(&self, role: Role) -> &Option<Peer> {
        match role {
            Role::Sender => &self.sender,
            Role::Receiver => &self.receiver,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<Peer> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    pub fn disconnected(&self, role: Role) -> bool {
        match role {
            Role::Sender => self.sender_disconnected,
            Role::Receiver => self.receiver_disconnected,
        }
    }

    fn set_disconnected(&mut self, role: Role, value: bool) {
        match role {
            Role::Sender => self.sender_disconnected = value,
            Role::Receiver => self.receiver_disconnected = value,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.sender.is_some() && self.receiver.is_some()
    }

    /// A slot can take a new connection when empty or when its last
    /// occupant went away.
    fn is_free(&self, role: Role) -> bool {
        self.slot(role).is_none() || self.disconnected(role)
    }
}

/// Where a pipe should send its next chunk.
pub enum Target {
    Ready(PeerWriter),
    /// The peer is not (or no longer) connected; wait for a change.
    Wait,
    Evicted(Eviction),
}

pub struct Room {
    pub code: String,
    /// Fixed by the handshake that created the room.
    pub retryable: bool,
    state: Mutex<RoomState>,
    changes: watch::Sender<u64>,
}

impl Room {
    fn new(code: String, retryable: bool, now: Instant) -> Self {
        let (changes, _) = watch::channel(0);
        Room {
            code,
            retryable,
            state: Mutex::new(RoomState {
                sender: None,
                receiver: None,
                sender_disconnected: false,
                receiver_disconnected: false,
                created_at: now,
                last_activity: now,
                evicted: None,
            }),
            changes,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe before inspecting state so no change is missed in between.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Resolve the writer for `role`, skipping `failed` (a writer that
    /// already errored and must be replaced before it is used again).
    pub fn target(&self, role: Role, failed: Option<&PeerWriter>) -> Target {
        let state = self.state();
        if let Some(eviction) = state.evicted {
            return Target::Evicted(eviction);
        }
        let usable = !self.retryable || !state.disconnected(role);
        match state.slot(role) {
            Some(peer) if usable && !failed.is_some_and(|f| Arc::ptr_eq(f, &peer.writer)) => {
                Target::Ready(peer.writer.clone())
            }
            _ => Target::Wait,
        }
    }

    /// Current writer for `role` regardless of its state, for best-effort notices.
    pub fn writer(&self, role: Role) -> Option<PeerWriter> {
        self.state().slot(role).as_ref().map(|peer| peer.writer.clone())
    }

    pub fn mark_disconnected(&self, role: Role, now: Instant) {
        {
            let mut state = self.state();
            state.set_disconnected(role, true);
            state.last_activity = now;
        }
        self.notify();
    }

    /// Mark the room dead and drop both sockets' write halves.
    fn evict(&self, reason: Eviction) {
        {
            let mut state = self.state();
            state.evicted = Some(reason);
            state.sender = None;
            state.receiver = None;
        }
        self.notify();
    }

    pub fn eviction(&self) -> Option<Eviction> {
        self.state().evicted
    }
}

pub enum Join {
    Attached { room: Arc<Room>, paired: bool },
    /// The role's slot holds a live connection; the peer is handed back.
    Occupied(Peer),
}

/// Counts reported by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub abandoned: usize,
    pub expired: usize,
}

pub struct RoomManager {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    abandon_after: Duration,
    reconnect_window: Duration,
}

impl RoomManager {
    pub fn new(abandon_after: Duration, reconnect_window: Duration) -> Self {
        RoomManager {
            rooms: Mutex::new(HashMap::new()),
            abandon_after,
            reconnect_window,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn get(&self, code: &str) -> Option<Arc<Room>> {
        self.table().get(code).cloned()
    }

    /// Attach a freshly handshaken connection to the room for its code,
    /// creating the room if the code is unseen.
    ///
    /// Runs entirely under the table lock, so two connections racing for the
    /// same code can never both complete the pairing.
    pub fn join(&self, handshake: &Handshake, peer: Peer, now: Instant) -> Join {
        let mut table = self.table();
        let room = table
            .entry(handshake.code.clone())
            .or_insert_with(|| {
                info!(
                    "Room created for code {} (retryable={})",
                    handshake.code, handshake.retryable
                );
                Arc::new(Room::new(handshake.code.clone(), handshake.retryable, now))
            })
            .clone();

        let paired = {
            let mut state = room.state();
            if !state.is_free(handshake.role) {
                return Join::Occupied(peer);
            }
            let reconnect = state.disconnected(handshake.role);
            info!(
                "{} {} room {} from {}",
                handshake.role,
                if reconnect { "rejoined" } else { "joined" },
                room.code,
                peer.addr
            );
            *state.slot_mut(handshake.role) = Some(peer);
            state.set_disconnected(handshake.role, false);
            state.last_activity = now;
            state.is_paired()
        };

        if paired && !room.retryable {
            table.remove(&room.code);
            debug!("Room {} paired and removed from table (not retryable)", room.code);
        }
        drop(table);

        room.notify();
        Join::Attached { room, paired }
    }

    /// Evict `room` if it is still in the table and still has no peer for `role`.
    /// Used by a connection that gave up waiting for its peer.
    pub fn abandon(&self, room: &Arc<Room>, waiting_for: Role) {
        let mut table = self.table();
        let listed = table
            .get(&room.code)
            .is_some_and(|listed| Arc::ptr_eq(listed, room));
        if !listed || room.state().slot(waiting_for).is_some() {
            return;
        }
        table.remove(&room.code);
        drop(table);
        info!("Room {} abandoned by its waiting peer", room.code);
        room.evict(Eviction::Abandoned);
    }

    /// Release `role`'s slot after its connection closed while still waiting
    /// for a peer. Nothing happens if `occupant` no longer holds the slot.
    ///
    /// A room left with nobody in it is removed, so the next handshake for
    /// the code starts over.
    pub fn leave(&self, room: &Arc<Room>, role: Role, occupant: &PeerHandle, now: Instant) {
        let mut table = self.table();
        let emptied = {
            let mut state = room.state();
            if !state.slot(role).as_ref().is_some_and(|peer| peer.same_as(occupant)) {
                return;
            }
            if state.slot(role.peer()).is_some() {
                state.set_disconnected(role, true);
                state.last_activity = now;
                false
            } else {
                true
            }
        };

        if !emptied {
            drop(table);
            debug!("{} left room {} while its peer was away", role, room.code);
            room.notify();
            return;
        }
        if table.get(&room.code).is_some_and(|listed| Arc::ptr_eq(listed, room)) {
            table.remove(&room.code);
        }
        drop(table);
        info!("Room {} closed: its {} left before pairing", room.code, role);
        room.evict(Eviction::Abandoned);
    }

    /// Evict half-open rooms past the abandonment window and retryable rooms
    /// whose reconnect window has run out.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut evicted = Vec::new();

        self.table().retain(|code, room| {
            let state = room.state();
            let verdict = if !state.is_paired() {
                (now.saturating_duration_since(state.created_at) > self.abandon_after)
                    .then_some(Eviction::Abandoned)
            } else if room.retryable
                && (state.sender_disconnected || state.receiver_disconnected)
                && now.saturating_duration_since(state.last_activity) > self.reconnect_window
            {
                Some(Eviction::RetryWindowExpired)
            } else {
                None
            };
            drop(state);

            match verdict {
                Some(reason) => {
                    match reason {
                        Eviction::Abandoned => {
                            report.abandoned += 1;
                            info!("Cleaning up abandoned room {}", code);
                        }
                        Eviction::RetryWindowExpired => {
                            report.expired += 1;
                            info!("Cleaning up retryable room {} after disconnect window", code);
                        }
                    }
                    evicted.push((room.clone(), reason));
                    false
                }
                None => true,
            }
        });

        for (room, reason) in evicted {
            room.evict(reason);
        }
        report
    }
}

pub fn eviction_error(code: &str, eviction: Eviction) -> RelayError {
    match eviction {
        Eviction::Abandoned => RelayError::RoomAbandoned(code.to_string()),
        Eviction::RetryWindowExpired => RelayError::RetryWindowExpired(code.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    const ABANDON: Duration = Duration::from_secs(600);
    const RECONNECT: Duration = Duration::from_secs(120);

    /// A server-side write half plus the client socket keeping it open.
    async fn peer() -> (Peer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, addr) = listener.accept().await.unwrap();
        let (_reader, writer) = server.into_split();
        (Peer::new(addr, writer), client)
    }

    fn handshake(code: &str, role: Role, retryable: bool) -> Handshake {
        Handshake {
            code: code.to_string(),
            role,
            retryable,
        }
    }

    fn attached(join: Join) -> (Arc<Room>, bool) {
        match join {
            Join::Attached { room, paired } => (room, paired),
            Join::Occupied(_) => panic!("expected the join to attach"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_room_leaves_table_on_pairing() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;
        let (receiver, _r) = peer().await;

        let (room, paired) = attached(manager.join(&handshake("ABC", Role::Sender, false), sender, now));
        assert!(!paired);
        assert_eq!(manager.len(), 1);

        let (same, paired) = attached(manager.join(&handshake("ABC", Role::Receiver, false), receiver, now));
        assert!(paired);
        assert!(Arc::ptr_eq(&room, &same));
        assert!(manager.is_empty());
        assert!(room.state().is_paired());

        // a third connection starts from scratch
        let (late, _l) = peer().await;
        let (fresh, paired) = attached(manager.join(&handshake("ABC", Role::Sender, false), late, now));
        assert!(!paired);
        assert!(!Arc::ptr_eq(&room, &fresh));
    }

    #[tokio::test]
    async fn test_retryable_room_survives_pairing() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;
        let (receiver, _r) = peer().await;

        manager.join(&handshake("ABC", Role::Sender, true), sender, now);
        let (room, paired) = attached(manager.join(&handshake("ABC", Role::Receiver, true), receiver, now));
        assert!(paired);
        assert!(room.retryable);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_flag_fixed_by_first_handshake() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;
        let (receiver, _r) = peer().await;

        manager.join(&handshake("ABC", Role::Sender, false), sender, now);
        let (room, _) = attached(manager.join(&handshake("ABC", Role::Receiver, true), receiver, now));
        assert!(!room.retryable);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_live_slot_rejects_duplicate_role() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (first, _f) = peer().await;
        let (second, _s) = peer().await;

        manager.join(&handshake("ABC", Role::Sender, false), first, now);
        assert!(matches!(
            manager.join(&handshake("ABC", Role::Sender, false), second, now),
            Join::Occupied(_)
        ));
    }

    #[tokio::test]
    async fn test_disconnected_slot_accepts_reconnect() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;
        let (receiver, _r) = peer().await;
        let (again, _a) = peer().await;

        manager.join(&handshake("ABC", Role::Sender, true), sender, now);
        let (room, _) = attached(manager.join(&handshake("ABC", Role::Receiver, true), receiver, now));
        room.mark_disconnected(Role::Sender, now);
        assert!(matches!(room.target(Role::Sender, None), Target::Wait));

        let (same, paired) = attached(manager.join(&handshake("ABC", Role::Sender, true), again, now));
        assert!(paired);
        assert!(Arc::ptr_eq(&room, &same));
        assert!(!room.state().sender_disconnected);
        assert!(matches!(room.target(Role::Sender, None), Target::Ready(_)));
    }

    #[tokio::test]
    async fn test_failed_writer_is_skipped() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;

        let (room, _) = attached(manager.join(&handshake("ABC", Role::Sender, true), sender, now));
        let writer = match room.target(Role::Sender, None) {
            Target::Ready(writer) => writer,
            _ => panic!("sender should be ready"),
        };
        assert!(matches!(room.target(Role::Sender, Some(&writer)), Target::Wait));
        assert!(matches!(room.target(Role::Receiver, None), Target::Wait));
    }

    #[tokio::test]
    async fn test_sweep_abandoned_half_open_room() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;

        let (room, _) = attached(manager.join(&handshake("XYZ", Role::Sender, false), sender, now));

        assert_eq!(manager.sweep_at(now + Duration::from_secs(599)), SweepReport::default());
        assert_eq!(manager.len(), 1);

        let report = manager.sweep_at(now + Duration::from_secs(601));
        assert_eq!(report, SweepReport { abandoned: 1, expired: 0 });
        assert!(manager.is_empty());
        assert_eq!(room.eviction(), Some(Eviction::Abandoned));
        assert!(room.writer(Role::Sender).is_none());
    }

    #[tokio::test]
    async fn test_sweep_retry_window() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;
        let (receiver, _r) = peer().await;

        manager.join(&handshake("ABC", Role::Sender, true), sender, now);
        let (room, _) = attached(manager.join(&handshake("ABC", Role::Receiver, true), receiver, now));

        // an active paired room is never swept, however old
        assert_eq!(manager.sweep_at(now + Duration::from_secs(3600)), SweepReport::default());

        let dropped = now + Duration::from_secs(3600);
        room.mark_disconnected(Role::Sender, dropped);
        assert_eq!(manager.sweep_at(dropped + Duration::from_secs(119)), SweepReport::default());

        let report = manager.sweep_at(dropped + Duration::from_secs(121));
        assert_eq!(report, SweepReport { abandoned: 0, expired: 1 });
        assert!(manager.get("ABC").is_none());
        assert!(matches!(
            room.target(Role::Receiver, None),
            Target::Evicted(Eviction::RetryWindowExpired)
        ));
    }

    #[tokio::test]
    async fn test_leave_frees_code_of_lonely_occupant() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;
        let handle = sender.handle();

        let (room, _) = attached(manager.join(&handshake("ABC", Role::Sender, true), sender, now));
        manager.leave(&room, Role::Sender, &handle, now);
        assert!(manager.is_empty());
        assert_eq!(room.eviction(), Some(Eviction::Abandoned));

        let (again, _a) = peer().await;
        let (fresh, paired) = attached(manager.join(&handshake("ABC", Role::Sender, true), again, now));
        assert!(!paired);
        assert!(!Arc::ptr_eq(&room, &fresh));
    }

    #[tokio::test]
    async fn test_leave_ignores_replaced_occupant() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;
        let (receiver, _r) = peer().await;
        let stale = sender.handle();

        manager.join(&handshake("ABC", Role::Sender, true), sender, now);
        let (room, _) = attached(manager.join(&handshake("ABC", Role::Receiver, true), receiver, now));
        room.mark_disconnected(Role::Sender, now);
        let (rejoined, _j) = peer().await;
        attached(manager.join(&handshake("ABC", Role::Sender, true), rejoined, now));

        manager.leave(&room, Role::Sender, &stale, now);
        assert_eq!(manager.len(), 1);
        assert!(!room.state().sender_disconnected);
        assert_eq!(room.eviction(), None);
    }

    #[tokio::test]
    async fn test_leave_beside_absent_peer_marks_disconnected() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;
        let (receiver, _r) = peer().await;

        manager.join(&handshake("ABC", Role::Sender, true), sender, now);
        let (room, _) = attached(manager.join(&handshake("ABC", Role::Receiver, true), receiver, now));
        room.mark_disconnected(Role::Receiver, now);

        // the sender reconnects, then drops again before the receiver returns
        room.mark_disconnected(Role::Sender, now);
        let (rejoined, _j) = peer().await;
        let handle = rejoined.handle();
        attached(manager.join(&handshake("ABC", Role::Sender, true), rejoined, now));
        manager.leave(&room, Role::Sender, &handle, now);

        assert_eq!(manager.len(), 1);
        assert!(room.state().sender_disconnected);
        assert!(room.state().receiver_disconnected);
    }

    #[tokio::test]
    async fn test_abandon_only_removes_unpaired_room() {
        let manager = RoomManager::new(ABANDON, RECONNECT);
        let now = Instant::now();
        let (sender, _s) = peer().await;
        let (receiver, _r) = peer().await;

        let (room, _) = attached(manager.join(&handshake("ABC", Role::Sender, true), sender, now));
        manager.join(&handshake("ABC", Role::Receiver, true), receiver, now);
        manager.abandon(&room, Role::Receiver);
        assert_eq!(manager.len(), 1);

        let (lonely, _l) = peer().await;
        let (other, _) = attached(manager.join(&handshake("XYZ", Role::Sender, false), lonely, now));
        manager.abandon(&other, Role::Receiver);
        assert!(manager.get("XYZ").is_none());
        assert_eq!(other.eviction(), Some(Eviction::Abandoned));
    }
}
