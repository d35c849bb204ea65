use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::guard::{FailureVerdict, HandshakeGuard};
use crate::handshake::{extract_code, peek_code, read_handshake, Handshake, Role};
use crate::networking::{await_peer, pipe_with_notify, WaitError};
use crate::rate_limit::RateLimiter;
use crate::relay_utils::{Join, Peer, PeerHandle, Room, RoomManager};
use crate::{health, sweeper};

/// Upper bound on writing a control line back to a client that is not reading.
const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a taken slot is given to turn out dead before a join is refused.
const OCCUPANT_GRACE: Duration = Duration::from_millis(500);

/// Sizes of the server's shared tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub rooms: usize,
    pub tracked_ips: usize,
    pub tracked_codes: usize,
    pub failing_codes: usize,
    pub blocked_codes: usize,
}

/// All state of one relay instance. Nothing is global, so several relays can
/// run side by side in one process.
pub struct RelayServer {
    config: RelayConfig,
    rooms: RoomManager,
    limiter: RateLimiter,
    guard: HandshakeGuard,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(RelayServer {
            rooms: RoomManager::new(config.abandon_after(), config.reconnect_window()),
            limiter: RateLimiter::new(config.ip_limit, config.code_limit, config.rate_window()),
            guard: HandshakeGuard::new(
                config.failure_threshold,
                config.failure_window(),
                config.block_duration(),
            ),
            config,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn guard(&self) -> &HandshakeGuard {
        &self.guard
    }

    pub fn stats(&self) -> RelayStats {
        let (tracked_ips, tracked_codes) = self.limiter.tracked();
        let (failing_codes, blocked_codes) = self.guard.tracked();
        RelayStats {
            rooms: self.rooms.len(),
            tracked_ips,
            tracked_codes,
            failing_codes,
            blocked_codes,
        }
    }

    /// Accept connections forever, one task each. A failing connection only
    /// ever ends its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            info!("New connection from {}", addr);

            let server = self.clone();
            tokio::spawn(async move {
                match server.handle_connection(stream, addr).await {
                    Ok(bytes) => debug!("Connection from {} closed after relaying {} bytes", addr, bytes),
                    Err(e) => info!("Connection from {} ended: {}", addr, e),
                }
            });
        }
    }

    /// Admission, handshake, pairing and piping for one client.
    ///
    /// Returns the number of bytes relayed from this client to its peer.
    pub async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<u64, RelayError> {
        let config = &self.config;

        // Rate limiting happens before any room is touched, on whatever code
        // can be recovered without consuming the control line.
        let peeked = peek_code(&stream, config.peek_bytes, config.peek_timeout()).await;
        if let Err(rejection) = self.limiter.check_and_record(addr.ip(), peeked.as_deref()) {
            info!(
                "Connection from {} for code {} rejected: {}",
                addr.ip(),
                peeked.as_deref().unwrap_or("<unknown>"),
                rejection.reason()
            );
            return Err(RelayError::RateLimited(rejection.reason()));
        }

        let read = read_handshake(&mut stream, config.handshake_timeout()).await;
        let handshake = match read.result {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("Handshake failed from {}: {}", addr, e);
                if let Some(code) = peeked.or_else(|| extract_code(&read.line)) {
                    self.record_failure(&mut stream, &code, addr).await;
                }
                return Err(e.into());
            }
        };
        info!(
            "Handshake: code={}, role={}, retryable={}, from={}",
            handshake.code, handshake.role, handshake.retryable, addr
        );
        // checked once the line is consumed so the refusal is not lost to a reset
        self.refuse_if_blocked(&mut stream, &handshake.code, addr).await?;

        let role = handshake.role;
        let (mut reader, writer) = stream.into_split();
        let peer = Peer::new(addr, writer);
        let handle = peer.handle();
        let room = match self.join_room(&handshake, peer).await {
            Ok(room) => room,
            Err(peer) => {
                warn!("Room {} already has a live {}, rejecting {}", handshake.code, role, addr);
                let mut writer = peer.writer.lock().await;
                self.record_failure(&mut *writer, &handshake.code, addr).await;
                return Err(RelayError::DuplicateRole {
                    code: handshake.code,
                    role: role.as_str(),
                });
            }
        };

        self.wait_for_pairing(&room, role, &mut reader, &handle).await?;
        pipe_with_notify(room, role, reader, read.leftover, config.reconnect_window()).await
    }

    /// Join the room for `handshake`, handing the peer back if its slot is
    /// still taken after [`OCCUPANT_GRACE`].
    ///
    /// The occupant may be a client that just hung up and is rejoining,
    /// whose old task has not yet seen the close.
    async fn join_room(&self, handshake: &Handshake, peer: Peer) -> Result<Arc<Room>, Peer> {
        let peer = match self.rooms.join(handshake, peer, Instant::now()) {
            Join::Attached { room, paired } => return Ok(Self::attached(room, paired)),
            Join::Occupied(peer) => peer,
        };
        if let Some(room) = self.rooms.get(&handshake.code) {
            let mut changes = room.subscribe();
            let _ = tokio::time::timeout(OCCUPANT_GRACE, changes.changed()).await;
        }
        match self.rooms.join(handshake, peer, Instant::now()) {
            Join::Attached { room, paired } => Ok(Self::attached(room, paired)),
            Join::Occupied(peer) => Err(peer),
        }
    }

    fn attached(room: Arc<Room>, paired: bool) -> Arc<Room> {
        if paired {
            info!("Room {} paired", room.code);
        }
        room
    }

    /// Park until the other role is present.
    ///
    /// The wait is bounded by the abandonment window. A client that hangs up
    /// meanwhile gives its slot back so it can rejoin the same code.
    async fn wait_for_pairing(
        &self,
        room: &Arc<Room>,
        role: Role,
        reader: &mut OwnedReadHalf,
        handle: &PeerHandle,
    ) -> Result<(), RelayError> {
        let waited = tokio::select! {
            waited = await_peer(room, role.peer(), None, self.config.abandon_after()) => waited,
            _ = closed_while_waiting(reader) => {
                self.rooms.leave(room, role, handle, Instant::now());
                return Err(RelayError::LeftBeforePairing(room.code.clone()));
            }
        };
        match waited {
            Ok(_) => Ok(()),
            Err(WaitError::Evicted(e)) => Err(e),
            Err(WaitError::TimedOut) => {
                self.rooms.abandon(room, role.peer());
                Err(RelayError::PairingTimeout(room.code.clone()))
            }
        }
    }

    async fn refuse_if_blocked(
        &self,
        stream: &mut TcpStream,
        code: &str,
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        if !self.guard.is_blocked(code) {
            return Ok(());
        }
        info!("Refusing {} for blocked code {}", addr, code);
        send_line(stream, &FailureVerdict::Blocked.message()).await;
        Err(RelayError::CodeBlocked(code.to_string()))
    }

    /// Count a failed handshake against `code` and tell the client where it stands.
    async fn record_failure<W>(&self, writer: &mut W, code: &str, addr: SocketAddr)
    where
        W: AsyncWrite + Unpin,
    {
        let verdict = self.guard.check_and_record_failure(code);
        match &verdict {
            FailureVerdict::Allowed { tries_remaining } => info!(
                "Failed handshake from {} (code {}, {} tries left)",
                addr, code, tries_remaining
            ),
            FailureVerdict::Blocked => info!("Failed handshake from {} (code {} blocked)", addr, code),
        }
        send_line(writer, &verdict.message()).await;
    }
}

/// Resolves once the client has closed its socket. Data sent ahead of
/// pairing is left unread, and the watch stops there.
async fn closed_while_waiting(reader: &mut OwnedReadHalf) {
    let mut byte = [0u8; 1];
    if let Ok(n) = reader.peek(&mut byte).await {
        if n > 0 {
            std::future::pending::<()>().await;
        }
    }
}

/// Best effort: the client may already be gone.
async fn send_line<W>(writer: &mut W, line: &str)
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    };
    if let Ok(Err(e)) = tokio::time::timeout(CONTROL_WRITE_TIMEOUT, write).await {
        debug!("Failed to send control line: {}", e);
    }
}

/// Run the relay server that pairs senders and receivers by code.
///
/// # Overview
/// A client connects, sends one `code:role[:retry]` line, and waits. Once
/// the other role arrives under the same code the two sockets are spliced
/// into a bidirectional byte pipe that the relay never inspects.
///
/// # Architecture
/// - Main task: accepts TCP connections in a loop
/// - Connection tasks: one per client; admission, handshake, pairing, then
///   the copy loop for the direction this client is the source of
/// - Sweeper task: evicts abandoned rooms and expired ledger entries
/// - Health task: answers every HTTP request with `200 OK`
///
/// # Returns
/// Only returns early with an error if a listener cannot be bound.
pub async fn run(config: RelayConfig) -> Result<(), Box<dyn Error>> {
    let bind_addr = format!("0.0.0.0:{}", config.port);
    debug!("Attempting to bind to {}", bind_addr);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Relay server started on {}", bind_addr);

    if config.health_port != 0 {
        let health_listener = health::bind(config.health_port).await?;
        tokio::spawn(health::serve(health_listener));
    }

    let server = RelayServer::new(config);
    debug!("Spawning cleanup sweeper");
    tokio::spawn(sweeper::run(server.clone(), server.config.sweep_interval()));

    server.serve(listener).await;
    Ok(())
}
