//! Byte pipes between the two sides of a paired room.
//!
//! Each connection task drives the direction it is the source of: it reads
//! its own socket and writes to whichever peer currently holds the opposite
//! slot. That keeps the two directions independent, and lets a retryable
//! room swap in a reconnected peer without restarting the surviving side.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;

use crate::error::RelayError;
use crate::handshake::Role;
use crate::relay_utils::{eviction_error, PeerWriter, Room, Target};

/// Sentinel line sent to the surviving side when its peer's stream ends.
pub const DISCONNECT_MESSAGE: &[u8] = b"DISCONNECT\n";

pub const COPY_BUF_SIZE: usize = 16 * 1024;

/// Upper bound on delivering the disconnect sentinel to a stalled reader.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait until the slot for `role` holds a usable writer, the room is
/// evicted, or `limit` elapses.
pub async fn await_peer(
    room: &Room,
    role: Role,
    failed: Option<&PeerWriter>,
    limit: Duration,
) -> Result<PeerWriter, WaitError> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let mut changes = room.subscribe();
        match room.target(role, failed) {
            Target::Ready(writer) => return Ok(writer),
            Target::Evicted(eviction) => {
                return Err(WaitError::Evicted(eviction_error(&room.code, eviction)))
            }
            Target::Wait => {}
        }
        if !matches!(tokio::time::timeout_at(deadline, changes.changed()).await, Ok(Ok(()))) {
            return Err(WaitError::TimedOut);
        }
    }
}

#[derive(Debug)]
pub enum WaitError {
    Evicted(RelayError),
    TimedOut,
}

/// Copy `role`'s stream into its peer until the source ends, then mark
/// `role` disconnected and tell the peer.
///
/// `pending` holds bytes already read past the handshake line; they go out
/// first. Returns the number of bytes delivered.
pub async fn pipe_with_notify(
    room: Arc<Room>,
    role: Role,
    mut reader: OwnedReadHalf,
    pending: Vec<u8>,
    reconnect_window: Duration,
) -> Result<u64, RelayError> {
    let peer = role.peer();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    let mut outcome = Ok(());
    if !pending.is_empty() {
        outcome = deliver(&room, peer, &pending, reconnect_window).await;
        if outcome.is_ok() {
            total = pending.len() as u64;
        }
    }

    while outcome.is_ok() {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Pipe error ({}) in room {}: {}", role, room.code, e);
                outcome = Err(RelayError::PipeIo(e));
                break;
            }
        };
        outcome = deliver(&room, peer, &buf[..n], reconnect_window).await;
        if outcome.is_ok() {
            total += n as u64;
        }
    }

    // free the slot first so a client reacting to the notice can rejoin
    room.mark_disconnected(role, Instant::now());
    notify_disconnect(&room, peer).await;
    info!(
        "{} side of room {} finished after {} bytes",
        role, room.code, total
    );
    outcome.map(|()| total)
}

/// Write one chunk to the current holder of `peer`'s slot.
///
/// In a retryable room a failed or disconnected peer is waited for (up to
/// `reconnect_window`) and the chunk goes to whoever reconnects.
async fn deliver(
    room: &Room,
    peer: Role,
    chunk: &[u8],
    reconnect_window: Duration,
) -> Result<(), RelayError> {
    let mut failed: Option<PeerWriter> = None;
    loop {
        let writer = match await_peer(room, peer, failed.as_ref(), reconnect_window).await {
            Ok(writer) => writer,
            Err(WaitError::Evicted(e)) => return Err(e),
            Err(WaitError::TimedOut) => return Err(RelayError::RetryWindowExpired(room.code.clone())),
        };

        let result = writer.lock().await.write_all(chunk).await;
        match result {
            Ok(()) => return Ok(()),
            Err(e) if room.retryable => {
                debug!("write to {} in room {} failed, waiting for reconnect: {}", peer, room.code, e);
                failed = Some(writer);
            }
            Err(e) => return Err(RelayError::PipeIo(e)),
        }
    }
}

/// Best effort: the peer may already be gone.
async fn notify_disconnect(room: &Room, peer: Role) {
    let Some(writer) = room.writer(peer) else {
        return;
    };
    let write = async {
        let mut writer = writer.lock().await;
        writer.write_all(DISCONNECT_MESSAGE).await?;
        writer.flush().await
    };
    match tokio::time::timeout(NOTIFY_TIMEOUT, write).await {
        Ok(Ok(())) => debug!("sent disconnect notice to {} in room {}", peer, room.code),
        Ok(Err(e)) => debug!("disconnect notice to {} in room {} failed: {}", peer, room.code, e),
        Err(_) => debug!("disconnect notice to {} in room {} timed out", peer, room.code),
    }
}
