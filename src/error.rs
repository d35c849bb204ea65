use std::io;
use std::time::Duration;

use thiserror::Error;

/// Why a control line could not be turned into a [`crate::handshake::Handshake`].
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("i/o error while reading handshake: {0}")]
    Io(#[from] io::Error),
    #[error("no handshake line within {0:?}")]
    Timeout(Duration),
    #[error("connection closed before a full handshake line")]
    Closed,
    #[error("handshake line longer than {0} bytes")]
    TooLong(usize),
    #[error("malformed handshake {0:?}")]
    Malformed(String),
    #[error("unknown role {0:?}")]
    UnknownRole(String),
}

/// Per-connection failure. None of these ever reach the accept loop.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("rate limited: {0}")]
    RateLimited(&'static str),
    #[error(transparent)]
    HandshakeMalformed(#[from] HandshakeError),
    #[error("code {0} is temporarily blocked")]
    CodeBlocked(String),
    #[error("room {code} already has a live {role}")]
    DuplicateRole { code: String, role: &'static str },
    #[error("pipe i/o error: {0}")]
    PipeIo(#[source] io::Error),
    #[error("room {0} was abandoned before pairing")]
    RoomAbandoned(String),
    #[error("room {0} reconnect window expired")]
    RetryWindowExpired(String),
    #[error("no peer joined room {0} in time")]
    PairingTimeout(String),
    #[error("client left room {0} before pairing")]
    LeftBeforePairing(String),
}
