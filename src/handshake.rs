//! Control-line handshake sent once by every client right after connect:
//!
//! ```text
//! <code>:<role>\n
//! <code>:<role>:retry\n
//! ```

use std::fmt;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;

use crate::error::HandshakeError;

/// Upper bound on a control line, newline included.
pub const MAX_HANDSHAKE_LEN: usize = 256;

const RETRY_FLAG: &str = "retry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub code: String,
    pub role: Role,
    pub retryable: bool,
}

/// Parse one control line. A trailing `\n` (and `\r`) is tolerated but not required.
pub fn parse_line(line: &str) -> Result<Handshake, HandshakeError> {
    let trimmed = line.trim_end_matches('\n').trim_end_matches('\r');
    let parts: Vec<&str> = trimmed.split(':').collect();

    let (code, role, retryable) = match parts.as_slice() {
        [code, role] => (*code, *role, false),
        [code, role, flag] if *flag == RETRY_FLAG => (*code, *role, true),
        _ => return Err(HandshakeError::Malformed(trimmed.to_string())),
    };
    if code.is_empty() || code.chars().any(char::is_whitespace) {
        return Err(HandshakeError::Malformed(trimmed.to_string()));
    }

    let role = match role {
        "sender" => Role::Sender,
        "receiver" => Role::Receiver,
        other => return Err(HandshakeError::UnknownRole(other.to_string())),
    };

    Ok(Handshake {
        code: code.to_string(),
        role,
        retryable,
    })
}

/// Best-effort code recovery from a possibly broken control line: whatever
/// precedes the first `:`.
pub fn extract_code(line: &str) -> Option<String> {
    let line = line.lines().next()?;
    let (code, _) = line.split_once(':')?;
    if code.is_empty() || code.len() >= MAX_HANDSHAKE_LEN || code.chars().any(char::is_whitespace) {
        return None;
    }
    Some(code.to_string())
}

/// Look at up to `max_bytes` of the stream without consuming them and try to
/// recover the code. Gives up after `timeout`; the bytes stay queued for
/// [`read_handshake`].
pub async fn peek_code(stream: &TcpStream, max_bytes: usize, timeout: Duration) -> Option<String> {
    let mut buf = vec![0u8; max_bytes.max(1)];
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_len = 0;

    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("peek failed: {}", e);
                return None;
            }
            Err(_) => break,
        };
        // EOF, a full line, a full buffer or no progress: stop waiting
        if n == 0 || n == buf.len() || buf[..n].contains(&b'\n') {
            last_len = n;
            break;
        }
        if n == last_len {
            // peek returns immediately while data is queued; wait for more
            tokio::time::sleep(Duration::from_millis(10)).await;
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }
        last_len = n;
    }

    extract_code(&String::from_utf8_lossy(&buf[..last_len]))
}

/// Outcome of a full handshake read.
#[derive(Debug)]
pub struct HandshakeRead {
    /// The raw line, kept so a code can still be recovered when parsing fails.
    pub line: String,
    pub result: Result<Handshake, HandshakeError>,
    /// Payload bytes the client sent right behind its control line.
    pub leftover: Vec<u8>,
}

/// Consume exactly one control line from `stream`.
///
/// Any bytes buffered past the newline are handed back in
/// [`HandshakeRead::leftover`] so nothing the client sent early is lost.
pub async fn read_handshake(
    stream: &mut TcpStream,
    timeout: Option<Duration>,
) -> HandshakeRead {
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::with_capacity(64);

    let mut limited = (&mut reader).take(MAX_HANDSHAKE_LEN as u64);
    let read = limited.read_until(b'\n', &mut raw);
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, read).await {
            Ok(res) => res,
            Err(_) => {
                return HandshakeRead {
                    line: String::from_utf8_lossy(&raw).into_owned(),
                    result: Err(HandshakeError::Timeout(limit)),
                    leftover: Vec::new(),
                }
            }
        },
        None => read.await,
    };

    let leftover = reader.buffer().to_vec();
    let line = String::from_utf8_lossy(&raw).into_owned();
    let result = match outcome {
        Err(e) => Err(HandshakeError::Io(e)),
        Ok(0) => Err(HandshakeError::Closed),
        Ok(_) if raw.last() != Some(&b'\n') => {
            if raw.len() >= MAX_HANDSHAKE_LEN {
                Err(HandshakeError::TooLong(MAX_HANDSHAKE_LEN))
            } else {
                Err(HandshakeError::Closed)
            }
        }
        Ok(_) => parse_line(&line),
    };

    HandshakeRead {
        line,
        result,
        leftover,
    }
}
