//! Progressive blocking of codes that keep failing their handshake.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::warn;

use crate::rate_limit::Ledger;

pub const BLOCKED_MESSAGE: &str =
    "Code temporarily blocked due to too many failed attempts. Try again later.";

/// Result of recording one failed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Still allowed; this many failures left before the code is blocked.
    Allowed { tries_remaining: usize },
    Blocked,
}

impl FailureVerdict {
    pub fn allowed(&self) -> bool {
        matches!(self, FailureVerdict::Allowed { .. })
    }

    pub fn blocked(&self) -> bool {
        matches!(self, FailureVerdict::Blocked)
    }

    /// The line sent back to the client, newline included.
    pub fn message(&self) -> String {
        match self {
            FailureVerdict::Allowed { tries_remaining } => format!(
                "Invalid code or key. You have {} tries remaining before this code is blocked.\n",
                tries_remaining
            ),
            FailureVerdict::Blocked => format!("{}\n", BLOCKED_MESSAGE),
        }
    }
}

#[derive(Debug)]
struct GuardState {
    failures: Ledger<String>,
    blocked_until: HashMap<String, Instant>,
}

#[derive(Debug)]
pub struct HandshakeGuard {
    threshold: usize,
    window: Duration,
    block_for: Duration,
    state: Mutex<GuardState>,
}

impl HandshakeGuard {
    pub fn new(threshold: usize, window: Duration, block_for: Duration) -> Self {
        HandshakeGuard {
            threshold,
            window,
            block_for,
            state: Mutex::new(GuardState {
                failures: Ledger::new(),
                blocked_until: HashMap::new(),
            }),
        }
    }

    pub fn is_blocked(&self, code: &str) -> bool {
        self.is_blocked_at(code, Instant::now())
    }

    /// Whether `code` is under an active block. Expired blocks are evicted here.
    pub fn is_blocked_at(&self, code: &str, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        active_block(&mut state, code, now)
    }

    pub fn check_and_record_failure(&self, code: &str) -> FailureVerdict {
        self.check_and_record_failure_at(code, Instant::now())
    }

    pub fn check_and_record_failure_at(&self, code: &str, now: Instant) -> FailureVerdict {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if active_block(&mut state, code, now) {
            return FailureVerdict::Blocked;
        }

        let key = code.to_string();
        state.failures.prune(&key, now, self.window);
        let count = state.failures.record(key.clone(), now);

        match self.threshold.checked_sub(count) {
            Some(tries_remaining) if tries_remaining > 0 => {
                FailureVerdict::Allowed { tries_remaining }
            }
            _ => {
                warn!("blocking code {} for {:?} after {} failed handshakes", code, self.block_for, count);
                // a blocked code starts from zero once the block lapses
                state.failures.remove(&key);
                state.blocked_until.insert(key, now + self.block_for);
                FailureVerdict::Blocked
            }
        }
    }

    pub fn sweep_at(&self, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.failures.sweep(now, self.window);
        state.blocked_until.retain(|_, until| now < *until);
    }

    /// Number of tracked `(failing codes, blocked codes)`.
    pub fn tracked(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.failures.len(), state.blocked_until.len())
    }
}

fn active_block(state: &mut GuardState, code: &str, now: Instant) -> bool {
    match state.blocked_until.get(code) {
        Some(until) if now < *until => true,
        Some(_) => {
            state.blocked_until.remove(code);
            false
        }
        None => false,
    }
}
