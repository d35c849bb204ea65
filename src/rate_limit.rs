//! Sliding-window admission counters keyed by client IP and by code.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;

/// Ordered attempt timestamps per key. Timestamps are appended in
/// non-decreasing order, so pruning only ever pops from the front.
#[derive(Debug)]
pub(crate) struct Ledger<K> {
    entries: HashMap<K, VecDeque<Instant>>,
}

impl<K: Eq + Hash + Clone> Ledger<K> {
    pub(crate) fn new() -> Self {
        Ledger {
            entries: HashMap::new(),
        }
    }

    /// Drop timestamps older than `window` for `key` and return how many remain.
    pub(crate) fn prune(&mut self, key: &K, now: Instant, window: Duration) -> usize {
        let Some(stamps) = self.entries.get_mut(key) else {
            return 0;
        };
        prune_front(stamps, now, window);
        let len = stamps.len();
        if len == 0 {
            self.entries.remove(key);
        }
        len
    }

    pub(crate) fn record(&mut self, key: K, now: Instant) -> usize {
        let stamps = self.entries.entry(key).or_default();
        stamps.push_back(now);
        stamps.len()
    }

    pub(crate) fn remove(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Prune every key, dropping the ones left empty.
    pub(crate) fn sweep(&mut self, now: Instant, window: Duration) {
        self.entries.retain(|_, stamps| {
            prune_front(stamps, now, window);
            !stamps.is_empty()
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn prune_front(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = stamps.front() {
        if now.saturating_duration_since(*oldest) > window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

/// Why an attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Ip,
    Code,
}

impl Rejection {
    pub fn reason(self) -> &'static str {
        match self {
            Rejection::Ip => "rate limit exceeded for IP",
            Rejection::Code => "rate limit exceeded for code",
        }
    }
}

#[derive(Debug)]
struct Ledgers {
    by_ip: Ledger<IpAddr>,
    by_code: Ledger<String>,
}

#[derive(Debug)]
pub struct RateLimiter {
    ip_limit: usize,
    code_limit: usize,
    window: Duration,
    ledgers: Mutex<Ledgers>,
}

impl RateLimiter {
    pub fn new(ip_limit: usize, code_limit: usize, window: Duration) -> Self {
        RateLimiter {
            ip_limit,
            code_limit,
            window,
            ledgers: Mutex::new(Ledgers {
                by_ip: Ledger::new(),
                by_code: Ledger::new(),
            }),
        }
    }

    pub fn check_and_record(&self, ip: IpAddr, code: Option<&str>) -> Result<(), Rejection> {
        self.check_and_record_at(ip, code, Instant::now())
    }

    /// Admit and record an attempt, or reject it without recording anything.
    ///
    /// The code counter is only consulted when a code is known.
    pub fn check_and_record_at(
        &self,
        ip: IpAddr,
        code: Option<&str>,
        now: Instant,
    ) -> Result<(), Rejection> {
        let mut ledgers = self.ledgers.lock().unwrap_or_else(|e| e.into_inner());
        let code = code.map(str::to_string);

        let ip_count = ledgers.by_ip.prune(&ip, now, self.window);
        let code_count = match &code {
            Some(code) => ledgers.by_code.prune(code, now, self.window),
            None => 0,
        };

        if ip_count >= self.ip_limit {
            debug!("{} has {} attempts in window", ip, ip_count);
            return Err(Rejection::Ip);
        }
        if code.is_some() && code_count >= self.code_limit {
            return Err(Rejection::Code);
        }

        ledgers.by_ip.record(ip, now);
        if let Some(code) = code {
            ledgers.by_code.record(code, now);
        }
        Ok(())
    }

    pub fn sweep_at(&self, now: Instant) {
        let mut ledgers = self.ledgers.lock().unwrap_or_else(|e| e.into_inner());
        ledgers.by_ip.sweep(now, self.window);
        ledgers.by_code.sweep(now, self.window);
    }

    /// Number of tracked `(ips, codes)`.
    pub fn tracked(&self) -> (usize, usize) {
        let ledgers = self.ledgers.lock().unwrap_or_else(|e| e.into_inner());
        (ledgers.by_ip.len(), ledgers.by_code.len())
    }
}
