//! Periodic reclamation of abandoned rooms and expired ledger entries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::time::MissedTickBehavior;

use crate::commands::relay::RelayServer;
use crate::relay_utils::SweepReport;

/// One full pass over rooms and ledgers.
pub fn sweep_once(server: &RelayServer, now: Instant) -> SweepReport {
    let report = server.rooms().sweep_at(now);
    server.limiter().sweep_at(now);
    server.guard().sweep_at(now);
    report
}

/// Run [`sweep_once`] every `period`, forever.
pub async fn run(server: Arc<RelayServer>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let report = sweep_once(&server, Instant::now());
        if report.abandoned + report.expired > 0 {
            info!(
                "Sweep evicted {} abandoned and {} expired rooms",
                report.abandoned, report.expired
            );
        }
        debug!("{:?}", server.stats());
    }
}
