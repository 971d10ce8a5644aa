//! Background job: expire overdue approval requests and forget old ones.
//!
//! Also drops idle rate-limit windows so the limiter's memory tracks active
//! tokens only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::AppState;

const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Spawn the sweeper. Call this once at startup.
pub fn spawn(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(SWEEP_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sweep(&state);
        }
    })
}

/// Returns `(expired, pruned)`.
pub fn sweep(state: &AppState) -> (usize, usize) {
    let now = Utc::now();
    let expired = state.approvals.expire_overdue(now);
    let pruned = state
        .approvals
        .prune(state.config.approval_retention, now);
    state.limiter.prune(Instant::now());

    if expired > 0 || pruned > 0 {
        tracing::info!(expired, pruned, "approval sweep");
    }
    (expired, pruned)
}
