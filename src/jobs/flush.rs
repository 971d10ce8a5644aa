//! Background job: persist debounced `last_used` updates.
//!
//! Validation only flushes when a request happens to arrive after the save
//! interval has passed. This job covers idle periods, so staleness on disk
//! stays bounded by roughly one interval either way.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::AppState;

/// Spawn the periodic flush task. Call this once at startup.
pub fn spawn(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = state.config.save_interval.max(Duration::from_secs(1));
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing is dirty yet.
        interval.tick().await;
        loop {
            interval.tick().await;
            run_once(&state);
        }
    })
}

/// One pass of the job. Returns whether a snapshot was written.
pub fn run_once(state: &AppState) -> bool {
    match state.store.flush_if_due() {
        Ok(true) => {
            tracing::debug!("flushed token usage timestamps");
            true
        }
        Ok(false) => false,
        Err(e) => {
            tracing::error!("token flush job failed: {}", e);
            false
        }
    }
}
