//! Compaction loop - periodic WAL garbage collection.
//!
//! # Flow
//! 1. wake every `interval`
//! 2. drop jobs whose terminal record is older than the retention window
//!    from the WAL and from the in-memory table

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::engine::EngineInner;

pub(crate) async fn compaction_loop(
    inner: Arc<EngineInner>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately; nothing has aged yet
    ticker.tick().await;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => match inner.compact().await {
                Ok(report) => debug!(
                    kept = report.kept_records,
                    dropped = report.dropped_records,
                    "periodic compaction"
                ),
                Err(err) => warn!(error = %err, "periodic compaction failed"),
            },
        }
    }
}
