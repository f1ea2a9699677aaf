//! EventSink implementations.

use tokio::sync::broadcast;

use crate::domain::{JobEvent, JobEventKind};
use crate::ports::EventSink;

/// Writes every event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &JobEvent) {
        let elapsed_ms = event.elapsed.as_millis() as u64;
        match event.kind {
            JobEventKind::Failed => tracing::warn!(
                job_id = %event.job_id,
                task_type = %event.task_type,
                attempt = event.attempt_count,
                elapsed_ms,
                error = event.error.as_deref().unwrap_or_default(),
                "job attempt failed"
            ),
            JobEventKind::DeadLettered => tracing::error!(
                job_id = %event.job_id,
                task_type = %event.task_type,
                attempt = event.attempt_count,
                elapsed_ms,
                reason = event.error.as_deref().unwrap_or_default(),
                "job dead-lettered"
            ),
            kind => tracing::info!(
                job_id = %event.job_id,
                task_type = %event.task_type,
                attempt = event.attempt_count,
                elapsed_ms,
                event = ?kind,
                "job event"
            ),
        }
    }
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lag (and see `RecvError::Lagged`); emission never waits.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: &JobEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}
