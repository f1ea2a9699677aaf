//! Telemetry events emitted at every lifecycle step of a job.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{JobId, TaskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Submitted,
    Claimed,
    Completed,
    Failed,
    RetryScheduled,
    DeadLettered,
}

/// One telemetry event.
///
/// `elapsed` depends on the kind:
/// - Submitted: time spent in the submission path (middleware + WAL append)
/// - Claimed: time the job waited since it became due
/// - Completed / Failed: handler run time (including execution middleware)
/// - RetryScheduled: delay until the retry is due
/// - DeadLettered: time since submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: JobId,
    pub task_type: TaskType,
    pub attempt_count: u32,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, job_id: JobId, task_type: TaskType, attempt_count: u32, elapsed: Duration) -> Self {
        Self {
            kind,
            job_id,
            task_type,
            attempt_count,
            elapsed,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
