use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use super::HandlerError;
use crate::domain::{Arguments, JobEnvelope, JobId, TaskType};

/// What a handler (and the execution middleware) sees of the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub task_type: TaskType,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    pub max_attempts: u32,
    pub arguments: Arguments,
    pub created_at: DateTime<Utc>,
    cancel: watch::Receiver<bool>,
}

impl JobContext {
    pub fn new(envelope: &JobEnvelope, max_attempts: u32, cancel: watch::Receiver<bool>) -> Self {
        Self {
            job_id: envelope.job_id,
            task_type: envelope.task_type.clone(),
            attempt: envelope.attempt_count,
            max_attempts,
            arguments: envelope.arguments.clone(),
            created_at: envelope.created_at,
            cancel,
        }
    }

    /// A context whose cancellation flag can never be raised.
    pub fn detached(envelope: &JobEnvelope, max_attempts: u32) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(envelope, max_attempts, rx)
    }

    /// Has an operator asked for this job to stop? Cancellation of a running
    /// job is cooperative: long handlers should check this between steps.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Decode the arguments into `T`. A mismatch is a permanent failure:
    /// retrying the same arguments cannot fix it.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(serde_json::Value::Object(self.arguments.clone()))
            .map_err(|e| HandlerError::permanent(format!("json decode: {e}")))
    }
}
