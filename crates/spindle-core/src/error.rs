use thiserror::Error;

use crate::domain::{InvalidTransition, JobId, TaskType};

#[derive(Debug, Error)]
pub enum SpindleError {
    #[error("task already registered: task_type={0}")]
    DuplicateTask(TaskType),

    #[error("no task registered for task_type={0}")]
    UnknownTask(TaskType),

    #[error("invalid arguments for task_type={task_type}: {reason}")]
    Validation { task_type: TaskType, reason: String },

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {job_id}: {source}")]
    InvalidTransition {
        job_id: JobId,
        #[source]
        source: InvalidTransition,
    },

    #[error("missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("wal {0:?} is already open in another writer")]
    WalLocked(std::path::PathBuf),

    #[error("wal i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SpindleError {
    pub fn validation(task_type: &TaskType, reason: impl Into<String>) -> Self {
        Self::Validation {
            task_type: task_type.clone(),
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for SpindleError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
