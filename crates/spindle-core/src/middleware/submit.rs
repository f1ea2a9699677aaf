//! Submission chain: runs before anything is persisted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Arguments, JobId, TaskType};
use crate::error::SpindleError;

/// A submission on its way to the WAL. Every field may be rewritten by an
/// interceptor.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitContext {
    pub task_type: TaskType,
    pub arguments: Arguments,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Enqueued(JobId),
    /// An interceptor did not continue; nothing was persisted.
    Halted,
}

impl SubmitOutcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            SubmitOutcome::Enqueued(job_id) => Some(*job_id),
            SubmitOutcome::Halted => None,
        }
    }
}

#[async_trait]
pub trait SubmitMiddleware: Send + Sync {
    async fn call(&self, ctx: SubmitContext, next: SubmitNext<'_>) -> Result<SubmitOutcome, SpindleError>;
}

/// End of the chain: validates and persists the submission.
#[async_trait]
pub trait SubmitSink: Send + Sync {
    async fn persist(&self, ctx: SubmitContext) -> Result<JobId, SpindleError>;
}

/// Continuation handed to a submission interceptor: the interceptors still to
/// run, then the sink.
pub struct SubmitNext<'a> {
    chain: &'a [Arc<dyn SubmitMiddleware>],
    sink: &'a dyn SubmitSink,
}

impl<'a> SubmitNext<'a> {
    pub fn new(chain: &'a [Arc<dyn SubmitMiddleware>], sink: &'a dyn SubmitSink) -> Self {
        Self { chain, sink }
    }

    pub async fn run(self, ctx: SubmitContext) -> Result<SubmitOutcome, SpindleError> {
        match self.chain.split_first() {
            Some((first, rest)) => first.call(ctx, SubmitNext::new(rest, self.sink)).await,
            None => self.sink.persist(ctx).await.map(SubmitOutcome::Enqueued),
        }
    }
}
