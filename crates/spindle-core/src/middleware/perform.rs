//! Execution chain: wraps every handler invocation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::typed::{HandlerError, JobContext, TaskHandler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerformOutcome {
    Succeeded,
    Failed(HandlerError),
    /// An interceptor did not run the continuation. Counts as success.
    Skipped,
}

impl PerformOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, PerformOutcome::Failed(_))
    }
}

impl From<Result<(), HandlerError>> for PerformOutcome {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => PerformOutcome::Succeeded,
            Err(err) => PerformOutcome::Failed(err),
        }
    }
}

#[async_trait]
pub trait PerformMiddleware: Send + Sync {
    async fn call(&self, ctx: &JobContext, next: PerformNext<'_>) -> PerformOutcome;
}

/// Continuation handed to an execution interceptor: the interceptors still to
/// run, then the handler.
pub struct PerformNext<'a> {
    chain: &'a [Arc<dyn PerformMiddleware>],
    handler: &'a dyn TaskHandler,
}

impl<'a> PerformNext<'a> {
    pub fn new(chain: &'a [Arc<dyn PerformMiddleware>], handler: &'a dyn TaskHandler) -> Self {
        Self { chain, handler }
    }

    pub async fn run(self, ctx: &JobContext) -> PerformOutcome {
        match self.chain.split_first() {
            Some((first, rest)) => first.call(ctx, PerformNext::new(rest, self.handler)).await,
            None => self.handler.perform(ctx).await.into(),
        }
    }
}
