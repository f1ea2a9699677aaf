//! Engine - the public surface: submission, introspection, cancellation,
//! compaction, and dispatch.
//!
//! Built by [`EngineBuilder`](super::EngineBuilder), which replays the WAL
//! before handing out an `Engine`, so nothing can be submitted or dispatched
//! against a half-recovered queue.

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

use super::dispatcher::DispatcherHandle;
use super::status::QueueCounts;
use crate::config::EngineConfig;
use crate::domain::{Arguments, JobEnvelope, JobEvent, JobEventKind, JobId, JobMutation, JobState, TaskType};
use crate::error::SpindleError;
use crate::middleware::{PerformMiddleware, SubmitContext, SubmitMiddleware, SubmitNext, SubmitOutcome, SubmitSink};
use crate::ports::{Clock, EventSink, IdGenerator};
use crate::queue::{DueIndex, JobTable, RetryPolicy};
use crate::typed::{FnHandler, HandlerError, JobContext, Task, TaskDefinition, TaskRegistry};
use crate::wal::{CompactionReport, Wal};

/// Result of cancelling a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started; it is now dead with reason `cancelled`.
    Cancelled,
    /// The job is running; its cancellation flag was raised.
    Signalled,
    /// The job had already completed or died.
    AlreadyFinished,
}

pub const CANCELLED_REASON: &str = "cancelled";

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) registry: RwLock<TaskRegistry>,
    pub(crate) wal: Wal,
    pub(crate) table: JobTable,
    pub(crate) index: Mutex<DueIndex>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) submit_chain: Vec<Arc<dyn SubmitMiddleware>>,
    pub(crate) perform_chain: Vec<Arc<dyn PerformMiddleware>>,
    pub(crate) sinks: Vec<Arc<dyn EventSink>>,
    pub(crate) retry: RetryPolicy,
    /// Raised by submissions and retries so idle dispatchers look again.
    pub(crate) notify: Notify,
    /// Cooperative cancellation flags of running jobs.
    pub(crate) cancel_flags: Mutex<HashMap<JobId, watch::Sender<bool>>>,
}

impl EngineInner {
    pub(crate) fn index(&self) -> MutexGuard<'_, DueIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flags(&self) -> MutexGuard<'_, HashMap<JobId, watch::Sender<bool>>> {
        self.cancel_flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Owned copy of a definition, so no registry lock outlives the call.
    pub(crate) fn definition(&self, task_type: &TaskType) -> Result<TaskDefinition, SpindleError> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.resolve(task_type).cloned()
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }

    /// Subscribe to the cancellation flag of a job about to run.
    pub(crate) fn watch_cancel(&self, job_id: JobId) -> watch::Receiver<bool> {
        self.flags()
            .entry(job_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    pub(crate) fn is_cancel_requested(&self, job_id: JobId) -> bool {
        self.flags().get(&job_id).is_some_and(|tx| *tx.borrow())
    }

    pub(crate) fn release_cancel(&self, job_id: JobId) {
        self.flags().remove(&job_id);
    }

    fn raise_cancel(&self, job_id: JobId) {
        self.flags()
            .entry(job_id)
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
    }

    pub(crate) async fn compact(&self) -> Result<CompactionReport, SpindleError> {
        let retention = chrono::Duration::from_std(self.config.retention()).unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let report = self.wal.compact(cutoff).await?;
        self.table.remove_all(&report.dropped_jobs).await;
        Ok(report)
    }
}

#[async_trait]
impl SubmitSink for EngineInner {
    async fn persist(&self, ctx: SubmitContext) -> Result<JobId, SpindleError> {
        let definition = self.definition(&ctx.task_type)?;
        let arguments = definition.prepare(ctx.arguments)?;

        let now = self.clock.now();
        let job_id = self.ids.generate_job_id();
        let envelope = JobEnvelope::new(job_id, ctx.task_type, arguments, now, ctx.due_at);
        self.wal
            .append(
                job_id,
                JobMutation::Submitted {
                    envelope: Box::new(envelope.clone()),
                },
                now,
            )
            .await?;

        let due_at = envelope.due_at;
        self.table.insert(envelope).await;
        self.index().insert(due_at, job_id);
        self.notify.notify_waiters();
        Ok(job_id)
    }
}

/// Handle to a running engine. Cheap to clone; every clone drives the same
/// queue.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    pub(crate) fn from_inner(inner: EngineInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .registered_types()
    }

    /// Submit a job. Returns once the submission is durable in the WAL.
    ///
    /// Errors: `UnknownTask`, `Validation`, or an I/O error from the WAL.
    pub async fn submit(
        &self,
        task_type: impl Into<TaskType>,
        arguments: Arguments,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<SubmitOutcome, SpindleError> {
        let started = Instant::now();
        let ctx = SubmitContext {
            task_type: task_type.into(),
            arguments,
            due_at,
        };
        let outcome = SubmitNext::new(&self.inner.submit_chain, self.inner.as_ref())
            .run(ctx)
            .await?;

        match outcome {
            SubmitOutcome::Enqueued(job_id) => {
                // middleware may have rewritten the task type
                if let Some(envelope) = self.inner.table.get(job_id).await {
                    self.inner.emit(JobEvent::new(
                        JobEventKind::Submitted,
                        job_id,
                        envelope.task_type,
                        0,
                        started.elapsed(),
                    ));
                }
            }
            SubmitOutcome::Halted => debug!("submission halted by middleware"),
        }
        Ok(outcome)
    }

    /// Typed submission.
    pub async fn submit_task<T: Task>(&self, task: &T, due_at: Option<DateTime<Utc>>) -> Result<SubmitOutcome, SpindleError> {
        let task_type = TaskType::new(T::TYPE);
        let arguments = match serde_json::to_value(task)? {
            serde_json::Value::Object(arguments) => arguments,
            other => {
                return Err(SpindleError::validation(
                    &task_type,
                    format!("arguments must serialize to an object, got {other}"),
                ));
            }
        };
        self.submit(task_type, arguments, due_at).await
    }

    /// Register an ad hoc task that calls `f` on `object`, named
    /// `<TypeName>#<method>`, and return a handle for deferring calls to it.
    ///
    /// ```ignore
    /// let deliver = engine.wrap(mailer, "deliver", |mailer, args| async move {
    ///     mailer.deliver(&args).await.map_err(|e| HandlerError::new(e.to_string()))
    /// })?;
    /// deliver.perform_later(args).await?;
    /// ```
    pub fn wrap<O, F, Fut>(&self, object: Arc<O>, method: &str, f: F) -> Result<Deferred, SpindleError>
    where
        O: Send + Sync + 'static,
        F: Fn(Arc<O>, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let task_type = TaskType::new(format!("{}#{method}", short_type_name::<O>()));
        let handler = FnHandler::new(move |ctx: JobContext| f(Arc::clone(&object), ctx.arguments));
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(TaskDefinition::new(task_type.clone(), Arc::new(handler)))?;
        info!(task_type = %task_type, "wrapped method registered");
        Ok(Deferred {
            engine: self.clone(),
            task_type,
        })
    }

    pub async fn job(&self, job_id: JobId) -> Option<JobEnvelope> {
        self.inner.table.get(job_id).await
    }

    /// Jobs ordered by id, optionally filtered by state.
    pub async fn jobs(&self, state: Option<JobState>) -> Vec<JobEnvelope> {
        self.inner.table.list(state).await
    }

    pub async fn counts(&self) -> QueueCounts {
        self.inner.table.counts().await
    }

    /// Jobs that would be dispatched at `now`, in dispatch order. Read-only.
    pub async fn ready_jobs(&self, now: DateTime<Utc>) -> Vec<JobEnvelope> {
        let ids = self.inner.index().peek_ready(now);
        let mut out = Vec::with_capacity(ids.len());
        for job_id in ids {
            if let Some(envelope) = self.inner.table.get(job_id).await {
                out.push(envelope);
            }
        }
        out
    }

    /// Earliest due time in the index; `Some(None)` means something is due
    /// immediately.
    pub fn next_due(&self) -> Option<Option<DateTime<Utc>>> {
        self.inner.index().next_due()
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, SpindleError> {
        let inner = &self.inner;
        let envelope = inner.table.get(job_id).await.ok_or(SpindleError::JobNotFound(job_id))?;

        match envelope.state {
            JobState::Completed | JobState::Dead => Ok(CancelOutcome::AlreadyFinished),
            JobState::Claimed | JobState::Failed => Ok(self.signal(job_id).await),
            JobState::Pending | JobState::Scheduled => {
                let now = inner.clock.now();
                let mutation = JobMutation::Dead {
                    reason: CANCELLED_REASON.to_string(),
                };
                match inner.table.apply(job_id, &mutation, now).await {
                    Ok(dead) => {
                        inner.index().remove(job_id);
                        if let Err(err) = inner.wal.append(job_id, mutation, now).await {
                            // nothing durable happened; put the job back
                            inner.index().insert(envelope.due_at, job_id);
                            inner.table.insert(envelope).await;
                            return Err(err);
                        }
                        inner.emit(
                            JobEvent::new(
                                JobEventKind::DeadLettered,
                                job_id,
                                dead.task_type,
                                dead.attempt_count,
                                elapsed_between(dead.created_at, now),
                            )
                            .with_error(CANCELLED_REASON),
                        );
                        info!(job_id = %job_id, "job cancelled");
                        Ok(CancelOutcome::Cancelled)
                    }
                    // a dispatcher claimed it between the read and the apply
                    Err(SpindleError::InvalidTransition { .. }) => Ok(self.signal(job_id).await),
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn signal(&self, job_id: JobId) -> CancelOutcome {
        self.inner.raise_cancel(job_id);
        match self.inner.table.get(job_id).await.map(|env| env.state) {
            Some(JobState::Claimed | JobState::Failed) => {
                info!(job_id = %job_id, "cancellation requested for running job");
                CancelOutcome::Signalled
            }
            _ => {
                // finished while we were looking
                self.inner.release_cancel(job_id);
                CancelOutcome::AlreadyFinished
            }
        }
    }

    /// Drop jobs that finished longer ago than the retention window from the
    /// WAL and from memory.
    pub async fn compact(&self) -> Result<CompactionReport, SpindleError> {
        self.inner.compact().await
    }

    /// Claim everything ready at `clock.now()` and run it to completion.
    pub async fn tick(&self) -> TickReport {
        let now = self.inner.clock.now();
        let batch = self.inner.claim_ready(now, usize::MAX).await;
        let mut report = TickReport {
            claimed: batch.jobs.len(),
            ..TickReport::default()
        };
        for finished in self.inner.execute_all(batch.jobs).await {
            report.record(finished);
        }
        report
    }

    /// Start the background dispatchers (and the compaction loop, if
    /// configured).
    pub fn start(&self) -> DispatcherHandle {
        DispatcherHandle::spawn(Arc::clone(&self.inner))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("wal", &self.inner.wal)
            .finish_non_exhaustive()
    }
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finished {
    Completed,
    Retrying,
    Dead,
}

/// What one `tick` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub completed: usize,
    pub retrying: usize,
    pub dead: usize,
}

impl TickReport {
    fn record(&mut self, finished: Finished) {
        match finished {
            Finished::Completed => self.completed += 1,
            Finished::Retrying => self.retrying += 1,
            Finished::Dead => self.dead += 1,
        }
    }
}

/// A wrapped method; submits calls to it.
#[derive(Clone)]
pub struct Deferred {
    engine: Engine,
    task_type: TaskType,
}

impl Deferred {
    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub async fn perform_later(&self, arguments: Arguments) -> Result<SubmitOutcome, SpindleError> {
        self.engine.submit(self.task_type.clone(), arguments, None).await
    }

    pub async fn perform_at(&self, due_at: DateTime<Utc>, arguments: Arguments) -> Result<SubmitOutcome, SpindleError> {
        self.engine.submit(self.task_type.clone(), arguments, Some(due_at)).await
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred").field("task_type", &self.task_type).finish()
    }
}

pub(crate) fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// `my_app::mail::Mailer<T>` -> `Mailer`
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
