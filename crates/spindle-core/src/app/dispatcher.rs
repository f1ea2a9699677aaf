//! Dispatcher - claim ready jobs and run them.
//!
//! Flow for one job:
//! 1. pop from the due index
//! 2. claim CAS on the job table (`pending|scheduled -> claimed`)
//! 3. append `claimed` to the WAL (revert the claim if that fails)
//! 4. run the execution middleware chain and the handler
//! 5. record `completed`, or `failed` then `scheduled` / `dead`

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, stream};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::compaction_loop::compaction_loop;
use super::engine::{CANCELLED_REASON, EngineInner, Finished, elapsed_between};
use crate::domain::{JobEnvelope, JobEvent, JobEventKind, JobId, JobMutation};
use crate::middleware::{PerformNext, PerformOutcome};
use crate::queue::RetryPolicy;
use crate::typed::{HandlerError, JobContext};

/// Jobs claimed in one pass.
pub(crate) struct ClaimBatch {
    pub(crate) jobs: Vec<JobEnvelope>,
    /// The WAL refused a claim record; back off before trying again.
    pub(crate) stalled: bool,
}

impl EngineInner {
    /// Pop up to `limit` ready jobs and claim them.
    pub(crate) async fn claim_ready(&self, now: DateTime<Utc>, limit: usize) -> ClaimBatch {
        let ids = self.index().pop_ready_up_to(now, limit);
        let mut batch = ClaimBatch {
            jobs: Vec::with_capacity(ids.len()),
            stalled: false,
        };

        let mut ids = ids.into_iter();
        while let Some(job_id) = ids.next() {
            let Some(claim) = self.table.try_claim(job_id, now).await else {
                // cancelled, or another dispatcher won
                debug!(job_id = %job_id, "claim lost");
                continue;
            };
            let attempt = claim.envelope.attempt_count;

            if let Err(err) = self.wal.append(job_id, JobMutation::Claimed { attempt }, now).await {
                error!(job_id = %job_id, error = %err, "failed to persist claim; releasing job");
                self.table.revert_claim(&claim).await;
                let mut requeue = vec![(claim.envelope.due_at, job_id)];
                for rest in ids.by_ref() {
                    if let Some(envelope) = self.table.get(rest).await
                        && envelope.state.is_claimable()
                    {
                        requeue.push((envelope.due_at, rest));
                    }
                }
                let mut index = self.index();
                for (due_at, job_id) in requeue {
                    index.insert(due_at, job_id);
                }
                batch.stalled = true;
                break;
            }

            let envelope = claim.envelope;
            self.emit(JobEvent::new(
                JobEventKind::Claimed,
                job_id,
                envelope.task_type.clone(),
                attempt,
                elapsed_between(envelope.due_at.unwrap_or(envelope.created_at), now),
            ));
            batch.jobs.push(envelope);
        }
        batch
    }

    /// Run claimed jobs concurrently, at most `max_concurrency` at a time.
    pub(crate) async fn execute_all(&self, jobs: Vec<JobEnvelope>) -> Vec<Finished> {
        stream::iter(jobs)
            .map(|envelope| self.execute(envelope))
            .buffer_unordered(self.config.max_concurrency)
            .collect::<Vec<_>>()
            .await
    }

    /// Run one claimed job to its next durable state.
    pub(crate) async fn execute(&self, envelope: JobEnvelope) -> Finished {
        let job_id = envelope.job_id;
        let started = Instant::now();

        let finished = match self.definition(&envelope.task_type) {
            Err(err) => {
                // unknown task: nothing could ever run it
                let err = HandlerError::permanent(err.to_string());
                self.fail(&envelope, err, started.elapsed(), None).await
            }
            Ok(definition) => {
                let policy = definition.retry().cloned().unwrap_or_else(|| self.retry.clone());
                let ctx = JobContext::new(&envelope, policy.max_attempts, self.watch_cancel(job_id));
                let run = PerformNext::new(&self.perform_chain, definition.handler().as_ref()).run(&ctx);
                let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => PerformOutcome::Failed(HandlerError::new(format!(
                        "handler panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                };
                let elapsed = started.elapsed();

                match outcome {
                    PerformOutcome::Succeeded | PerformOutcome::Skipped => {
                        if matches!(outcome, PerformOutcome::Skipped) {
                            debug!(job_id = %job_id, "execution middleware skipped the handler");
                        }
                        self.complete(&envelope, elapsed).await
                    }
                    PerformOutcome::Failed(err) => {
                        let retry = (!err.is_permanent()).then_some(&policy);
                        self.fail(&envelope, err, elapsed, retry).await
                    }
                }
            }
        };

        self.release_cancel(job_id);
        finished
    }

    async fn complete(&self, envelope: &JobEnvelope, elapsed: Duration) -> Finished {
        let now = self.clock.now();
        self.record(envelope.job_id, JobMutation::Completed, now).await;
        self.emit(JobEvent::new(
            JobEventKind::Completed,
            envelope.job_id,
            envelope.task_type.clone(),
            envelope.attempt_count,
            elapsed,
        ));
        Finished::Completed
    }

    /// Record a failure, then either schedule a retry or dead-letter the job.
    /// `policy` is `None` when the failure must not be retried.
    async fn fail(
        &self,
        envelope: &JobEnvelope,
        err: HandlerError,
        elapsed: Duration,
        policy: Option<&RetryPolicy>,
    ) -> Finished {
        let job_id = envelope.job_id;
        let attempt = envelope.attempt_count;
        let now = self.clock.now();

        self.record(
            job_id,
            JobMutation::Failed {
                error: err.message().to_string(),
            },
            now,
        )
        .await;
        self.emit(
            JobEvent::new(JobEventKind::Failed, job_id, envelope.task_type.clone(), attempt, elapsed)
                .with_error(err.message()),
        );

        let cancelled = self.is_cancel_requested(job_id);
        let next_due = match policy {
            Some(policy) if !cancelled => policy.next_due(attempt, now),
            _ => None,
        };

        match next_due {
            Some(due_at) => {
                self.record(job_id, JobMutation::Scheduled { due_at }, now).await;
                self.index().insert(Some(due_at), job_id);
                self.notify.notify_waiters();
                info!(job_id = %job_id, attempt, due_at = %due_at, "retry scheduled");
                self.emit(
                    JobEvent::new(
                        JobEventKind::RetryScheduled,
                        job_id,
                        envelope.task_type.clone(),
                        attempt,
                        elapsed_between(now, due_at),
                    )
                    .with_error(err.message()),
                );
                Finished::Retrying
            }
            None => {
                let reason = if cancelled {
                    CANCELLED_REASON.to_string()
                } else {
                    err.message().to_string()
                };
                self.record(job_id, JobMutation::Dead { reason: reason.clone() }, now).await;
                self.emit(
                    JobEvent::new(
                        JobEventKind::DeadLettered,
                        job_id,
                        envelope.task_type.clone(),
                        attempt,
                        elapsed_between(envelope.created_at, now),
                    )
                    .with_error(reason),
                );
                Finished::Dead
            }
        }
    }

    /// Apply a post-claim mutation in memory, then persist it. A WAL failure
    /// here is logged, not propagated: the job stays claimed on disk and is
    /// redelivered after a restart.
    async fn record(&self, job_id: JobId, mutation: JobMutation, at: DateTime<Utc>) {
        if let Err(err) = self.table.apply(job_id, &mutation, at).await {
            warn!(job_id = %job_id, error = %err, "in-memory transition rejected");
            return;
        }
        let op = mutation.name();
        if let Err(err) = self.wal.append(job_id, mutation, at).await {
            error!(job_id = %job_id, op, error = %err, "failed to persist job transition");
        }
    }

    /// How long an idle dispatcher may sleep before something becomes due.
    fn idle_wait(&self, now: DateTime<Utc>) -> Duration {
        let poll = self.config.poll_interval();
        match self.index().next_due() {
            None => poll,
            Some(None) => Duration::ZERO,
            Some(Some(due_at)) => elapsed_between(now, due_at).min(poll),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Background dispatcher group handle.
/// - `request_shutdown()` stops every dispatcher from claiming new jobs
/// - `shutdown_and_join()` also waits for in-flight executions to finish
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub(crate) fn spawn(inner: Arc<EngineInner>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(inner.config.max_concurrency));

        let n = inner.config.dispatchers;
        let mut joins = Vec::with_capacity(n + 1);
        for worker_id in 0..n {
            let inner = Arc::clone(&inner);
            let semaphore = Arc::clone(&semaphore);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(dispatcher_loop(worker_id, inner, semaphore, rx)));
        }
        if let Some(interval) = inner.config.compact_interval() {
            joins.push(tokio::spawn(compaction_loop(Arc::clone(&inner), interval, shutdown_rx)));
        }
        info!(dispatchers = n, max_concurrency = inner.config.max_concurrency, "dispatchers started");

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "dispatcher task failed");
            }
        }
        info!("dispatchers stopped");
    }
}

async fn dispatcher_loop(
    worker_id: usize,
    inner: Arc<EngineInner>,
    semaphore: Arc<Semaphore>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        while let Some(done) = in_flight.try_join_next() {
            if let Err(err) = done {
                error!(worker_id, error = %err, "execution task failed");
            }
        }

        let permit = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // register interest before looking, so a submission landing in
        // between still wakes us
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let now = inner.clock.now();
        let batch = inner.claim_ready(now, 1).await;
        if let Some(envelope) = batch.jobs.into_iter().next() {
            let inner = Arc::clone(&inner);
            in_flight.spawn(async move {
                let _permit = permit;
                inner.execute(envelope).await;
            });
            continue;
        }
        drop(permit);

        let wait = if batch.stalled {
            inner.config.poll_interval()
        } else {
            inner.idle_wait(now)
        };
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = &mut notified => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    debug!(worker_id, in_flight = in_flight.len(), "dispatcher draining");
    while let Some(done) = in_flight.join_next().await {
        if let Err(err) = done {
            error!(worker_id, error = %err, "execution task failed");
        }
    }
}
