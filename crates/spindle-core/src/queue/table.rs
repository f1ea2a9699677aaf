//! In-memory job table: the live view of every envelope.
//!
//! Design:
//! - Holds the current envelope of every job the WAL knows about (terminal
//!   ones included, until compaction).
//! - The claim compare-and-swap happens here, under the write lock, and is
//!   the only hard mutual-exclusion point on the execution path.
//! - Locks are never held across an await on anything else (WAL, handlers).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::app::status::QueueCounts;
use crate::domain::{JobEnvelope, JobId, JobMutation, JobState};
use crate::error::SpindleError;

/// A successful claim: the claimed envelope, plus what it looked like before
/// so the claim can be reverted if the WAL append fails.
#[derive(Debug, Clone)]
pub struct Claim {
    pub envelope: JobEnvelope,
    pub previous_state: JobState,
    pub previous_updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<JobId, JobEnvelope>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_envelopes(envelopes: impl IntoIterator<Item = JobEnvelope>) -> Self {
        let jobs = envelopes.into_iter().map(|env| (env.job_id, env)).collect();
        Self {
            jobs: RwLock::new(jobs),
        }
    }

    pub async fn insert(&self, envelope: JobEnvelope) {
        self.jobs.write().await.insert(envelope.job_id, envelope);
    }

    pub async fn get(&self, job_id: JobId) -> Option<JobEnvelope> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    /// Compare-and-swap `pending|scheduled -> claimed`, bumping the attempt
    /// count. Returns `None` if the job is gone or not claimable, i.e.
    /// somebody else got there first.
    pub async fn try_claim(&self, job_id: JobId, at: DateTime<Utc>) -> Option<Claim> {
        let mut jobs = self.jobs.write().await;
        let envelope = jobs.get_mut(&job_id)?;
        if !envelope.state.is_claimable() {
            return None;
        }
        let previous_state = envelope.state;
        let previous_updated_at = envelope.updated_at;
        let attempt = envelope.attempt_count + 1;
        envelope.apply(&JobMutation::Claimed { attempt }, at).ok()?;
        Some(Claim {
            envelope: envelope.clone(),
            previous_state,
            previous_updated_at,
        })
    }

    /// Undo a claim whose WAL record could not be written.
    pub async fn revert_claim(&self, claim: &Claim) {
        let mut jobs = self.jobs.write().await;
        if let Some(envelope) = jobs.get_mut(&claim.envelope.job_id)
            && envelope.state == JobState::Claimed
        {
            envelope.state = claim.previous_state;
            envelope.attempt_count = envelope.attempt_count.saturating_sub(1);
            envelope.updated_at = claim.previous_updated_at;
        }
    }

    /// Apply a mutation through the state machine; returns the new envelope.
    pub async fn apply(&self, job_id: JobId, mutation: &JobMutation, at: DateTime<Utc>) -> Result<JobEnvelope, SpindleError> {
        let mut jobs = self.jobs.write().await;
        let envelope = jobs.get_mut(&job_id).ok_or(SpindleError::JobNotFound(job_id))?;
        envelope
            .apply(mutation, at)
            .map_err(|source| SpindleError::InvalidTransition { job_id, source })?;
        Ok(envelope.clone())
    }

    /// Snapshot of jobs, optionally filtered by state, ordered by JobId.
    pub async fn list(&self, state: Option<JobState>) -> Vec<JobEnvelope> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<JobEnvelope> = jobs
            .values()
            .filter(|env| state.is_none_or(|s| env.state == s))
            .cloned()
            .collect();
        out.sort_by_key(|env| env.job_id);
        out
    }

    pub async fn counts(&self) -> QueueCounts {
        let jobs = self.jobs.read().await;
        QueueCounts::from_states(jobs.values().map(|env| env.state))
    }

    pub async fn remove_all(&self, job_ids: &[JobId]) {
        let mut jobs = self.jobs.write().await;
        for job_id in job_ids {
            jobs.remove(job_id);
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
