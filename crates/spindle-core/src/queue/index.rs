//! Due-time index: which jobs become eligible when.
//!
//! Holds JobIds only; the envelopes live in the `JobTable`. Rebuilt from WAL
//! replay at startup, never persisted.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::domain::JobId;

/// `None` sorts before every timestamp, so "eligible immediately" jobs come
/// first; ties on the due time are broken by JobId.
type Key = (Option<DateTime<Utc>>, JobId);

#[derive(Debug, Default)]
pub struct DueIndex {
    entries: BTreeSet<Key>,
    by_job: HashMap<JobId, Option<DateTime<Utc>>>,
}

impl DueIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or move) a job. Each job has at most one entry.
    pub fn insert(&mut self, due_at: Option<DateTime<Utc>>, job_id: JobId) {
        if let Some(previous) = self.by_job.insert(job_id, due_at) {
            self.entries.remove(&(previous, job_id));
        }
        self.entries.insert((due_at, job_id));
    }

    /// Remove and return every job due at or before `now`, earliest first.
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        self.pop_ready_up_to(now, usize::MAX)
    }

    /// Like `pop_ready`, but takes at most `limit` jobs.
    pub fn pop_ready_up_to(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<JobId> {
        let mut ready = Vec::new();
        while ready.len() < limit {
            let Some(&(due_at, job_id)) = self.entries.first() else {
                break;
            };
            if due_at.is_some_and(|due| due > now) {
                break;
            }
            self.entries.pop_first();
            self.by_job.remove(&job_id);
            ready.push(job_id);
        }
        ready
    }

    /// Jobs due at or before `now`, without removing them.
    pub fn peek_ready(&self, now: DateTime<Utc>) -> Vec<JobId> {
        self.entries
            .iter()
            .take_while(|(due_at, _)| due_at.is_none_or(|due| due <= now))
            .map(|&(_, job_id)| job_id)
            .collect()
    }

    /// Remove a job (cancellation). Returns whether it was present.
    pub fn remove(&mut self, job_id: JobId) -> bool {
        match self.by_job.remove(&job_id) {
            Some(due_at) => self.entries.remove(&(due_at, job_id)),
            None => false,
        }
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.by_job.contains_key(&job_id)
    }

    /// Earliest entry's due time. `Some(None)` means something is ready now.
    pub fn next_due(&self) -> Option<Option<DateTime<Utc>>> {
        self.entries.first().map(|&(due_at, _)| due_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
