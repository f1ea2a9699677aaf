//! JobEnvelope: the durable unit of state, and the mutations applied to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Arguments, JobId, JobState, TaskType};

/// Identity, arguments and lifecycle state of one job.
///
/// Design:
/// - This is the single source of truth for a job, both in memory and
///   (as a fold over WAL records) on disk.
/// - All state transitions go through [`JobEnvelope::apply`], so the WAL
///   replay and the live dispatcher share one state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: JobId,
    pub task_type: TaskType,
    pub arguments: Arguments,
    pub created_at: DateTime<Utc>,

    /// `None` means eligible immediately.
    pub due_at: Option<DateTime<Utc>>,

    pub state: JobState,

    /// Incremented on every claim.
    pub attempt_count: u32,

    /// Last handler error, or the dead-letter reason.
    pub last_error: Option<String>,

    pub updated_at: DateTime<Utc>,
}

/// A state mutation, as written to the WAL.
///
/// `Submitted` carries the whole initial envelope; every other variant is a
/// delta on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JobMutation {
    Submitted { envelope: Box<JobEnvelope> },
    Claimed { attempt: u32 },
    Completed,
    Failed { error: String },
    Scheduled { due_at: DateTime<Utc> },
    Dead { reason: String },
    /// Found `claimed` or `failed` on restart and handed back for redelivery.
    Recovered,
}

impl JobMutation {
    /// State the job is in after this mutation.
    pub fn target_state(&self) -> JobState {
        match self {
            JobMutation::Submitted { envelope } => envelope.state,
            JobMutation::Claimed { .. } => JobState::Claimed,
            JobMutation::Completed => JobState::Completed,
            JobMutation::Failed { .. } => JobState::Failed,
            JobMutation::Scheduled { .. } => JobState::Scheduled,
            JobMutation::Dead { .. } => JobState::Dead,
            JobMutation::Recovered => JobState::Pending,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobMutation::Submitted { .. } => "submitted",
            JobMutation::Claimed { .. } => "claimed",
            JobMutation::Completed => "completed",
            JobMutation::Failed { .. } => "failed",
            JobMutation::Scheduled { .. } => "scheduled",
            JobMutation::Dead { .. } => "dead",
            JobMutation::Recovered => "recovered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to} ({mutation})")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
    pub mutation: &'static str,
}

impl JobEnvelope {
    pub fn new(
        job_id: JobId,
        task_type: TaskType,
        arguments: Arguments,
        created_at: DateTime<Utc>,
        due_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            job_id,
            task_type,
            arguments,
            created_at,
            due_at,
            state: JobState::Pending,
            attempt_count: 0,
            last_error: None,
            updated_at: created_at,
        }
    }

    /// Is the job eligible to run at `now`?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at.is_none_or(|due| due <= now)
    }

    /// Apply a mutation, enforcing the state machine.
    pub fn apply(&mut self, mutation: &JobMutation, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let to = mutation.target_state();
        let invalid = InvalidTransition {
            from: self.state,
            to,
            mutation: mutation.name(),
        };
        if matches!(mutation, JobMutation::Submitted { .. }) || !self.state.can_transition_to(to) {
            return Err(invalid);
        }

        match mutation {
            JobMutation::Claimed { attempt } => self.attempt_count = *attempt,
            JobMutation::Failed { error } => self.last_error = Some(error.clone()),
            JobMutation::Scheduled { due_at } => self.due_at = Some(*due_at),
            JobMutation::Dead { reason } => self.last_error = Some(reason.clone()),
            JobMutation::Completed | JobMutation::Recovered | JobMutation::Submitted { .. } => {}
        }
        self.state = to;
        self.updated_at = at;
        Ok(())
    }

    /// Reset a job interrupted mid-flight (found `claimed` or `failed` after a
    /// restart) so it is redelivered. Returns whether anything changed.
    ///
    /// The reset is in memory only; the caller persists it as
    /// [`JobMutation::Recovered`] so later records for the job still apply.
    pub fn recover(&mut self, at: DateTime<Utc>) -> bool {
        self.apply(&JobMutation::Recovered, at).is_ok()
    }
}
