//! Job state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a job.
///
/// State transitions:
/// - Pending -> Claimed -> Completed
/// - Pending -> Claimed -> Failed -> Scheduled -> Claimed -> ... (retry loop)
/// - Failed -> Dead (retry policy exhausted, or the failure is fatal)
/// - Pending | Scheduled -> Dead (cancelled before being claimed)
/// - Claimed | Failed -> Pending (interrupted by a restart, redelivered)
///
/// Only `Pending` and `Scheduled` jobs live in the due-time index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, waiting for its due time (or eligible right away).
    Pending,

    /// Waiting for a retry after a failed attempt.
    Scheduled,

    /// Owned by a dispatcher; the handler is running.
    Claimed,

    /// Finished successfully.
    Completed,

    /// The last attempt failed; a retry decision follows.
    Failed,

    /// Dead-lettered. Never retried, kept until compaction.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Scheduled,
        JobState::Claimed,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// May this job sit in the due-time index (and be claimed)?
    pub fn is_claimable(self) -> bool {
        matches!(self, JobState::Pending | JobState::Scheduled)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending | Scheduled, Claimed)
                | (Pending | Scheduled, Dead)
                | (Claimed, Completed | Failed)
                | (Failed, Scheduled | Dead)
                | (Claimed | Failed, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Scheduled => "scheduled",
            JobState::Claimed => "claimed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}
