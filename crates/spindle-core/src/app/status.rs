//! Status - queue introspection views.

use serde::Serialize;

use crate::domain::JobState;

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl QueueCounts {
    pub fn from_states(states: impl IntoIterator<Item = JobState>) -> Self {
        let mut counts = Self::default();
        for state in states {
            match state {
                JobState::Pending => counts.pending += 1,
                JobState::Scheduled => counts.scheduled += 1,
                JobState::Claimed => counts.claimed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Dead => counts.dead += 1,
            }
        }
        counts
    }

    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Scheduled => self.scheduled,
            JobState::Claimed => self.claimed,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn total(&self) -> usize {
        JobState::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Jobs that still have work ahead of them.
    pub fn outstanding(&self) -> usize {
        self.pending + self.scheduled + self.claimed + self.failed
    }
}
