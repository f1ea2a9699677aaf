use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::codec::FORMAT_VERSION;
use crate::domain::{JobId, JobMutation};

/// One line of the WAL: a sequence-numbered mutation of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Format version.
    pub v: u8,
    /// Strictly increasing and gap-free within one WAL generation.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub job_id: JobId,
    pub op: JobMutation,
}

impl WalRecord {
    pub fn new(seq: u64, at: DateTime<Utc>, job_id: JobId, op: JobMutation) -> Self {
        Self {
            v: FORMAT_VERSION,
            seq,
            at,
            job_id,
            op,
        }
    }
}
