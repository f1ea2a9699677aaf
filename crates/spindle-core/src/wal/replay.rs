//! WAL replay: fold the records back into envelopes.

use std::collections::BTreeMap;

use tracing::{info, warn};

use super::codec::decode_record;
use super::record::WalRecord;
use crate::domain::{JobEnvelope, JobId, JobMutation};

/// Result of replaying a WAL.
///
/// Every per-record problem (corrupt line, out-of-order sequence number,
/// record for an unknown job, invalid transition) is logged and skipped; one
/// damaged record never blocks recovery of the rest.
#[derive(Debug, Default)]
pub struct Replay {
    jobs: BTreeMap<JobId, JobEnvelope>,
    accepted: Vec<WalRecord>,
    keep_records: bool,
    /// Sequence number of the last accepted record (0 for an empty log).
    pub last_seq: u64,
    pub skipped: usize,
    /// Jobs found mid-flight (claimed, or failed without a retry decision)
    /// and reset to pending for redelivery. Not yet on disk: the engine
    /// appends a `recovered` record for each before dispatching.
    pub recovered: Vec<JobId>,
}

impl Replay {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::fold(data, false)
    }

    /// Replay, also keeping every accepted record (for compaction).
    pub(crate) fn from_bytes_keeping_records(data: &[u8]) -> Self {
        Self::fold(data, true)
    }

    fn fold(data: &[u8], keep_records: bool) -> Self {
        let mut replay = Replay {
            keep_records,
            ..Replay::default()
        };
        for (n, line) in data.split(|b| *b == b'\n').enumerate() {
            if line.trim_ascii().is_empty() {
                continue;
            }
            match decode_record(line) {
                Ok(record) => replay.accept(n + 1, record),
                Err(err) => {
                    warn!(line = n + 1, error = %err, "skipping corrupt wal record");
                    replay.skipped += 1;
                }
            }
        }

        for envelope in replay.jobs.values_mut() {
            let at = envelope.updated_at;
            if envelope.recover(at) {
                replay.recovered.push(envelope.job_id);
            }
        }
        if !replay.recovered.is_empty() {
            info!(count = replay.recovered.len(), "redelivering jobs interrupted mid-flight");
        }
        replay
    }

    fn accept(&mut self, line: usize, record: WalRecord) {
        if record.seq <= self.last_seq {
            warn!(line, seq = record.seq, last_seq = self.last_seq, "skipping out-of-order wal record");
            self.skipped += 1;
            return;
        }
        if record.seq != self.last_seq + 1 {
            warn!(line, seq = record.seq, expected = self.last_seq + 1, "gap in wal sequence");
        }

        let applied = match &record.op {
            JobMutation::Submitted { envelope } => {
                if self.jobs.contains_key(&record.job_id) {
                    warn!(line, job_id = %record.job_id, "duplicate submission record");
                    false
                } else {
                    self.jobs.insert(record.job_id, envelope.as_ref().clone());
                    true
                }
            }
            op => match self.jobs.get_mut(&record.job_id) {
                Some(envelope) => match envelope.apply(op, record.at) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(line, job_id = %record.job_id, error = %err, "skipping invalid wal transition");
                        false
                    }
                },
                None => {
                    warn!(line, job_id = %record.job_id, op = op.name(), "wal record for unknown job");
                    false
                }
            },
        };

        // the sequence number is consumed either way
        self.last_seq = record.seq;
        if applied {
            if self.keep_records {
                self.accepted.push(record);
            }
        } else {
            self.skipped += 1;
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.last_seq + 1
    }

    pub fn get(&self, job_id: JobId) -> Option<&JobEnvelope> {
        self.jobs.get(&job_id)
    }

    /// Every job, terminal ones included, ordered by JobId.
    pub fn jobs(&self) -> impl Iterator<Item = &JobEnvelope> {
        self.jobs.values()
    }

    /// Non-terminal jobs, ordered by JobId: what goes back into the index.
    pub fn live(&self) -> Vec<JobEnvelope> {
        self.jobs.values().filter(|env| !env.state.is_terminal()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn into_jobs(self) -> Vec<JobEnvelope> {
        self.jobs.into_values().collect()
    }

    pub(crate) fn into_accepted_records(self) -> Vec<WalRecord> {
        self.accepted
    }
}
