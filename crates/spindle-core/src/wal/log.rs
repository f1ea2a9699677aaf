//! Durable append-only log file.
//!
//! Design:
//! - One JSON record per line, appended by a single writer under a mutex.
//! - `append` returns only after the line is flushed and fsynced.
//! - A torn (newline-less) tail left by a crash is terminated on open, so the
//!   next record starts on a fresh line and the torn one is skipped on replay.
//! - Compaction rewrites the live records into `<path>.compact`, fsyncs it and
//!   renames it over the log while still holding the writer lock.
//! - One writer per log: `open` takes an exclusive lock on `<path>.lock` and
//!   holds it until the `Wal` is dropped. The lock lives beside the log
//!   because compaction replaces the log file itself.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::codec::encode_record;
use super::record::WalRecord;
use super::replay::Replay;
use crate::domain::{JobId, JobMutation};
use crate::error::SpindleError;

struct Writer {
    file: File,
    next_seq: u64,
    /// Set when a write may have left a partial line behind.
    needs_newline: bool,
}

/// What a compaction pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub kept_records: usize,
    pub dropped_records: usize,
    pub dropped_jobs: Vec<JobId>,
    /// Records that were already unreadable and are not carried over.
    pub skipped_records: usize,
}

pub struct Wal {
    path: PathBuf,
    writer: Mutex<Writer>,
    _lock: std::fs::File,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl Wal {
    /// Open (or create) the log at `path` and replay it.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, Replay), SpindleError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let lock = acquire_lock(&path).await?;
        let data = read_or_empty(&path).await?;
        let replay = Replay::from_bytes(&data);

        let mut file = open_for_append(&path).await?;
        if !data.is_empty() && !data.ends_with(b"\n") {
            warn!(path = %path.display(), "terminating torn wal tail");
            file.write_all(b"\n").await?;
            file.flush().await?;
            file.sync_data().await?;
        }

        info!(
            path = %path.display(),
            jobs = replay.len(),
            last_seq = replay.last_seq,
            skipped = replay.skipped,
            "wal opened"
        );

        let wal = Self {
            path,
            writer: Mutex::new(Writer {
                file,
                next_seq: replay.next_seq(),
                needs_newline: false,
            }),
            _lock: lock,
            #[cfg(test)]
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        };
        Ok((wal, replay))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one mutation and make it durable.
    pub async fn append(&self, job_id: JobId, op: JobMutation, at: DateTime<Utc>) -> Result<WalRecord, SpindleError> {
        let mut writer = self.writer.lock().await;
        let record = WalRecord::new(writer.next_seq, at, job_id, op);

        let mut line = Vec::new();
        if writer.needs_newline {
            line.push(b'\n');
        }
        line.extend(encode_record(&record)?);

        // a sequence number is burned once a write is attempted; replay
        // tolerates the gap but never a reused number
        writer.next_seq += 1;
        if let Err(err) = self.write_line(&mut writer.file, &line).await {
            writer.needs_newline = true;
            return Err(err.into());
        }
        writer.needs_newline = false;

        debug!(seq = record.seq, job_id = %job_id, op = record.op.name(), "wal append");
        Ok(record)
    }

    /// Re-read the whole log from disk.
    pub async fn replay(&self) -> Result<Replay, SpindleError> {
        let _writer = self.writer.lock().await;
        let data = read_or_empty(&self.path).await?;
        Ok(Replay::from_bytes(&data))
    }

    /// Drop every record of jobs that reached a terminal state before
    /// `cutoff`, renumbering what is left from 1.
    pub async fn compact(&self, cutoff: DateTime<Utc>) -> Result<CompactionReport, SpindleError> {
        let mut writer = self.writer.lock().await;

        let data = read_or_empty(&self.path).await?;
        let replay = Replay::from_bytes_keeping_records(&data);
        let dropped: HashSet<JobId> = replay
            .jobs()
            .filter(|env| env.state.is_terminal() && env.updated_at < cutoff)
            .map(|env| env.job_id)
            .collect();
        let skipped_records = replay.skipped;

        let mut report = CompactionReport {
            skipped_records,
            ..CompactionReport::default()
        };
        let mut out = Vec::new();
        for mut record in replay.into_accepted_records() {
            if dropped.contains(&record.job_id) {
                report.dropped_records += 1;
                continue;
            }
            report.kept_records += 1;
            record.seq = report.kept_records as u64;
            out.extend(encode_record(&record)?);
        }
        report.dropped_jobs = dropped.into_iter().collect();
        report.dropped_jobs.sort();

        let tmp = self.compaction_path();
        let mut file = File::create(&tmp).await?;
        file.write_all(&out).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        sync_parent_dir(&self.path).await;

        writer.file = open_for_append(&self.path).await?;
        writer.next_seq = report.kept_records as u64 + 1;
        writer.needs_newline = false;

        info!(
            kept = report.kept_records,
            dropped = report.dropped_records,
            dropped_jobs = report.dropped_jobs.len(),
            "wal compacted"
        );
        Ok(report)
    }

    fn compaction_path(&self) -> PathBuf {
        sibling(&self.path, ".compact")
    }

    async fn write_line(&self, file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::other("simulated write failure"));
        }
        write_durably(file, bytes).await
    }

    /// Make every following append fail, as a full disk would.
    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish_non_exhaustive()
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn acquire_lock(path: &Path) -> Result<std::fs::File, SpindleError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(sibling(path, ".lock"))
        .await?
        .into_std()
        .await;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(std::fs::TryLockError::WouldBlock) => Err(SpindleError::WalLocked(path.to_path_buf())),
        Err(std::fs::TryLockError::Error(err)) => Err(err.into()),
    }
}

async fn read_or_empty(path: &Path) -> Result<Vec<u8>, SpindleError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(data),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

async fn open_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn write_durably(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Best effort: make the rename itself durable.
async fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    match File::open(parent).await {
        Ok(dir) => {
            if let Err(err) = dir.sync_all().await {
                debug!(error = %err, "directory fsync unsupported");
            }
        }
        Err(err) => debug!(error = %err, "could not open wal directory for fsync"),
    }
}
