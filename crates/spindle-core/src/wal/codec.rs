//! Envelope codec: versioned JSON for envelopes and WAL lines.
//!
//! Decoding never panics; anything malformed comes back as
//! `SpindleError::CorruptRecord`, which the WAL reader logs and skips.

use serde::{Deserialize, Serialize};

use super::record::WalRecord;
use crate::domain::{JobEnvelope, JobMutation};
use crate::error::SpindleError;

pub const FORMAT_VERSION: u8 = 1;

#[derive(Serialize)]
struct EnvelopeFrameRef<'a> {
    v: u8,
    envelope: &'a JobEnvelope,
}

#[derive(Deserialize)]
struct EnvelopeFrame {
    v: u8,
    envelope: JobEnvelope,
}

pub fn encode_envelope(envelope: &JobEnvelope) -> Result<Vec<u8>, SpindleError> {
    let frame = EnvelopeFrameRef {
        v: FORMAT_VERSION,
        envelope,
    };
    Ok(serde_json::to_vec(&frame)?)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<JobEnvelope, SpindleError> {
    let frame: EnvelopeFrame = serde_json::from_slice(bytes)
        .map_err(|e| SpindleError::CorruptRecord(format!("envelope: {e}")))?;
    check_version(frame.v)?;
    Ok(frame.envelope)
}

/// Encode one WAL line, including the trailing newline.
pub fn encode_record(record: &WalRecord) -> Result<Vec<u8>, SpindleError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_record(line: &[u8]) -> Result<WalRecord, SpindleError> {
    let line = line.trim_ascii_end();
    let record: WalRecord = serde_json::from_slice(line)
        .map_err(|e| SpindleError::CorruptRecord(format!("record: {e}")))?;
    check_version(record.v)?;
    if let JobMutation::Submitted { envelope } = &record.op
        && envelope.job_id != record.job_id
    {
        return Err(SpindleError::CorruptRecord(format!(
            "seq {}: envelope {} filed under {}",
            record.seq, envelope.job_id, record.job_id
        )));
    }
    Ok(record)
}

fn check_version(v: u8) -> Result<(), SpindleError> {
    if v == FORMAT_VERSION {
        Ok(())
    } else {
        Err(SpindleError::CorruptRecord(format!("unsupported format version {v}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Arguments, JobId, JobState, TaskType};
    use chrono::{TimeDelta, TimeZone, Utc};
    use serde_json::json;
    use ulid::Ulid;

    fn envelope() -> JobEnvelope {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut arguments = Arguments::new();
        arguments.insert("to".into(), json!("a@example.com"));
        arguments.insert("tags".into(), json!(["welcome", 1, null, { "nested": 0.25 }]));
        JobEnvelope::new(
            JobId::from_ulid(Ulid::new()),
            TaskType::new("send_email"),
            arguments,
            at,
            Some(at + TimeDelta::minutes(5)),
        )
    }

    #[test]
    fn envelope_round_trips() {
        let fresh = envelope();
        assert_eq!(decode_envelope(&encode_envelope(&fresh).unwrap()).unwrap(), fresh);

        // a dead-lettered envelope with every optional field populated
        let mut dead = envelope();
        dead.state = JobState::Dead;
        dead.attempt_count = 3;
        dead.last_error = Some("card declined: \"insufficient funds\"\n".into());
        dead.updated_at += TimeDelta::nanoseconds(123_456_789);
        assert_eq!(decode_envelope(&encode_envelope(&dead).unwrap()).unwrap(), dead);
    }

    #[test]
    fn record_round_trips_as_one_line() {
        let env = envelope();
        let record = WalRecord::new(
            7,
            env.created_at,
            env.job_id,
            JobMutation::Submitted {
                envelope: Box::new(env.clone()),
            },
        );

        let line = encode_record(&record).unwrap();
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert!(line.ends_with(b"\n"));
        assert_eq!(decode_record(&line).unwrap(), record);
    }

    #[test]
    fn malformed_input_is_corrupt() {
        let line = encode_record(&WalRecord::new(1, Utc::now(), JobId::from_ulid(Ulid::new()), JobMutation::Completed)).unwrap();
        let torn = &line[..line.len() / 2];

        assert!(matches!(decode_record(torn), Err(SpindleError::CorruptRecord(_))));
        assert!(matches!(decode_record(b"\x00\x01garbage"), Err(SpindleError::CorruptRecord(_))));
        assert!(matches!(decode_envelope(b"{}"), Err(SpindleError::CorruptRecord(_))));
    }

    #[test]
    fn unknown_version_is_corrupt() {
        let mut record = WalRecord::new(1, Utc::now(), JobId::from_ulid(Ulid::new()), JobMutation::Completed);
        record.v = 9;
        let line = serde_json::to_vec(&record).unwrap();

        let err = decode_record(&line).unwrap_err();
        assert!(err.to_string().contains("version 9"));
    }

    #[test]
    fn submitted_envelope_must_match_record_job() {
        let env = envelope();
        let record = WalRecord::new(
            1,
            env.created_at,
            JobId::from_ulid(Ulid::new()),
            JobMutation::Submitted { envelope: Box::new(env) },
        );
        let line = encode_record(&record).unwrap();
        assert!(matches!(decode_record(&line), Err(SpindleError::CorruptRecord(_))));
    }
}
