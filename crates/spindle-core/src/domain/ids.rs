//! Job identifiers.
//!
//! Jobs are identified by ULIDs (Universally Unique Lexicographically Sortable
//! Identifier):
//! - **time-ordered**: the timestamp comes first, so ids sort by creation time
//! - **no coordination**: generated locally without a central counter
//! - **128-bit**: same size as a UUID
//!
//! The due-time index breaks ties between jobs with the same `due_at` by
//! `JobId`, so the ordering of ids is part of the dispatch order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

const PREFIX: &str = "job-";

/// Identifier of a job (submit / claim / cancel unit).
///
/// Serialized as the bare ULID string; displayed with a `job-` prefix.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Ulid);

impl JobId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for JobId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ulid::DecodeError;

    /// Accepts both `job-<ulid>` and a bare `<ulid>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(PREFIX).unwrap_or(s);
        Ulid::from_string(raw).map(Self)
    }
}
