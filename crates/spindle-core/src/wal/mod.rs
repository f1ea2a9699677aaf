//! Write-ahead log: the only persisted artifact.

pub mod codec;
pub mod log;
pub mod record;
pub mod replay;

pub use codec::{FORMAT_VERSION, decode_envelope, decode_record, encode_envelope, encode_record};
pub use log::{CompactionReport, Wal};
pub use record::WalRecord;
pub use replay::Replay;
