//! Queue module: live job table, due-time index and retry policy.

pub mod index;
pub mod retry;
pub mod table;

pub use index::DueIndex;
pub use retry::RetryPolicy;
pub use table::{Claim, JobTable};
