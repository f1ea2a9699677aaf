//! Middleware chains around submission and execution.
//!
//! Interceptors compose outer-to-inner in registration order. Each receives
//! an explicit continuation value (`SubmitNext` / `PerformNext`) holding the
//! rest of the chain; not running it short-circuits.

pub mod perform;
pub mod submit;

pub use self::perform::{PerformMiddleware, PerformNext, PerformOutcome};
pub use self::submit::{SubmitContext, SubmitMiddleware, SubmitNext, SubmitOutcome, SubmitSink};
