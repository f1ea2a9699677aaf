//! App - the engine assembled from ports, queue and WAL.
//!
//! # Components
//! - **EngineBuilder**: registration, wiring, replay on open
//! - **Engine**: submission, introspection, cancellation, compaction
//! - **Dispatcher**: claim -> run -> record, in the foreground (`tick`) or in
//!   background workers
//! - **Compaction loop**: periodic WAL garbage collection

pub mod builder;
mod compaction_loop;
pub mod dispatcher;
pub mod engine;
pub mod status;

pub use self::builder::EngineBuilder;
pub use self::dispatcher::DispatcherHandle;
pub use self::engine::{CANCELLED_REASON, CancelOutcome, Deferred, Engine, Finished, TickReport};
pub use self::status::QueueCounts;
