//! spindle-core
//!
//! Durable in-process background jobs: submit now, run later, survive a
//! restart.
//!
//! # Modules
//! - **domain**: envelopes, mutations, states, ids, events
//! - **wal**: versioned JSON-lines write-ahead log (codec, replay, compaction)
//! - **queue**: live job table (claim CAS), due-time index, retry policy
//! - **typed**: `Task` / `Handler` API, task registry, job context
//! - **middleware**: submission and execution interceptor chains
//! - **ports**: clock, id generator, event sink
//! - **impls**: tracing and broadcast event sinks
//! - **app**: `EngineBuilder`, `Engine`, dispatchers
//! - **config** / **trace**: TOML configuration and subscriber setup

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod middleware;
pub mod ports;
pub mod queue;
pub mod trace;
pub mod typed;
pub mod wal;

pub use app::{CancelOutcome, Deferred, DispatcherHandle, Engine, EngineBuilder, QueueCounts, TickReport};
pub use config::{EngineConfig, LogFormat, RetryConfig};
pub use domain::{Arguments, JobEnvelope, JobEvent, JobEventKind, JobId, JobState, TaskType};
pub use error::SpindleError;
pub use middleware::{PerformMiddleware, PerformNext, PerformOutcome, SubmitContext, SubmitMiddleware, SubmitNext, SubmitOutcome};
pub use queue::RetryPolicy;
pub use typed::{Handler, HandlerError, JobContext, Task, TaskDefinition, TaskHandler};
