//! Implementations of the ports.

pub mod sinks;

pub use self::sinks::{BroadcastEventSink, TracingEventSink};
