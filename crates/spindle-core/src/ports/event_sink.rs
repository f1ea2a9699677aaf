//! EventSink port - where job telemetry goes.
//!
//! Sinks are called inline on the dispatch path, so `emit` must not block.
//! Implementations live in `impls::sinks`.

use crate::domain::JobEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &JobEvent);
}
