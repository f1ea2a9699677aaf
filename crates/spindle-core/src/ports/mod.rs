//! Ports - seams for time, id generation and telemetry.

pub mod clock;
pub mod event_sink;
pub mod id_generator;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
