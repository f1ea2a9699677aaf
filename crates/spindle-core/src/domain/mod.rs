//! Domain model (ids, task types, envelopes, states, events).

pub mod envelope;
pub mod events;
pub mod ids;
pub mod state;
pub mod task;

pub use envelope::{InvalidTransition, JobEnvelope, JobMutation};
pub use events::{JobEvent, JobEventKind};
pub use ids::JobId;
pub use state::JobState;
pub use task::{Arguments, TaskType};
