//! Task registry and handler API.
//!
//! - **Typed surface**: `Task` trait, `Handler<T>` trait - task type strings are
//!   bound to Rust types, so a handler can only receive its own arguments
//! - **Erased core**: `TaskHandler` trait - object-safe, what the registry holds

pub mod context;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::context::JobContext;
pub use self::handler::{FnHandler, Handler, HandlerError, TaskHandler, TypedHandler};
pub use self::registry::{TaskDefinition, TaskRegistry};
pub use self::task::Task;
