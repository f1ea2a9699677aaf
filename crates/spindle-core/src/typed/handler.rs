//! Handlers - the code a task type runs.
//!
//! Two layers:
//! - `Handler<T>`: typed, one per `Task` type, checked at compile time
//! - `TaskHandler`: object-safe, what the registry stores
//!
//! `TypedHandler<T, H>` erases the type of a `Handler<T>`; `FnHandler` adapts
//! a plain async closure (used for ad hoc tasks registered by `wrap`).

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::context::JobContext;
use super::task::Task;
use crate::domain::Arguments;

/// Error returned by a handler. Caught by the dispatcher and fed into the
/// retry policy; never reaches the submitter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    permanent: bool,
}

impl HandlerError {
    /// A failure worth retrying.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    /// A failure that dead-letters the job right away.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Object-safe handler stored in the registry.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn perform(&self, ctx: &JobContext) -> Result<(), HandlerError>;

    /// Check the arguments of a submission. Runs before anything is persisted.
    fn validate(&self, _arguments: &Arguments) -> Result<(), String> {
        Ok(())
    }
}

/// Typed handler for one `Task` type.
///
/// ```ignore
/// struct SendEmailHandler;
///
/// #[async_trait]
/// impl Handler<SendEmail> for SendEmailHandler {
///     async fn handle(&self, task: SendEmail, _ctx: &JobContext) -> Result<(), HandlerError> {
///         mailer::send(&task.to, &task.subject).await.map_err(|e| e.to_string())?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: &JobContext) -> Result<(), HandlerError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn perform(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let task: T = ctx.decode()?;
        self.handler.handle(task, ctx).await
    }

    fn validate(&self, arguments: &Arguments) -> Result<(), String> {
        serde_json::from_value::<T>(serde_json::Value::Object(arguments.clone()))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Handler backed by an async closure taking an owned `JobContext`.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn perform(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        (self.f)(ctx.clone()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{JobEnvelope, JobId, TaskType};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use ulid::Ulid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SendEmail {
        pub to: String,
    }

    impl Task for SendEmail {
        const TYPE: &'static str = "send_email";
    }

    pub struct SendEmailHandler;

    #[async_trait]
    impl Handler<SendEmail> for SendEmailHandler {
        async fn handle(&self, task: SendEmail, _ctx: &JobContext) -> Result<(), HandlerError> {
            if task.to.contains('@') {
                Ok(())
            } else {
                Err(HandlerError::new(format!("bad address: {}", task.to)))
            }
        }
    }

    fn context(arguments: serde_json::Value) -> JobContext {
        let serde_json::Value::Object(arguments) = arguments else {
            panic!("arguments must be an object");
        };
        let envelope = JobEnvelope::new(
            JobId::from_ulid(Ulid::new()),
            TaskType::new(SendEmail::TYPE),
            arguments,
            Utc::now(),
            None,
        );
        JobContext::detached(&envelope, 3)
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_runs() {
        let handler = TypedHandler::<SendEmail, _>::new(SendEmailHandler);

        handler.perform(&context(json!({ "to": "a@example.com" }))).await.unwrap();

        let err = handler.perform(&context(json!({ "to": "nobody" }))).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(err.message().contains("nobody"));
    }

    #[tokio::test]
    async fn typed_handler_rejects_mismatched_arguments() {
        let handler = TypedHandler::<SendEmail, _>::new(SendEmailHandler);

        let args = context(json!({ "recipient": 1 })).arguments;
        assert!(handler.validate(&args).is_err());

        // if such a job slipped through anyway, the decode failure is permanent
        let err = handler.perform(&context(json!({ "recipient": 1 }))).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn fn_handler_sees_the_context() {
        let handler = FnHandler::new(|ctx: JobContext| async move {
            if ctx.attempt == 0 && ctx.arguments.contains_key("to") {
                Ok(())
            } else {
                Err(HandlerError::new("unexpected context"))
            }
        });

        handler.perform(&context(json!({ "to": "x" }))).await.unwrap();
        assert!(handler.validate(&Arguments::new()).is_ok());
    }
}
