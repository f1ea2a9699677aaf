//! EngineBuilder - registration, wiring and startup.
//!
//! # Fail-fast
//! - duplicate task types are rejected at registration
//! - `expect_tasks()` declares task types that must be registered; `open()`
//!   checks "expected ⊆ registered" before touching the WAL
//! - `open()` replays the WAL before returning, so an `Engine` never exists
//!   in a half-recovered state

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tracing::info;

use super::engine::{Engine, EngineInner};
use crate::config::EngineConfig;
use crate::domain::{JobMutation, TaskType};
use crate::error::SpindleError;
use crate::impls::TracingEventSink;
use crate::middleware::{PerformMiddleware, SubmitMiddleware};
use crate::ports::{Clock, EventSink, IdGenerator, SystemClock, UlidGenerator};
use crate::queue::{DueIndex, JobTable};
use crate::typed::{FnHandler, Handler, HandlerError, JobContext, Task, TaskDefinition, TaskRegistry};
use crate::wal::Wal;

/// # Example
/// ```ignore
/// let engine = EngineBuilder::new(config)
///     .register::<SendEmail, _>(SendEmailHandler)?
///     .expect_tasks(&[SendEmail::TYPE])
///     .open()
///     .await?;
/// let dispatchers = engine.start();
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    registry: TaskRegistry,
    expected_tasks: Option<Vec<String>>,
    submit_chain: Vec<Arc<dyn SubmitMiddleware>>,
    perform_chain: Vec<Arc<dyn PerformMiddleware>>,
    sinks: Vec<Arc<dyn EventSink>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: TaskRegistry::new(),
            expected_tasks: None,
            submit_chain: Vec::new(),
            perform_chain: Vec::new(),
            sinks: vec![Arc::new(TracingEventSink)],
            clock: Arc::new(SystemClock),
            ids: None,
        }
    }

    /// Register a typed handler.
    pub fn register<T: Task, H: Handler<T> + 'static>(mut self, handler: H) -> Result<Self, SpindleError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// Register a definition with argument rules or a retry override.
    pub fn define(mut self, definition: TaskDefinition) -> Result<Self, SpindleError> {
        self.registry.register(definition)?;
        Ok(self)
    }

    /// Register an async closure as the handler of `task_type`.
    pub fn register_fn<F, Fut>(self, task_type: impl Into<TaskType>, f: F) -> Result<Self, SpindleError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.define(TaskDefinition::new(task_type, Arc::new(FnHandler::new(f))))
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Append a submission interceptor; the first one added runs outermost.
    pub fn submit_middleware(mut self, middleware: impl SubmitMiddleware + 'static) -> Self {
        self.submit_chain.push(Arc::new(middleware));
        self
    }

    /// Append an execution interceptor; the first one added runs outermost.
    pub fn perform_middleware(mut self, middleware: impl PerformMiddleware + 'static) -> Self {
        self.perform_chain.push(Arc::new(middleware));
        self
    }

    /// Add an event sink. Events always go to the tracing sink as well.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    fn check_expected(&self) -> Result<(), SpindleError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(SpindleError::MissingTaskTypes(missing_tasks));
            }
        }
        Ok(())
    }

    /// Validate, open and replay the WAL, and rebuild the due index.
    pub async fn open(self) -> Result<Engine, SpindleError> {
        self.config.validate()?;
        self.check_expected()?;

        let (wal, mut replay) = Wal::open(&self.config.wal_path).await?;
        let mut index = DueIndex::new();
        for envelope in replay.live() {
            index.insert(envelope.due_at, envelope.job_id);
        }

        // persist redelivery so the next attempt's records apply on replay
        let now = self.clock.now();
        for &job_id in &replay.recovered {
            wal.append(job_id, JobMutation::Recovered, now).await?;
        }
        info!(
            live = index.len(),
            recovered = replay.recovered.len(),
            task_types = self.registry.len(),
            "engine opened"
        );
        let recovered = std::mem::take(&mut replay.recovered);
        let mut jobs = replay.into_jobs();
        for envelope in jobs.iter_mut().filter(|env| recovered.contains(&env.job_id)) {
            envelope.updated_at = now;
        }
        let table = JobTable::from_envelopes(jobs);

        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&self.clock))));
        let retry = self.config.retry_policy();

        Ok(Engine::from_inner(EngineInner {
            config: self.config,
            registry: RwLock::new(self.registry),
            wal,
            table,
            index: Mutex::new(index),
            clock: self.clock,
            ids,
            submit_chain: self.submit_chain,
            perform_chain: self.perform_chain,
            sinks: self.sinks,
            retry,
            notify: Notify::new(),
            cancel_flags: Mutex::new(HashMap::new()),
        }))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::tests::{SendEmail, SendEmailHandler};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EngineConfig {
        EngineConfig::default().with_wal_path(dir.path().join("spindle.wal"))
    }

    #[tokio::test]
    async fn test_open_success() {
        let dir = TempDir::new().unwrap();
        let engine = EngineBuilder::new(config(&dir))
            .register::<SendEmail, _>(SendEmailHandler)
            .unwrap()
            .expect_tasks(&[SendEmail::TYPE])
            .open()
            .await;
        assert!(engine.is_ok());
        assert!(dir.path().join("spindle.wal").exists());
    }

    #[tokio::test]
    async fn test_open_missing_task_types() {
        let dir = TempDir::new().unwrap();
        let engine = EngineBuilder::new(config(&dir))
            .register::<SendEmail, _>(SendEmailHandler)
            .unwrap()
            .expect_tasks(&[SendEmail::TYPE, "charge_card"])
            .open()
            .await;
        assert!(matches!(
            engine,
            Err(SpindleError::MissingTaskTypes(missing)) if missing == vec!["charge_card".to_string()]
        ));
    }

    #[test]
    fn test_duplicate_registration() {
        let builder = EngineBuilder::default()
            .register::<SendEmail, _>(SendEmailHandler)
            .unwrap()
            .register_fn(SendEmail::TYPE, |_ctx| async { Ok::<(), HandlerError>(()) });
        assert!(matches!(builder, Err(SpindleError::DuplicateTask(t)) if t.as_str() == SendEmail::TYPE));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.max_concurrency = 0;
        let engine = EngineBuilder::new(cfg).open().await;
        assert!(matches!(engine, Err(SpindleError::Config(_))));
    }
}
