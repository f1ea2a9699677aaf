//! TaskRegistry - task type -> definition lookup.
//!
//! Built during initialization (`&mut self`), then shared read-only by the
//! engine. The only later writer is `Engine::wrap`, which registers ad hoc
//! tasks.

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{Handler, TaskHandler, TypedHandler};
use super::task::Task;
use crate::domain::{Arguments, TaskType};
use crate::error::SpindleError;
use crate::queue::RetryPolicy;

/// A registered task: its handler plus argument rules.
///
/// Argument rules are applied at submission, before anything is persisted:
/// 1. missing keys are filled from `defaults`
/// 2. every `required` key must be present
/// 3. the handler's own `validate` runs last
#[derive(Clone)]
pub struct TaskDefinition {
    task_type: TaskType,
    handler: Arc<dyn TaskHandler>,
    defaults: Arguments,
    required: Vec<String>,
    retry: Option<RetryPolicy>,
}

impl TaskDefinition {
    pub fn new(task_type: impl Into<TaskType>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            task_type: task_type.into(),
            handler,
            defaults: Arguments::new(),
            required: Vec::new(),
            retry: None,
        }
    }

    pub fn typed<T: Task, H: Handler<T> + 'static>(handler: H) -> Self {
        Self::new(T::TYPE, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn with_default(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }

    /// Override the engine-wide retry policy for this task.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn handler(&self) -> &Arc<dyn TaskHandler> {
        &self.handler
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Apply defaults and validate. Returns the arguments to persist.
    pub fn prepare(&self, mut arguments: Arguments) -> Result<Arguments, SpindleError> {
        for (key, value) in &self.defaults {
            if !arguments.contains_key(key) {
                arguments.insert(key.clone(), value.clone());
            }
        }
        if let Some(missing) = self.required.iter().find(|k| !arguments.contains_key(*k)) {
            return Err(SpindleError::validation(
                &self.task_type,
                format!("missing required argument `{missing}`"),
            ));
        }
        self.handler
            .validate(&arguments)
            .map_err(|reason| SpindleError::validation(&self.task_type, reason))?;
        Ok(arguments)
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("task_type", &self.task_type)
            .field("defaults", &self.defaults)
            .field("required", &self.required)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[derive(Default, Debug)]
pub struct TaskRegistry {
    definitions: HashMap<TaskType, TaskDefinition>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    pub fn register(&mut self, definition: TaskDefinition) -> Result<(), SpindleError> {
        let task_type = definition.task_type.clone();
        if self.definitions.contains_key(&task_type) {
            return Err(SpindleError::DuplicateTask(task_type));
        }
        self.definitions.insert(task_type, definition);
        Ok(())
    }

    pub fn register_typed<T: Task, H: Handler<T> + 'static>(&mut self, handler: H) -> Result<(), SpindleError> {
        self.register(TaskDefinition::typed::<T, H>(handler))
    }

    pub fn resolve(&self, task_type: &TaskType) -> Result<&TaskDefinition, SpindleError> {
        self.definitions
            .get(task_type)
            .ok_or_else(|| SpindleError::UnknownTask(task_type.clone()))
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.definitions.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.keys().map(|t| t.as_str().to_string()).collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
