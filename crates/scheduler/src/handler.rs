use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use taskhub_core::{HandlerError, Parameters};

use crate::context::ExecutionContext;

/// The opaque computation behind a task type.
///
/// Handlers receive the frozen submission parameters and an
/// [`ExecutionContext`] for progress, logs and cancellation polling. Long
/// loops should check [`ExecutionContext::is_cancelled`] regularly; a handler
/// that ignores cancellation past the grace period is abandoned and its task
/// fails with `CancellationTimeoutError`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, parameters: Arc<Parameters>, ctx: ExecutionContext) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<T: TaskHandler + ?Sized> TaskHandler for Arc<T> {
    async fn run(&self, parameters: Arc<Parameters>, ctx: ExecutionContext) -> Result<Value, HandlerError> {
        (**self).run(parameters, ctx).await
    }
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<Parameters>, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Arc<Parameters>, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn run(&self, parameters: Arc<Parameters>, ctx: ExecutionContext) -> Result<Value, HandlerError> {
        (self.0)(parameters, ctx).await
    }
}

/// Task type → handler lookup. Fixed once the hub is built.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `task_type`.
    pub fn register(&mut self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.handlers.insert(task_type.into(), Arc::new(handler));
    }

    pub fn with(mut self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        self.register(task_type, handler);
        self
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
