//! `TaskHub`: the transport-agnostic operation surface.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::info;

use taskhub_core::error::Result;
use taskhub_core::{
    Parameters, Priority, TaskDescriptor, TaskHubConfig, TaskHubError, TaskId, TaskSnapshot,
};
use taskhub_events::{Cursor, EventBus, EventBusConfig, EventStream, SubscriptionTarget};
use taskhub_failures::{FailureRecorder, SuggestionEnricher};

use crate::handler::{HandlerRegistry, TaskHandler};
use crate::pool::{PoolShared, WorkerPool};
use crate::queue::PriorityQueue;
use crate::registry::{CancelCause, TaskRegistry};
use crate::view::QueueManager;

/// Extra time allowed on shutdown beyond the cancel grace period.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// Builder for [`TaskHub`].
pub struct TaskHubBuilder {
    config: TaskHubConfig,
    handlers: HandlerRegistry,
    enricher: Option<Arc<dyn SuggestionEnricher>>,
    failures: Option<Arc<FailureRecorder>>,
}

impl TaskHubBuilder {
    /// Register the handler for a task type.
    pub fn handler(mut self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        self.handlers.register(task_type, handler);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Attach an asynchronous suggestion source for failed tasks.
    pub fn enricher(mut self, enricher: impl SuggestionEnricher + 'static) -> Self {
        self.enricher = Some(Arc::new(enricher));
        self
    }

    /// Use an existing recorder instead of building one from config.
    pub fn failure_recorder(mut self, recorder: Arc<FailureRecorder>) -> Self {
        self.failures = Some(recorder);
        self
    }

    /// Validate config and start the worker pool. Must be called from
    /// within a tokio runtime.
    pub fn build(self) -> Result<TaskHub> {
        let config = self.config;
        config.validate()?;

        let failures = match self.failures {
            Some(recorder) => recorder,
            None => Arc::new(FailureRecorder::from_config(&config)?),
        };
        let registry = Arc::new(TaskRegistry::new());
        let handlers = Arc::new(self.handlers);
        let bus = EventBus::new(EventBusConfig::from(&config));
        let queue = Arc::new(PriorityQueue::new(
            Arc::clone(&registry),
            Arc::clone(&handlers),
            bus.clone(),
            config.max_queued,
        ));

        let shared = Arc::new(PoolShared {
            registry: Arc::clone(&registry),
            queue: Arc::clone(&queue),
            handlers: Arc::clone(&handlers),
            bus: bus.clone(),
            failures: Arc::clone(&failures),
            enricher: self.enricher,
            grace: config.cancel_grace(),
            task_timeout: config.task_timeout(),
        });
        let pool = WorkerPool::start(shared, config.resolved_concurrency());
        info!(task_types = ?handlers.task_types(), "task hub ready");

        Ok(TaskHub {
            view: QueueManager::new(Arc::clone(&registry), Arc::clone(&queue)),
            config,
            registry,
            queue,
            bus,
            failures,
            handlers,
            pool: Mutex::new(Some(pool)),
        })
    }
}

/// A running scheduler: registry, queue, worker pool, event bus and
/// failure recorder wired together.
pub struct TaskHub {
    config: TaskHubConfig,
    registry: Arc<TaskRegistry>,
    queue: Arc<PriorityQueue>,
    bus: EventBus,
    failures: Arc<FailureRecorder>,
    handlers: Arc<HandlerRegistry>,
    view: QueueManager,
    pool: Mutex<Option<WorkerPool>>,
}

impl TaskHub {
    pub fn builder(config: TaskHubConfig) -> TaskHubBuilder {
        TaskHubBuilder {
            config,
            handlers: HandlerRegistry::new(),
            enricher: None,
            failures: None,
        }
    }

    pub fn submit(&self, task_type: impl Into<String>, parameters: Parameters, priority: Priority) -> Result<TaskId> {
        self.submit_descriptor(TaskDescriptor::new(task_type, parameters, priority))
    }

    pub fn submit_descriptor(&self, descriptor: TaskDescriptor) -> Result<TaskId> {
        self.queue.enqueue(descriptor)
    }

    /// Cancel a queued task outright, or request cooperative cancellation of
    /// a running one.
    pub fn cancel(&self, id: TaskId) -> Result<()> {
        self.view.cancel(id)
    }

    pub fn status(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.registry.snapshot(id)
    }

    /// All tasks in submission order.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        self.registry.list()
    }

    /// Open a live event stream. `resume` is a cursor from an earlier stream.
    pub fn subscribe(&self, target: SubscriptionTarget, resume: Option<&Cursor>) -> Result<EventStream> {
        self.check_target(target)?;
        Ok(self.bus.subscribe(target, resume))
    }

    pub fn subscribe_session(
        &self,
        session_id: impl Into<String>,
        target: SubscriptionTarget,
        resume: Option<&Cursor>,
    ) -> Result<EventStream> {
        self.check_target(target)?;
        Ok(self.bus.subscribe_session(session_id, target, resume))
    }

    fn check_target(&self, target: SubscriptionTarget) -> Result<()> {
        match target {
            SubscriptionTarget::Task(id) if !self.registry.contains(id) => Err(TaskHubError::NotFound(id)),
            _ => Ok(()),
        }
    }

    pub fn resubmit(&self, id: TaskId) -> Result<TaskId> {
        self.view.resubmit(id)
    }

    pub fn set_priority(&self, id: TaskId, priority: Priority) -> Result<()> {
        self.view.set_priority(id, priority)
    }

    pub fn view(&self) -> &QueueManager {
        &self.view
    }

    pub fn failures(&self) -> &Arc<FailureRecorder> {
        &self.failures
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &TaskHubConfig {
        &self.config
    }

    pub fn task_types(&self) -> Vec<&str> {
        self.handlers.task_types()
    }

    /// Number of worker slots, 0 after shutdown.
    pub fn worker_count(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(WorkerPool::size)
            .unwrap_or(0)
    }

    /// Stop admission, cancel queued and running tasks, wait for the slots
    /// and close every subscription. Idempotent.
    pub async fn shutdown(&self) {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(pool) = pool else {
            return;
        };
        let drained = self.queue.begin_shutdown();
        let signalled = pool.cancel_running(CancelCause::Shutdown);
        info!(drained, signalled, "task hub shutting down");

        pool.join(self.config.cancel_grace() + SHUTDOWN_SLACK).await;
        self.bus.close();
        info!("task hub stopped");
    }
}

impl Drop for TaskHub {
    fn drop(&mut self) {
        let pool = self.pool.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pool) = pool {
            self.queue.begin_shutdown();
            pool.cancel_running(CancelCause::Shutdown);
            self.bus.close();
        }
    }
}
