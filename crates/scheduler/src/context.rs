//! Per-task handle passed into handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use taskhub_core::{LogCategory, LogEvent, LogLevel, Parameters, ProgressEvent, StreamEvent, TaskId, TaskStatus};
use taskhub_events::EventBus;

use crate::registry::{Claimed, TaskRegistry};
use crate::view::estimate_remaining;

struct ContextInner {
    task_id: TaskId,
    parameters: Arc<Parameters>,
    token: CancellationToken,
    started: Instant,
    registry: Arc<TaskRegistry>,
    bus: EventBus,
}

/// Progress/log emission and cancellation polling for one running task.
///
/// Cheap to clone. All methods are synchronous and never wait on subscribers,
/// so the context can be moved into `spawn_blocking` computations.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    pub(crate) fn new(claimed: &Claimed, registry: Arc<TaskRegistry>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                task_id: claimed.id,
                parameters: Arc::clone(&claimed.parameters),
                token: claimed.token.clone(),
                started: claimed.started,
                registry,
                bus,
            }),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    pub fn parameters(&self) -> &Parameters {
        &self.inner.parameters
    }

    /// Non-blocking poll of the cooperative cancellation flag.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Child token for work the handler spawns itself.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Report progress. Values are clamped to `[0, 1]` and never allowed to
    /// go below the last reported value. Returns the value actually
    /// recorded, or `None` if the task is no longer running.
    pub fn emit_progress(
        &self,
        fraction: f64,
        step: impl Into<String>,
        metrics: HashMap<String, f64>,
    ) -> Option<f64> {
        let task_id = self.inner.task_id;
        let mut state = self.inner.registry.lock();
        let task = state.task_mut(task_id).ok()?;
        if task.status != TaskStatus::Running {
            debug!(task_id = %task_id, "ignoring progress from a finished task");
            return None;
        }

        let requested = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { task.progress };
        let progress = requested.max(task.progress);
        let step = step.into();
        task.progress = progress;
        task.current_step = step.clone();

        let elapsed = self.inner.started.elapsed().as_secs_f64();
        self.inner.bus.publish(StreamEvent::ProgressUpdate(ProgressEvent {
            task_id,
            sequence: 0,
            timestamp: Utc::now(),
            progress,
            current_step: step,
            estimated_time_remaining: estimate_remaining(elapsed, progress),
            metrics,
        }));
        Some(progress)
    }

    /// Publish a structured log event. Events are delivered in call order.
    pub fn emit_log(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
        reference: impl Into<String>,
        equation_latex: Option<String>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> bool {
        let task_id = self.inner.task_id;
        let state = self.inner.registry.lock();
        let running = state
            .task(task_id)
            .map(|t| t.status == TaskStatus::Running)
            .unwrap_or(false);
        if !running {
            return false;
        }
        self.inner
            .bus
            .publish(StreamEvent::LogMessage(LogEvent {
                task_id,
                sequence: 0,
                timestamp: Utc::now(),
                level,
                category,
                message: message.into(),
                reference: reference.into(),
                equation_latex,
                metadata: metadata.unwrap_or_default(),
            }))
            .is_some()
    }

    /// Shorthand for an uncited log line.
    pub fn log(&self, level: LogLevel, category: LogCategory, message: impl Into<String>) -> bool {
        self.emit_log(level, category, message, "", None, None)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task_id", &self.inner.task_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
