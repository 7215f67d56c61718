use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Errors returned by the task hub's public operations.
#[derive(Error, Debug)]
pub enum TaskHubError {
    #[error("queue full: {limit} tasks already queued or running")]
    QueueFull { limit: usize },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {task_id} already {status}")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id} is {status}, not queued")]
    NotQueued { task_id: TaskId, status: TaskStatus },

    #[error("no handler registered for task type '{0}'")]
    UnknownTaskType(String),

    #[error("subscriber buffer overflowed, {dropped} events dropped")]
    BufferOverflow { dropped: u64 },

    #[error("task hub is shutting down")]
    ShuttingDown,

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TaskHubError {
    fn from(e: serde_json::Error) -> Self {
        TaskHubError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaskHubError>;

/// Error kind recorded when a handler ignores cancellation past the grace period.
pub const CANCELLATION_TIMEOUT: &str = "CancellationTimeoutError";
/// Error kind recorded when a task exceeds its execution timeout.
pub const TASK_TIMEOUT: &str = "TaskTimeoutError";
/// Error kind recorded when a handler panics inside its slot.
pub const WORKER_PANIC: &str = "WorkerPanic";

/// Structured description of a handler failure.
///
/// Handlers return this from `run`; the worker pool also synthesizes it for
/// panics and timeouts so every failure has the same shape.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn cancellation_timeout(grace: std::time::Duration) -> Self {
        Self::new(
            CANCELLATION_TIMEOUT,
            format!("handler did not observe cancellation within {:?}", grace),
        )
    }

    pub fn task_timeout(limit: std::time::Duration) -> Self {
        Self::new(TASK_TIMEOUT, format!("task exceeded its {:?} execution limit", limit))
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(WORKER_PANIC, message)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        HandlerError {
            kind: "Error".to_string(),
            message: e.to_string(),
            traceback: Some(format!("{:?}", e)),
        }
    }
}
