//! Wire-level event schema streamed to subscribers.
//!
//! Every event except [`GapEvent`] belongs to one task and carries that task's
//! sequence number. Sequence numbers are stamped by the event bus at publish
//! time, start at 1, and are shared by all event kinds of the task.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskHubError;
use crate::task::{TaskId, TaskStatus};

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// What a log line is about, as rendered by dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogCategory {
    Info,
    Equation,
    Compute,
    Result,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub progress: f64,
    pub current_step: String,
    /// Seconds; `None` while progress is too small to extrapolate.
    pub estimated_time_remaining: Option<f64>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub task_id: TaskId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    /// Free-text citation (paper, section, equation number).
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equation_latex: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskComplete {
    pub task_id: TaskId,
    pub sequence: u64,
    pub status: TaskStatus,
    pub result: serde_json::Value,
    /// Seconds between start and completion.
    pub computation_time: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailed {
    pub task_id: TaskId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default)]
    pub recovery_suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCancelled {
    pub task_id: TaskId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Contiguous run of sequence numbers dropped for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRange {
    pub task_id: TaskId,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

/// Synthetic marker telling a slow subscriber that events were discarded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GapEvent {
    pub dropped: u64,
    pub ranges: Vec<GapRange>,
}

impl GapEvent {
    /// Fold one dropped event into the marker, extending the task's range.
    pub fn absorb(&mut self, task_id: TaskId, sequence: u64) {
        self.dropped += 1;
        match self.ranges.iter_mut().find(|r| r.task_id == task_id) {
            Some(range) => {
                range.first_sequence = range.first_sequence.min(sequence);
                range.last_sequence = range.last_sequence.max(sequence);
            }
            None => self.ranges.push(GapRange {
                task_id,
                first_sequence: sequence,
                last_sequence: sequence,
            }),
        }
    }

    pub fn to_error(&self) -> TaskHubError {
        TaskHubError::BufferOverflow { dropped: self.dropped }
    }
}

/// One message on a subscriber stream, serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    ProgressUpdate(ProgressEvent),
    LogMessage(LogEvent),
    TaskComplete(TaskComplete),
    TaskError(TaskFailed),
    TaskCancelled(TaskCancelled),
    Gap(GapEvent),
}

impl StreamEvent {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            StreamEvent::ProgressUpdate(e) => Some(e.task_id),
            StreamEvent::LogMessage(e) => Some(e.task_id),
            StreamEvent::TaskComplete(e) => Some(e.task_id),
            StreamEvent::TaskError(e) => Some(e.task_id),
            StreamEvent::TaskCancelled(e) => Some(e.task_id),
            StreamEvent::Gap(_) => None,
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            StreamEvent::ProgressUpdate(e) => Some(e.sequence),
            StreamEvent::LogMessage(e) => Some(e.sequence),
            StreamEvent::TaskComplete(e) => Some(e.sequence),
            StreamEvent::TaskError(e) => Some(e.sequence),
            StreamEvent::TaskCancelled(e) => Some(e.sequence),
            StreamEvent::Gap(_) => None,
        }
    }

    /// Overwrite the sequence number. Called by the bus when publishing.
    pub fn stamp(&mut self, sequence: u64) {
        match self {
            StreamEvent::ProgressUpdate(e) => e.sequence = sequence,
            StreamEvent::LogMessage(e) => e.sequence = sequence,
            StreamEvent::TaskComplete(e) => e.sequence = sequence,
            StreamEvent::TaskError(e) => e.sequence = sequence,
            StreamEvent::TaskCancelled(e) => e.sequence = sequence,
            StreamEvent::Gap(_) => {}
        }
    }

    /// Whether this is the last event a task will ever publish.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::TaskComplete(_) | StreamEvent::TaskError(_) | StreamEvent::TaskCancelled(_)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StreamEvent::ProgressUpdate(_) => "progress_update",
            StreamEvent::LogMessage(_) => "log_message",
            StreamEvent::TaskComplete(_) => "task_complete",
            StreamEvent::TaskError(_) => "task_error",
            StreamEvent::TaskCancelled(_) => "task_cancelled",
            StreamEvent::Gap(_) => "gap",
        }
    }
}
