use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HandlerError;

/// Opaque key/value payload handed to a task handler.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Unique task identifier, assigned at submission and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Scheduling class. Higher classes are always dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Lifecycle state of a task.
///
/// `Queued → Running → {Completed, Failed, Cancelled}` and `Queued → Cancelled`.
/// Terminal states have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a caller hands to `submit`: everything needed to (re-)create a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub priority: Priority,
}

impl TaskDescriptor {
    pub fn new(task_type: impl Into<String>, parameters: Parameters, priority: Priority) -> Self {
        Self {
            task_type: task_type.into(),
            parameters,
            priority,
        }
    }
}

/// A task record as owned by the registry.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Admission order; the FIFO tie-break within a priority class.
    pub sequence: u64,
    pub task_type: String,
    /// Frozen at submission. Shared, never mutated.
    pub parameters: Arc<Parameters>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub current_step: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<HandlerError>,
}

impl Task {
    pub fn new(sequence: u64, descriptor: TaskDescriptor) -> Self {
        Self {
            id: TaskId::new(),
            sequence,
            task_type: descriptor.task_type,
            parameters: Arc::new(descriptor.parameters),
            priority: descriptor.priority,
            status: TaskStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            current_step: String::new(),
            result: None,
            error: None,
        }
    }

    pub fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            task_type: self.task_type.clone(),
            parameters: (*self.parameters).clone(),
            priority: self.priority,
        }
    }

    /// Wall-clock seconds between start and completion, if both are set.
    pub fn computation_time(&self) -> Option<f64> {
        let started = self.started_at?;
        let finished = self.completed_at?;
        Some((finished - started).num_milliseconds().max(0) as f64 / 1000.0)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            task_type: self.task_type.clone(),
            parameters: (*self.parameters).clone(),
            priority: self.priority,
            status: self.status,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: self.progress,
            current_step: self.current_step.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Read-only copy of a task handed out by `status` and `list`.
///
/// Contains no wall-clock derived fields, so two snapshots taken with no
/// intervening event compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub task_type: String,
    pub parameters: Parameters,
    pub priority: Priority,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub current_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn priority_from_str() {
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert_eq!("low".parse::<Priority>(), Ok(Priority::Low));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use TaskStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Queued, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn new_task_is_queued_with_frozen_parameters() {
        let mut params = Parameters::new();
        params.insert("n".into(), serde_json::json!(4));
        let task = Task::new(7, TaskDescriptor::new("simulate", params, Priority::High));

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.sequence, 7);
        assert_eq!(task.parameters.get("n"), Some(&serde_json::json!(4)));
        assert!(task.started_at.is_none());
        assert_eq!(task.descriptor().priority, Priority::High);
    }

    #[test]
    fn snapshot_serializes_status_snake_case() {
        let task = Task::new(1, TaskDescriptor::new("simulate", Parameters::new(), Priority::Low));
        let json = serde_json::to_value(task.snapshot()).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["priority"], "low");
        assert!(json.get("result").is_none());
    }
}
