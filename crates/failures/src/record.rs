use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskhub_core::{HandlerError, Parameters, TaskId};

/// Persisted description of a task's terminal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub task_type: String,
    pub timestamp: DateTime<Utc>,
    pub error_kind: String,
    pub message: String,
    /// Deep copy of the parameters the task was submitted with.
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl FailureRecord {
    pub fn key(&self) -> (TaskId, DateTime<Utc>) {
        (self.task_id, self.timestamp)
    }

    pub fn handler_error(&self) -> HandlerError {
        HandlerError {
            kind: self.error_kind.clone(),
            message: self.message.clone(),
            traceback: self.traceback.clone(),
        }
    }
}

/// Keep the first `max_lines` lines of a traceback.
pub fn truncate_traceback(traceback: &str, max_lines: usize) -> String {
    let total = traceback.lines().count();
    if total <= max_lines {
        return traceback.to_string();
    }
    let mut kept: Vec<&str> = traceback.lines().take(max_lines).collect();
    let omitted = format!("... ({} more lines)", total - max_lines);
    kept.push(&omitted);
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_traceback_untouched() {
        assert_eq!(truncate_traceback("a\nb", 5), "a\nb");
    }

    #[test]
    fn long_traceback_truncated_with_marker() {
        let tb: String = (0..10).map(|i| format!("frame {i}\n")).collect();
        let cut = truncate_traceback(&tb, 3);
        assert_eq!(cut, "frame 0\nframe 1\nframe 2\n... (7 more lines)");
    }
}
