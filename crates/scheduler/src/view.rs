//! Queue Manager View: read-side aggregation plus admin actions.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use taskhub_core::error::Result;
use taskhub_core::{Priority, Task, TaskHubError, TaskId, TaskSnapshot, TaskStatus};

use crate::queue::PriorityQueue;
use crate::registry::{CancelCause, TaskRegistry};

/// Progress below this is treated as "no estimate yet".
pub const PROGRESS_EPSILON: f64 = 1e-6;

/// `elapsed * (1 - progress) / progress`, or `None` while progress is ~0.
pub fn estimate_remaining(elapsed_secs: f64, progress: f64) -> Option<f64> {
    if !progress.is_finite() || progress < PROGRESS_EPSILON {
        return None;
    }
    let progress = progress.min(1.0);
    Some((elapsed_secs * (1.0 - progress) / progress).max(0.0))
}

/// One row of the queue view.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub snapshot: TaskSnapshot,
    /// 1-based dequeue position, Queued tasks only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Seconds since start (Running) or total run time (finished).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
}

/// Counts per status, and Queued counts per priority.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueSummary {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queued_by_priority: BTreeMap<Priority, usize>,
    pub capacity: usize,
}

fn elapsed_secs(task: &Task, now: DateTime<Utc>) -> Option<f64> {
    let started = task.started_at?;
    let end = task.completed_at.unwrap_or(now);
    Some((end - started).num_milliseconds().max(0) as f64 / 1000.0)
}

fn entry(task: &Task, position: Option<usize>, now: DateTime<Utc>) -> QueueEntry {
    let elapsed = elapsed_secs(task, now);
    let eta = match (task.status, elapsed) {
        (TaskStatus::Running, Some(elapsed)) => estimate_remaining(elapsed, task.progress),
        _ => None,
    };
    QueueEntry {
        snapshot: task.snapshot(),
        position,
        elapsed_secs: elapsed,
        eta_secs: eta,
    }
}

/// Administrative window onto the registry.
#[derive(Clone)]
pub struct QueueManager {
    registry: Arc<TaskRegistry>,
    queue: Arc<PriorityQueue>,
}

impl QueueManager {
    pub fn new(registry: Arc<TaskRegistry>, queue: Arc<PriorityQueue>) -> Self {
        Self { registry, queue }
    }

    /// Every task in submission order, with queue position and timing.
    pub fn entries(&self) -> Vec<QueueEntry> {
        let now = Utc::now();
        let state = self.registry.lock();
        let positions: BTreeMap<TaskId, usize> = state
            .ready_ids()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i + 1))
            .collect();
        state
            .iter()
            .map(|task| entry(task, positions.get(&task.id).copied(), now))
            .collect()
    }

    pub fn entry(&self, id: TaskId) -> Result<QueueEntry> {
        let state = self.registry.lock();
        let task = state.task(id)?;
        let position = if task.status == TaskStatus::Queued {
            state.ready_ids().iter().position(|q| *q == id).map(|i| i + 1)
        } else {
            None
        };
        Ok(entry(task, position, Utc::now()))
    }

    /// Queued tasks only, in dequeue order.
    pub fn queued(&self) -> Vec<QueueEntry> {
        let now = Utc::now();
        let state = self.registry.lock();
        state
            .ready_ids()
            .into_iter()
            .enumerate()
            .filter_map(|(i, id)| state.task(id).ok().map(|t| entry(t, Some(i + 1), now)))
            .collect()
    }

    pub fn summary(&self) -> QueueSummary {
        let state = self.registry.lock();
        let mut summary = QueueSummary {
            capacity: self.queue.max_queued(),
            ..Default::default()
        };
        for task in state.iter() {
            summary.total += 1;
            match task.status {
                TaskStatus::Queued => {
                    summary.queued += 1;
                    *summary.queued_by_priority.entry(task.priority).or_default() += 1;
                }
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// Cancel a task. Queued tasks are cancelled immediately; running
    /// tasks have their cancellation flag set and finish through the pool.
    pub fn cancel(&self, id: TaskId) -> Result<()> {
        let mut state = self.registry.lock();
        let status = state.task(id)?.status;
        match status {
            TaskStatus::Queued => self.queue.cancel_queued_locked(&mut state, id, CancelCause::User.reason()),
            TaskStatus::Running => {
                state.signal_cancel(id, CancelCause::User);
                info!(task_id = %id, "cancellation requested for running task");
                Ok(())
            }
            status => Err(TaskHubError::AlreadyTerminal { task_id: id, status }),
        }
    }

    /// Submit a new task with the same descriptor as `id`.
    pub fn resubmit(&self, id: TaskId) -> Result<TaskId> {
        let descriptor = self.registry.lock().task(id)?.descriptor();
        let new_id = self.queue.enqueue(descriptor)?;
        info!(task_id = %id, new_task_id = %new_id, "task resubmitted");
        Ok(new_id)
    }

    pub fn set_priority(&self, id: TaskId, priority: Priority) -> Result<()> {
        self.queue.set_priority(id, priority)
    }
}
