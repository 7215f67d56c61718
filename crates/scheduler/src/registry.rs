//! Authoritative in-memory task table.
//!
//! All lifecycle state lives behind one mutex: the task records, the ready
//! index the queue dequeues from, and the cancellation tokens of running
//! tasks. Admission, claiming and terminal transitions are therefore atomic
//! with respect to each other. The lock is never held across an `.await`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use taskhub_core::error::Result;
use taskhub_core::{Parameters, Priority, Task, TaskDescriptor, TaskHubError, TaskId, TaskSnapshot, TaskStatus};

/// Ready-index key: higher priority first, then admission order.
pub(crate) type ReadyKey = (Reverse<Priority>, u64);

/// Why a running task's token was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// An explicit `cancel` call.
    User,
    /// The task exceeded its execution timeout.
    Timeout,
    /// The hub is shutting down.
    Shutdown,
}

impl CancelCause {
    pub fn reason(self) -> &'static str {
        match self {
            CancelCause::User => "cancelled by request",
            CancelCause::Timeout => "execution timeout",
            CancelCause::Shutdown => "hub shutting down",
        }
    }
}

#[derive(Debug)]
pub(crate) struct RunningSlot {
    pub token: CancellationToken,
    pub cause: Option<CancelCause>,
}

/// A task handed to a worker slot by `dequeue_next`.
#[derive(Debug)]
pub struct Claimed {
    pub id: TaskId,
    pub task_type: String,
    pub parameters: Arc<Parameters>,
    pub token: CancellationToken,
    pub started: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
    ready: BTreeMap<ReadyKey, TaskId>,
    running: HashMap<TaskId, RunningSlot>,
    next_sequence: u64,
}

impl RegistryState {
    /// Queued + Running.
    pub fn active(&self) -> usize {
        self.ready.len() + self.running.len()
    }

    pub fn queued(&self) -> usize {
        self.ready.len()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn task(&self, id: TaskId) -> Result<&Task> {
        self.tasks.get(&id).ok_or(TaskHubError::NotFound(id))
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(&id).ok_or(TaskHubError::NotFound(id))
    }

    /// Create a Queued task and index it for dequeue.
    pub fn admit(&mut self, descriptor: TaskDescriptor) -> TaskId {
        self.next_sequence += 1;
        let task = Task::new(self.next_sequence, descriptor);
        let id = task.id;
        self.ready.insert((Reverse(task.priority), task.sequence), id);
        self.order.push(id);
        self.tasks.insert(id, task);
        id
    }

    /// Pop the best ready task and move it to Running.
    pub fn claim_next(&mut self) -> Option<Claimed> {
        let (_, id) = self.ready.pop_first()?;
        let task = self.tasks.get_mut(&id)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());

        let token = CancellationToken::new();
        self.running.insert(
            id,
            RunningSlot {
                token: token.clone(),
                cause: None,
            },
        );
        Some(Claimed {
            id,
            task_type: task.task_type.clone(),
            parameters: Arc::clone(&task.parameters),
            token,
            started: Instant::now(),
        })
    }

    /// Trigger the cancellation token of a running task. The first cause wins.
    pub fn signal_cancel(&mut self, id: TaskId, cause: CancelCause) -> bool {
        match self.running.get_mut(&id) {
            Some(slot) => {
                slot.cause.get_or_insert(cause);
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_cause(&self, id: TaskId) -> Option<CancelCause> {
        self.running.get(&id).and_then(|slot| slot.cause)
    }

    pub fn running_ids(&self) -> Vec<TaskId> {
        self.running.keys().copied().collect()
    }

    /// Queued task ids in dequeue order.
    pub fn ready_ids(&self) -> Vec<TaskId> {
        self.ready.values().copied().collect()
    }

    /// Move a task to a terminal state, enforcing the lifecycle state machine.
    pub fn finish(&mut self, id: TaskId, next: TaskStatus, at: DateTime<Utc>) -> Result<&mut Task> {
        let task = self.tasks.get_mut(&id).ok_or(TaskHubError::NotFound(id))?;
        if task.status.is_terminal() {
            return Err(TaskHubError::AlreadyTerminal {
                task_id: id,
                status: task.status,
            });
        }
        if !task.status.can_transition_to(next) {
            return Err(TaskHubError::InvalidTransition {
                task_id: id,
                from: task.status,
                to: next,
            });
        }
        if task.status == TaskStatus::Queued {
            self.ready.remove(&(Reverse(task.priority), task.sequence));
        }
        self.running.remove(&id);
        task.status = next;
        task.completed_at = Some(at);
        Ok(task)
    }

    /// Change the class of a Queued task, keeping its admission order.
    pub fn reprioritize(&mut self, id: TaskId, priority: Priority) -> Result<Priority> {
        let task = self.tasks.get_mut(&id).ok_or(TaskHubError::NotFound(id))?;
        match task.status {
            TaskStatus::Queued => {}
            status if status.is_terminal() => {
                return Err(TaskHubError::AlreadyTerminal { task_id: id, status })
            }
            status => return Err(TaskHubError::NotQueued { task_id: id, status }),
        }
        let previous = task.priority;
        if let Some(id) = self.ready.remove(&(Reverse(previous), task.sequence)) {
            self.ready.insert((Reverse(priority), task.sequence), id);
        }
        task.priority = priority;
        Ok(previous)
    }

    /// Tasks in submission order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }
}

/// Shared handle to the task table.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    state: Mutex<RegistryState>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scoped access. Registry reads stay available even if a holder panicked.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.lock().task(id).map(Task::snapshot)
    }

    /// Every task ever admitted, in submission order.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        self.lock().iter().map(Task::snapshot).collect()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().task(id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queued_count(&self) -> usize {
        self.lock().queued()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running()
    }
}
