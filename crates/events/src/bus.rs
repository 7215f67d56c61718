//! In-process publish/subscribe fan-out of task events.
//!
//! Publishing never waits on a subscriber: each subscriber owns a bounded
//! buffer that evicts its oldest events into a gap marker when full.
//! Sequence stamping, history retention and fan-out all happen under one
//! lock, so per-task order is identical for every subscriber.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use taskhub_core::{ProgressEvent, StreamEvent, TaskHubConfig, TaskId};

use crate::subscription::{lock, Cursor, EventStream, Subscriber, SubscriptionTarget};

/// Event bus tuning.
#[derive(Debug, Clone, Copy)]
pub struct EventBusConfig {
    /// Per-subscriber buffer capacity.
    pub buffer_capacity: usize,
    /// Events kept per task for cursor resume.
    pub retention_per_task: usize,
    /// Events kept once a task has finished, terminal event included.
    pub finished_retention: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            retention_per_task: 1024,
            finished_retention: 64,
        }
    }
}

impl From<&TaskHubConfig> for EventBusConfig {
    fn from(config: &TaskHubConfig) -> Self {
        Self {
            buffer_capacity: config.subscriber_buffer.max(1),
            retention_per_task: config.retention_per_task,
            finished_retention: config.finished_retention,
        }
    }
}

/// Publishing state of one task.
#[derive(Debug, Default)]
struct TaskChannel {
    last_sequence: u64,
    history: VecDeque<StreamEvent>,
    latest_progress: Option<ProgressEvent>,
    terminal: Option<StreamEvent>,
}

impl TaskChannel {
    /// Events after `cursor`, if the retention window still holds all of them.
    fn replay_after(&self, cursor: u64) -> Option<Vec<StreamEvent>> {
        if cursor > self.last_sequence {
            return None;
        }
        if cursor == self.last_sequence {
            return Some(Vec::new());
        }
        let oldest = self.history.front().and_then(|e| e.sequence())?;
        if oldest > cursor + 1 {
            return None;
        }
        Some(
            self.history
                .iter()
                .filter(|e| e.sequence().is_some_and(|s| s > cursor))
                .cloned()
                .collect(),
        )
    }
}

#[derive(Debug, Default)]
struct BusState {
    channels: HashMap<TaskId, TaskChannel>,
    subscribers: HashMap<u64, Arc<Subscriber>>,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct BusInner {
    config: EventBusConfig,
    state: Mutex<BusState>,
    next_subscriber: AtomicU64,
}

impl BusInner {
    pub(crate) fn unsubscribe(&self, id: u64) {
        if let Some(sub) = lock(&self.state).subscribers.remove(&id) {
            sub.close();
            debug!(session_id = %sub.session_id, "subscriber disconnected");
        }
    }
}

/// Cloneable handle to the event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                state: Mutex::new(BusState::default()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> EventBusConfig {
        self.inner.config
    }

    /// Stamp and fan out an event. Returns the assigned sequence number, or
    /// `None` if the event was discarded (bus closed, gap marker, or the task
    /// already published its terminal event).
    pub fn publish(&self, mut event: StreamEvent) -> Option<u64> {
        let task_id = event.task_id()?;
        let mut state = lock(&self.inner.state);
        if state.closed {
            return None;
        }

        let EventBusConfig { retention_per_task, finished_retention, .. } = self.inner.config;
        let channel = state.channels.entry(task_id).or_default();
        if channel.terminal.is_some() {
            warn!(task_id = %task_id, event = event.type_name(), "dropping event published after terminal event");
            return None;
        }

        channel.last_sequence += 1;
        let sequence = channel.last_sequence;
        event.stamp(sequence);

        if let StreamEvent::ProgressUpdate(progress) = &event {
            channel.latest_progress = Some(progress.clone());
        }
        if event.is_terminal() {
            channel.terminal = Some(event.clone());
        }
        channel.history.push_back(event.clone());
        let keep = match channel.terminal {
            Some(_) => retention_per_task.min(finished_retention),
            None => retention_per_task,
        };
        while channel.history.len() > keep {
            channel.history.pop_front();
        }
        if channel.terminal.is_some() {
            // Finished tasks only ever serve short resumes; give the ring back.
            channel.history.shrink_to_fit();
        }

        for sub in state.subscribers.values() {
            if sub.target.matches(task_id) {
                sub.offer(event.clone());
            }
        }
        Some(sequence)
    }

    /// Open a stream with a generated session id.
    pub fn subscribe(&self, target: SubscriptionTarget, resume: Option<&Cursor>) -> EventStream {
        self.subscribe_session(uuid::Uuid::new_v4().to_string(), target, resume)
    }

    /// Open a stream for `target`.
    ///
    /// Without a cursor (or with an empty one) the subscriber joins late: it
    /// gets the latest progress snapshot of each unfinished task, and a
    /// single-task subscription to a finished task gets that task's terminal
    /// event.
    ///
    /// With a cursor, every retained event after it is replayed; tasks the
    /// cursor has no entry for replay from their first event. Any matched
    /// task whose position is no longer retained falls back to a late join,
    /// and the stream then reports `resumed() == false`.
    pub fn subscribe_session(
        &self,
        session_id: impl Into<String>,
        target: SubscriptionTarget,
        resume: Option<&Cursor>,
    ) -> EventStream {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscriber::new(
            id,
            session_id.into(),
            target,
            self.inner.config.buffer_capacity,
        ));

        let mut state = lock(&self.inner.state);
        // An empty cursor carries no position: same as a fresh subscription.
        let resume = resume.filter(|cursor| !cursor.is_empty());
        let mut resumed = resume.is_some();

        let channels: Vec<(&TaskId, &TaskChannel)> = match target {
            SubscriptionTarget::Task(task_id) => state.channels.get_key_value(&task_id).into_iter().collect(),
            SubscriptionTarget::All => state.channels.iter().collect(),
        };

        for (task_id, channel) in channels {
            let Some(cursor) = resume else {
                late_join(&sub, channel, target);
                continue;
            };
            // A task the cursor never saw is replayed from its first event.
            let from = cursor.get(task_id).copied().unwrap_or(0);
            match channel.replay_after(from) {
                Some(events) => {
                    sub.set_cursor(*task_id, from);
                    for event in events {
                        sub.offer(event);
                    }
                }
                None => {
                    debug!(task_id = %task_id, from, "resume position no longer retained");
                    resumed = false;
                    late_join(&sub, channel, target);
                }
            }
        }

        if state.closed {
            sub.close();
        } else {
            state.subscribers.insert(id, Arc::clone(&sub));
        }
        info!(
            session_id = %sub.session_id,
            target = ?target,
            resumed,
            "subscriber connected"
        );
        drop(state);

        EventStream::new(sub, Arc::downgrade(&self.inner), resumed)
    }

    /// Latest progress event published for a task.
    pub fn latest_progress(&self, task_id: TaskId) -> Option<ProgressEvent> {
        lock(&self.inner.state)
            .channels
            .get(&task_id)
            .and_then(|c| c.latest_progress.clone())
    }

    /// Highest sequence number published for a task (0 if none).
    pub fn last_sequence(&self, task_id: TaskId) -> u64 {
        lock(&self.inner.state)
            .channels
            .get(&task_id)
            .map(|c| c.last_sequence)
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.state).subscribers.len()
    }

    /// Close every subscription. Buffered events stay readable; new
    /// publishes are discarded.
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);
        state.closed = true;
        for sub in state.subscribers.values() {
            sub.close();
        }
        let count = state.subscribers.len();
        state.subscribers.clear();
        info!(subscribers = count, "event bus closed");
    }
}

fn late_join(sub: &Subscriber, channel: &TaskChannel, target: SubscriptionTarget) {
    match (&channel.terminal, target) {
        (Some(terminal), SubscriptionTarget::Task(_)) => sub.offer(terminal.clone()),
        (Some(_), SubscriptionTarget::All) => {}
        (None, _) => {
            if let Some(progress) = &channel.latest_progress {
                sub.offer(StreamEvent::ProgressUpdate(progress.clone()));
            }
        }
    }
}
