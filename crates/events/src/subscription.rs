//! Per-subscriber state: the bounded buffer, the delivery cursor, and the
//! [`EventStream`] handle a client reads from.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use taskhub_core::{GapEvent, StreamEvent, TaskId};

use crate::bus::BusInner;

/// Last delivered sequence number per task.
pub type Cursor = BTreeMap<TaskId, u64>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which events a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTarget {
    /// Events of a single task.
    Task(TaskId),
    /// Every task's events.
    All,
}

impl SubscriptionTarget {
    pub fn matches(&self, task_id: TaskId) -> bool {
        match self {
            SubscriptionTarget::Task(id) => *id == task_id,
            SubscriptionTarget::All => true,
        }
    }
}

// ── Buffer ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct Queue {
    buffer: VecDeque<StreamEvent>,
    /// Pending loss marker, delivered ahead of `buffer`.
    gap: Option<GapEvent>,
    capacity: usize,
    cursor: Cursor,
    dropped_total: u64,
    closed: bool,
}

/// Subscriber record shared between the bus (producer side) and the stream.
#[derive(Debug)]
pub(crate) struct Subscriber {
    pub(crate) id: u64,
    pub(crate) session_id: String,
    pub(crate) target: SubscriptionTarget,
    queue: Mutex<Queue>,
    notify: Notify,
}

impl Subscriber {
    pub(crate) fn new(id: u64, session_id: String, target: SubscriptionTarget, capacity: usize) -> Self {
        Self {
            id,
            session_id,
            target,
            queue: Mutex::new(Queue {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                gap: None,
                capacity,
                cursor: Cursor::new(),
                dropped_total: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Buffer an event without ever blocking the publisher.
    ///
    /// When the buffer is full the oldest event is evicted and folded into
    /// the pending gap marker.
    pub(crate) fn offer(&self, event: StreamEvent) {
        {
            let mut queue = lock(&self.queue);
            if queue.closed {
                return;
            }
            if queue.buffer.len() >= queue.capacity {
                if let Some(oldest) = queue.buffer.pop_front() {
                    if let (Some(task_id), Some(seq)) = (oldest.task_id(), oldest.sequence()) {
                        if queue.gap.is_none() {
                            warn!(
                                session_id = %self.session_id,
                                capacity = queue.capacity,
                                "subscriber buffer full, dropping oldest events"
                            );
                        }
                        queue.gap.get_or_insert_with(GapEvent::default).absorb(task_id, seq);
                        queue.dropped_total += 1;
                    }
                }
            }
            queue.buffer.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Seed the delivery cursor for a resumed task.
    pub(crate) fn set_cursor(&self, task_id: TaskId, sequence: u64) {
        lock(&self.queue).cursor.insert(task_id, sequence);
    }

    pub(crate) fn close(&self) {
        lock(&self.queue).closed = true;
        self.notify.notify_one();
    }

    fn take_next(&self) -> Next {
        let mut queue = lock(&self.queue);
        if let Some(gap) = queue.gap.take() {
            for range in &gap.ranges {
                let entry = queue.cursor.entry(range.task_id).or_insert(0);
                *entry = (*entry).max(range.last_sequence);
            }
            return Next::Event(StreamEvent::Gap(gap));
        }
        if let Some(event) = queue.buffer.pop_front() {
            if let (Some(task_id), Some(seq)) = (event.task_id(), event.sequence()) {
                queue.cursor.insert(task_id, seq);
            }
            return Next::Event(event);
        }
        if queue.closed {
            Next::Closed
        } else {
            Next::Empty
        }
    }
}

enum Next {
    Event(StreamEvent),
    Empty,
    Closed,
}

// ── EventStream ──────────────────────────────────────────────────────

/// A live, ordered stream of events for one subscription.
///
/// Dropping the stream unsubscribes it from the bus.
pub struct EventStream {
    subscriber: Arc<Subscriber>,
    bus: Weak<BusInner>,
    resumed: bool,
    finished: bool,
}

impl EventStream {
    pub(crate) fn new(subscriber: Arc<Subscriber>, bus: Weak<BusInner>, resumed: bool) -> Self {
        Self {
            subscriber,
            bus,
            resumed,
            finished: false,
        }
    }

    /// Wait for the next event. Returns `None` once the subscription is closed
    /// and drained, or after a single-task stream delivered its terminal event.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(next) = self.poll_next_event() {
                return next;
            }
            self.subscriber.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when nothing is buffered.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.poll_next_event().flatten()
    }

    /// `Some(item)` when the stream has an answer now, `None` when it must wait.
    fn poll_next_event(&mut self) -> Option<Option<StreamEvent>> {
        if self.finished {
            return Some(None);
        }
        match self.subscriber.take_next() {
            Next::Event(event) => {
                if event.is_terminal() && matches!(self.subscriber.target, SubscriptionTarget::Task(_)) {
                    debug!(session_id = %self.subscriber.session_id, "single-task stream reached terminal event");
                    self.finished = true;
                }
                Some(Some(event))
            }
            Next::Closed => {
                self.finished = true;
                Some(None)
            }
            Next::Empty => None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.subscriber.session_id
    }

    pub fn target(&self) -> SubscriptionTarget {
        self.subscriber.target
    }

    /// Whether a supplied resume cursor could be honoured for every task.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Last delivered sequence number per task; pass back to `subscribe` to resume.
    pub fn cursor(&self) -> Cursor {
        lock(&self.subscriber.queue).cursor.clone()
    }

    /// Total events this subscriber lost to buffer overflow.
    pub fn dropped(&self) -> u64 {
        lock(&self.subscriber.queue).dropped_total
    }

    /// Number of events currently waiting in the buffer.
    pub fn buffered(&self) -> usize {
        lock(&self.subscriber.queue).buffer.len()
    }

    /// Adapt into a [`futures::Stream`] for transport layers.
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let event = stream.recv().await?;
            Some((event, stream))
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.subscriber.id);
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("session_id", &self.subscriber.session_id)
            .field("target", &self.subscriber.target)
            .field("resumed", &self.resumed)
            .finish()
    }
}
