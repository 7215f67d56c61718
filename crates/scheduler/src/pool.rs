//! Fixed-size worker pool.
//!
//! Each slot loops on `dequeue_next`, runs the handler in its own tokio task
//! and waits on whichever comes first: the handler finishing, a cancellation
//! request, or the execution timeout. After a cancellation the handler gets
//! `cancel_grace` to return before it is aborted and the slot moves on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};

use taskhub_core::{HandlerError, StreamEvent, TaskCancelled, TaskComplete, TaskFailed, TaskStatus};
use taskhub_events::EventBus;
use taskhub_failures::{spawn_enrichment, FailureRecorder, SuggestionEnricher};

use crate::context::ExecutionContext;
use crate::handler::HandlerRegistry;
use crate::queue::PriorityQueue;
use crate::registry::{CancelCause, Claimed, TaskRegistry};

/// Everything a slot needs, shared by all slots.
pub(crate) struct PoolShared {
    pub registry: Arc<TaskRegistry>,
    pub queue: Arc<PriorityQueue>,
    pub handlers: Arc<HandlerRegistry>,
    pub bus: EventBus,
    pub failures: Arc<FailureRecorder>,
    pub enricher: Option<Arc<dyn SuggestionEnricher>>,
    pub grace: Duration,
    pub task_timeout: Option<Duration>,
}

/// How the handler's tokio task ended.
#[derive(Debug)]
enum Outcome {
    Returned(Result<Value, HandlerError>),
    Panicked(String),
    /// Still running after the grace period; aborted.
    Abandoned,
}

impl Outcome {
    fn from_join(joined: Result<Result<Value, HandlerError>, JoinError>) -> Self {
        match joined {
            Ok(result) => Outcome::Returned(result),
            Err(e) => Outcome::Panicked(panic_message(e)),
        }
    }
}

/// Terminal state a finished execution maps to.
#[derive(Debug, PartialEq)]
enum Verdict {
    Completed(Value),
    Cancelled(CancelCause),
    Failed(HandlerError),
}

fn verdict(outcome: Outcome, cause: Option<CancelCause>, grace: Duration, limit: Option<Duration>) -> Verdict {
    match (outcome, cause) {
        (Outcome::Panicked(message), _) => Verdict::Failed(HandlerError::panic(message)),
        (Outcome::Abandoned, _) => Verdict::Failed(HandlerError::cancellation_timeout(grace)),
        (Outcome::Returned(_), Some(CancelCause::Timeout)) => {
            Verdict::Failed(HandlerError::task_timeout(limit.unwrap_or_default()))
        }
        (Outcome::Returned(_), Some(cause)) => Verdict::Cancelled(cause),
        (Outcome::Returned(Ok(value)), None) => Verdict::Completed(value),
        (Outcome::Returned(Err(e)), None) => Verdict::Failed(e),
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "handler panicked".to_string()
            }
        }
        Err(e) => e.to_string(),
    }
}

impl PoolShared {
    async fn run_slot(self: Arc<Self>, slot: usize) {
        debug!(slot, "worker slot started");
        while let Some(claimed) = self.queue.dequeue_next().await {
            self.execute(slot, claimed).await;
        }
        debug!(slot, "worker slot stopped");
    }

    #[instrument(skip_all, fields(slot = slot, task_id = %claimed.id, task_type = %claimed.task_type))]
    async fn execute(&self, slot: usize, claimed: Claimed) {
        let Some(handler) = self.handlers.get(&claimed.task_type) else {
            let error = HandlerError::new(
                "UnknownTaskType",
                format!("no handler registered for '{}'", claimed.task_type),
            );
            self.fail(&claimed, error);
            return;
        };

        info!("task started");
        let ctx = ExecutionContext::new(&claimed, Arc::clone(&self.registry), self.bus.clone());
        let parameters = Arc::clone(&claimed.parameters);
        let mut handle = tokio::spawn(async move { handler.run(parameters, ctx).await });

        let deadline = async {
            match self.task_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            joined = &mut handle => Outcome::from_join(joined),
            _ = claimed.token.cancelled() => {
                info!(grace = ?self.grace, "cancellation requested");
                self.await_grace(&mut handle).await
            }
            _ = deadline => {
                warn!(timeout = ?self.task_timeout, "task exceeded execution timeout");
                self.registry.lock().signal_cancel(claimed.id, CancelCause::Timeout);
                self.await_grace(&mut handle).await
            }
        };

        let cause = self.registry.lock().cancel_cause(claimed.id);
        match verdict(outcome, cause, self.grace, self.task_timeout) {
            Verdict::Completed(value) => self.complete(&claimed, value),
            Verdict::Cancelled(cause) => self.cancelled(&claimed, cause),
            Verdict::Failed(error) => self.fail(&claimed, error),
        }
    }

    async fn await_grace(&self, handle: &mut JoinHandle<Result<Value, HandlerError>>) -> Outcome {
        match tokio::time::timeout(self.grace, &mut *handle).await {
            Ok(joined) => Outcome::from_join(joined),
            Err(_) => {
                handle.abort();
                warn!(grace = ?self.grace, "handler ignored cancellation, slot reclaimed");
                Outcome::Abandoned
            }
        }
    }

    fn complete(&self, claimed: &Claimed, result: Value) {
        let now = Utc::now();
        let computation_time = claimed.started.elapsed().as_secs_f64();
        let mut state = self.registry.lock();
        match state.finish(claimed.id, TaskStatus::Completed, now) {
            Ok(task) => {
                task.progress = 1.0;
                task.result = Some(result.clone());
            }
            Err(e) => {
                warn!(error = %e, "cannot complete task");
                return;
            }
        }
        self.bus.publish(StreamEvent::TaskComplete(TaskComplete {
            task_id: claimed.id,
            sequence: 0,
            status: TaskStatus::Completed,
            result,
            computation_time,
            timestamp: now,
        }));
        drop(state);
        info!(computation_time, "task completed");
    }

    fn cancelled(&self, claimed: &Claimed, cause: CancelCause) {
        let now = Utc::now();
        let mut state = self.registry.lock();
        if let Err(e) = state.finish(claimed.id, TaskStatus::Cancelled, now) {
            warn!(error = %e, "cannot cancel task");
            return;
        }
        self.bus.publish(StreamEvent::TaskCancelled(TaskCancelled {
            task_id: claimed.id,
            sequence: 0,
            timestamp: now,
            reason: cause.reason().to_string(),
        }));
        drop(state);
        info!(reason = cause.reason(), "task cancelled");
    }

    /// Record the failure, then transition and publish. The record is
    /// written before the slot moves on.
    fn fail(&self, claimed: &Claimed, error: HandlerError) {
        let now = Utc::now();
        let record = self
            .failures
            .record(claimed.id, &claimed.task_type, &claimed.parameters, &error, now);

        let mut state = self.registry.lock();
        match state.finish(claimed.id, TaskStatus::Failed, now) {
            Ok(task) => task.error = Some(error.clone()),
            Err(e) => {
                warn!(error = %e, "cannot fail task");
                return;
            }
        }
        self.bus.publish(StreamEvent::TaskError(TaskFailed {
            task_id: claimed.id,
            sequence: 0,
            timestamp: now,
            error_type: error.kind.clone(),
            message: error.message.clone(),
            traceback: record.traceback.clone(),
            recovery_suggestions: record.suggestions.clone(),
        }));
        drop(state);
        warn!(error_kind = %error.kind, message = %error.message, "task failed");

        if let Some(enricher) = &self.enricher {
            spawn_enrichment(Arc::clone(&self.failures), Arc::clone(enricher), record);
        }
    }
}

/// Handle to the running worker slots.
pub struct WorkerPool {
    slots: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Spawn `size` slots on the current tokio runtime.
    pub(crate) fn start(shared: Arc<PoolShared>, size: usize) -> Self {
        let size = size.max(1);
        let slots = (0..size)
            .map(|slot| tokio::spawn(Arc::clone(&shared).run_slot(slot)))
            .collect();
        info!(slots = size, grace = ?shared.grace, timeout = ?shared.task_timeout, "worker pool started");
        Self { slots, shared }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Request cancellation of every running task.
    pub(crate) fn cancel_running(&self, cause: CancelCause) -> usize {
        let mut state = self.shared.registry.lock();
        state
            .running_ids()
            .into_iter()
            .filter(|id| state.signal_cancel(*id, cause))
            .count()
    }

    /// Wait for every slot to exit, aborting stragglers after `limit`.
    pub(crate) async fn join(self, limit: Duration) {
        let aborts: Vec<_> = self.slots.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(limit, futures::future::join_all(self.slots)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "worker slot ended abnormally");
                    }
                }
                info!("worker pool stopped");
            }
            Err(_) => {
                warn!(limit = ?limit, "worker slots did not stop in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhub_core::{CANCELLATION_TIMEOUT, TASK_TIMEOUT, WORKER_PANIC};

    const GRACE: Duration = Duration::from_millis(100);

    #[test]
    fn plain_outcomes() {
        let v = verdict(Outcome::Returned(Ok(Value::from(3))), None, GRACE, None);
        assert_eq!(v, Verdict::Completed(Value::from(3)));

        let err = HandlerError::new("ValueError", "bad parameter");
        let v = verdict(Outcome::Returned(Err(err.clone())), None, GRACE, None);
        assert_eq!(v, Verdict::Failed(err));
    }

    #[test]
    fn cancellation_outcomes() {
        let v = verdict(Outcome::Returned(Ok(Value::Null)), Some(CancelCause::User), GRACE, None);
        assert_eq!(v, Verdict::Cancelled(CancelCause::User));

        let v = verdict(
            Outcome::Returned(Err(HandlerError::new("E", "stopped"))),
            Some(CancelCause::Timeout),
            GRACE,
            Some(Duration::from_secs(2)),
        );
        assert!(matches!(v, Verdict::Failed(e) if e.kind == TASK_TIMEOUT));

        let v = verdict(Outcome::Abandoned, Some(CancelCause::User), GRACE, None);
        assert!(matches!(v, Verdict::Failed(e) if e.kind == CANCELLATION_TIMEOUT));
    }

    #[test]
    fn panic_always_fails() {
        let v = verdict(Outcome::Panicked("boom".into()), Some(CancelCause::User), GRACE, None);
        assert!(matches!(v, Verdict::Failed(e) if e.kind == WORKER_PANIC && e.message == "boom"));
    }

    #[tokio::test]
    async fn panic_message_is_extracted() {
        let handle = tokio::spawn(async { panic!("index {} out of range", 7) });
        let err = handle.await.unwrap_err();
        assert_eq!(panic_message(err), "index 7 out of range");

        let handle = tokio::spawn(async { std::panic::panic_any(42u8) });
        assert_eq!(panic_message(handle.await.unwrap_err()), "handler panicked");
    }
}
