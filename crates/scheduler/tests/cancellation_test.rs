//! Integration tests for cooperative cancellation, forced reclamation,
//! panics, timeouts and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::timeout;

use taskhub_core::{
    Parameters, Priority, StreamEvent, TaskHubConfig, TaskHubError, TaskStatus, CANCELLATION_TIMEOUT,
    TASK_TIMEOUT, WORKER_PANIC,
};
use taskhub_events::SubscriptionTarget;
use taskhub_scheduler::{handler_fn, TaskHub};

use common::*;

#[tokio::test]
async fn running_task_cancelled_cooperatively() {
    let hub = TaskHub::builder(config(1))
        .handler("loop", cooperative())
        .build()
        .unwrap();

    let id = hub.submit("loop", Parameters::new(), Priority::Normal).unwrap();
    let mut stream = hub.subscribe(SubscriptionTarget::Task(id), None).unwrap();

    // Wait until the handler is demonstrably running.
    let first = timeout(TIMEOUT, stream.recv()).await.unwrap().unwrap();
    assert!(matches!(first, StreamEvent::ProgressUpdate(_)));
    hub.cancel(id).unwrap();

    let mut saw_complete = false;
    let mut terminal = None;
    while let Some(event) = timeout(TIMEOUT, stream.recv()).await.unwrap() {
        saw_complete |= matches!(event, StreamEvent::TaskComplete(_));
        if event.is_terminal() {
            terminal = Some(event);
        }
    }
    assert!(!saw_complete);
    assert!(matches!(terminal, Some(StreamEvent::TaskCancelled(_))));

    let snapshot = hub.status(id).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Cancelled);
    assert!(snapshot.result.is_none());
    assert!(hub.failures().get(id).is_none());
    assert!(matches!(hub.cancel(id), Err(TaskHubError::AlreadyTerminal { .. })));
    hub.shutdown().await;
}

#[tokio::test]
async fn queued_task_cancelled_never_runs() {
    let gate = Arc::new(Notify::new());
    let hub = {
        let gate = gate.clone();
        TaskHub::builder(config(1))
            .handler(
                "gate",
                handler_fn(move |_, _| {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok(Value::Null)
                    }
                }),
            )
            .handler("loop", cooperative())
            .build()
            .unwrap()
    };

    hub.submit("gate", Parameters::new(), Priority::High).unwrap();
    tokio::time::sleep(SETTLE).await;
    let queued = hub.submit("loop", Parameters::new(), Priority::Normal).unwrap();
    hub.cancel(queued).unwrap();

    let events = collect_task(&hub, queued).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::TaskCancelled(_)));

    gate.notify_one();
    tokio::time::sleep(SETTLE).await;
    let snapshot = hub.status(queued).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Cancelled);
    assert!(snapshot.started_at.is_none());
    assert_eq!(snapshot.progress, 0.0);
    hub.shutdown().await;
}

#[tokio::test]
async fn handler_ignoring_cancel_is_reclaimed() {
    let hub = TaskHub::builder(config(1))
        .handler("stubborn", stubborn())
        .handler("noop", noop())
        .build()
        .unwrap();

    let id = hub.submit("stubborn", Parameters::new(), Priority::Normal).unwrap();
    tokio::time::sleep(SETTLE).await;
    hub.cancel(id).unwrap();

    let (terminal, snapshot) = wait_terminal(&hub, id).await;
    match terminal {
        StreamEvent::TaskError(failed) => {
            assert_eq!(failed.error_type, CANCELLATION_TIMEOUT);
            assert!(!failed.recovery_suggestions.is_empty());
        }
        other => panic!("expected task_error, got {}", other.type_name()),
    }
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(hub.failures().by_kind(CANCELLATION_TIMEOUT).len(), 1);

    // The single slot is free again.
    let next = hub.submit("noop", Parameters::new(), Priority::Normal).unwrap();
    let (_, snapshot) = wait_terminal(&hub, next).await;
    assert_eq!(snapshot.status, TaskStatus::Completed);
    hub.shutdown().await;
}

#[tokio::test]
async fn panic_is_contained_to_its_task() {
    let hub = TaskHub::builder(config(2))
        .handler(
            "boom",
            handler_fn(|_, _| async {
                let values: Vec<u32> = Vec::new();
                let _ = values[3];
                Ok(Value::Null)
            }),
        )
        .handler("loop", cooperative())
        .build()
        .unwrap();

    let survivor = hub.submit("loop", Parameters::new(), Priority::Normal).unwrap();
    let crashed = hub.submit("boom", Parameters::new(), Priority::Normal).unwrap();

    let (terminal, snapshot) = wait_terminal(&hub, crashed).await;
    assert!(matches!(terminal, StreamEvent::TaskError(ref e) if e.error_type == WORKER_PANIC));
    assert_eq!(snapshot.status, TaskStatus::Failed);
    let error = snapshot.error.unwrap();
    assert!(error.message.contains("index out of bounds"), "{}", error.message);

    assert_eq!(hub.status(survivor).unwrap().status, TaskStatus::Running);
    hub.cancel(survivor).unwrap();
    let (_, snapshot) = wait_terminal(&hub, survivor).await;
    assert_eq!(snapshot.status, TaskStatus::Cancelled);
    hub.shutdown().await;
}

#[tokio::test]
async fn execution_timeout_fails_task() {
    let config = TaskHubConfig {
        task_timeout_secs: Some(1),
        ..config(1)
    };
    let hub = TaskHub::builder(config).handler("loop", cooperative()).build().unwrap();

    let id = hub.submit("loop", Parameters::new(), Priority::Normal).unwrap();
    let (terminal, snapshot) = wait_terminal(&hub, id).await;

    assert!(matches!(terminal, StreamEvent::TaskError(ref e) if e.error_type == TASK_TIMEOUT));
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(hub.failures().get(id).map(|r| r.error_kind), Some(TASK_TIMEOUT.to_string()));
    hub.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_everything_and_closes_streams() {
    let hub = TaskHub::builder(config(1))
        .handler("loop", cooperative())
        .build()
        .unwrap();

    let running = hub.submit("loop", Parameters::new(), Priority::High).unwrap();
    tokio::time::sleep(SETTLE).await;
    let queued = hub.submit("loop", Parameters::new(), Priority::Low).unwrap();
    let mut all = hub.subscribe(SubscriptionTarget::All, None).unwrap();

    timeout(TIMEOUT, hub.shutdown()).await.unwrap();

    assert_eq!(hub.status(running).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(hub.status(queued).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(hub.worker_count(), 0);
    assert!(matches!(
        hub.submit("loop", Parameters::new(), Priority::Normal),
        Err(TaskHubError::ShuttingDown)
    ));

    // Buffered events drain, then the closed stream ends.
    let mut cancelled = 0;
    while let Some(event) = timeout(TIMEOUT, all.recv()).await.unwrap() {
        if matches!(event, StreamEvent::TaskCancelled(_)) {
            cancelled += 1;
        }
    }
    assert_eq!(cancelled, 2);

    // Second call is a no-op.
    hub.shutdown().await;
}
