//! Shared fixtures for the hub integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;

use taskhub_core::{HandlerError, Parameters, StreamEvent, TaskHubConfig, TaskId, TaskSnapshot};
use taskhub_events::SubscriptionTarget;
use taskhub_scheduler::{handler_fn, TaskHandler, TaskHub};

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const SETTLE: Duration = Duration::from_millis(50);

/// In-memory config with a short grace period.
pub fn config(concurrency: usize) -> TaskHubConfig {
    TaskHubConfig {
        max_concurrency: concurrency,
        cancel_grace_ms: 200,
        persist_failures: false,
        ..Default::default()
    }
}

pub fn params(pairs: &[(&str, Value)]) -> Parameters {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Returns `Ok(null)` immediately.
pub fn noop() -> impl TaskHandler {
    handler_fn(|_, _| async { Ok(Value::Null) })
}

/// Loops until cancelled, reporting progress each tick.
pub fn cooperative() -> impl TaskHandler {
    handler_fn(|_, ctx| async move {
        let mut tick = 0u32;
        while !ctx.is_cancelled() {
            tick += 1;
            ctx.emit_progress(f64::from(tick.min(99)) / 100.0, format!("tick {tick}"), HashMap::new());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(Value::from(tick))
    })
}

/// Fails with the given kind and message.
pub fn failing(kind: &'static str, message: &'static str) -> impl TaskHandler {
    handler_fn(move |_, _| async move { Err(HandlerError::new(kind, message)) })
}

/// Ignores cancellation entirely.
pub fn stubborn() -> impl TaskHandler {
    handler_fn(|_, _| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Value::Null)
    })
}

/// Collect a single-task stream up to and including its terminal event.
pub async fn collect_task(hub: &TaskHub, id: TaskId) -> Vec<StreamEvent> {
    let mut stream = hub.subscribe(SubscriptionTarget::Task(id), None).unwrap();
    let mut events = Vec::new();
    loop {
        let event = timeout(TIMEOUT, stream.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream closed before terminal event");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Wait for the terminal event of a task and return its final snapshot.
pub async fn wait_terminal(hub: &TaskHub, id: TaskId) -> (StreamEvent, TaskSnapshot) {
    let events = collect_task(hub, id).await;
    let terminal = events.into_iter().last().expect("no events");
    (terminal, hub.status(id).unwrap())
}

/// Poll `status` until the task is terminal, without holding a subscription.
pub async fn poll_terminal(hub: &TaskHub, id: TaskId) -> TaskSnapshot {
    timeout(TIMEOUT, async {
        loop {
            let snapshot = hub.status(id).unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for terminal status")
}
