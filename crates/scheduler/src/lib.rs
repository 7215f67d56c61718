//! Priority scheduling of long-running handlers with cooperative
//! cancellation, live event streams and failure capture.
//!
//! ```no_run
//! use taskhub_core::{Parameters, Priority, TaskHubConfig};
//! use taskhub_events::SubscriptionTarget;
//! use taskhub_scheduler::{handler_fn, TaskHub};
//!
//! # async fn demo() -> taskhub_core::error::Result<()> {
//! let hub = TaskHub::builder(TaskHubConfig::default())
//!     .handler("square", handler_fn(|params, _ctx| async move {
//!         let x = params.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
//!         Ok(serde_json::json!(x * x))
//!     }))
//!     .build()?;
//!
//! let id = hub.submit("square", Parameters::new(), Priority::High)?;
//! let mut events = hub.subscribe(SubscriptionTarget::Task(id), None)?;
//! while let Some(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event).unwrap_or_default());
//! }
//! hub.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod handler;
pub mod hub;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod view;

pub use context::ExecutionContext;
pub use handler::{handler_fn, FnHandler, HandlerRegistry, TaskHandler};
pub use hub::{TaskHub, TaskHubBuilder};
pub use pool::WorkerPool;
pub use queue::PriorityQueue;
pub use registry::{CancelCause, Claimed, TaskRegistry};
pub use view::{estimate_remaining, QueueEntry, QueueManager, QueueSummary, PROGRESS_EPSILON};
