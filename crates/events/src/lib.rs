//! Per-task and wildcard event fan-out with bounded, loss-signalling buffers.

pub mod bus;
pub mod subscription;

pub use bus::{EventBus, EventBusConfig};
pub use subscription::{Cursor, EventStream, SubscriptionTarget};
