pub mod config;
pub mod error;
pub mod event;
pub mod task;

pub use config::TaskHubConfig;
pub use error::{
    HandlerError, TaskHubError, CANCELLATION_TIMEOUT, TASK_TIMEOUT, WORKER_PANIC,
};
pub use event::*;
pub use task::*;
