//! A distributed task execution library backed by a Redis-like key/list store: reliable queues,
//! a supervised worker pool per queue, interval/cron triggers, and a control plane that
//! reconciles queue pause/resume state.

pub mod control;
pub mod coordinator;
pub mod error;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod service_config;
pub mod store;
pub mod task;
pub mod tracing_config;
pub mod worker;

pub use coordinator::Coordinator;
pub use error::Error;
pub use queue::{Queue, QueueStatus};
pub use registry::{Handler, TaskRegistry};
pub use scheduler::Trigger;
pub use service_config::Config;
pub use store::{RedisStore, Store};
pub use task::{Task, TaskStatus};
