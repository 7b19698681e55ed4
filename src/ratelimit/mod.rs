//! Admission protocol types, limiter decorators and the fairness scheduler.

pub mod backend;
pub mod batcher;
pub mod clock;
pub mod context;
pub mod lease;
pub mod local;
pub mod noop;
pub mod registry;
pub mod requirements;
pub mod retry;
pub mod scheduler;
pub mod types;

pub use backend::{Backend, Limiter, LoadableState};
pub use batcher::Batcher;
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::CallContext;
pub use local::LocalLimiter;
pub use noop::NoopLimiter;
pub use registry::Registry;
pub use retry::RetryPolicy;
pub use scheduler::{Job, Scheduler, SchedulerConfig, SchedulerObserver};
pub use types::*;
