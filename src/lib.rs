//! Bounded worker-pool task executor with result handles and delayed scheduling
//!
//! # Features
//! - Fixed pool of OS worker threads over a FIFO or work-stealing queue
//! - Result handles with blocking, timed and async waits
//! - Batch submission with ordered joins
//! - Delayed, fixed-rate and fixed-delay scheduling
//! - Graceful and forced shutdown with cooperative interruption
//! - Panic capture and pool metrics

pub mod errors;
pub mod handle;
pub mod model;
pub mod pool;
pub mod queue;
pub mod result;
pub mod scheduler;
pub mod task;

pub use errors::{RejectReason, SpawnError};
pub use handle::{join_handles, TaskHandle};
pub use model::{JoinOrdering, PoolMetrics, PoolState, TaskState};
pub use pool::{Config, ThreadPool, ThreadPoolInner};
pub use result::{BoxError, SpawnResult};
pub use scheduler::{ScheduledHandle, Scheduler, SchedulerInner};
pub use task::{Callable, TaskContext, TaskEnvelope, TaskId};
