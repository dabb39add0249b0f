use std::fmt;
use thiserror::Error;

/// Why the pool refused a submission.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RejectReason {
    Shutdown,
    QueueFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Shutdown => f.write_str("pool is shut down"),
            RejectReason::QueueFull => f.write_str("work queue is full"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum SpawnError {
    /// The work returned an error.
    #[error("task failed: {0}")]
    Execution(String),

    #[error("task panicked: {0}")]
    Panic(String),

    /// A bounded wait expired, or the task overran its declared timeout.
    #[error("timed out")]
    Timeout,

    #[error("interrupted")]
    Interrupted,

    #[error("submission rejected: {0}")]
    Rejected(RejectReason),

    #[error("task cancelled")]
    Cancelled,

    /// The outcome was already moved out of the handle.
    #[error("task result already taken")]
    ResultTaken,

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl SpawnError {
    /// True for failures raised by the work itself rather than by the pool.
    pub fn is_execution_failure(&self) -> bool {
        matches!(self, SpawnError::Execution(_) | SpawnError::Panic(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, SpawnError::Rejected(_))
    }
}
