use super::{
    errors::SpawnError,
    handle::{Shared, TaskHandle},
    model::TaskState,
    result::{from_work_error, panic_message, BoxError, SpawnResult},
};
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

/// Granularity of [`TaskContext::sleep`] between interruption checks.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What a running task can see about itself.
///
/// Interruption is cooperative: `shutdown_now`, `TaskHandle::cancel` and an
/// elapsed declared timeout only flip [`TaskContext::is_interrupted`], the work
/// has to look at it.
pub struct TaskContext {
    id: TaskId,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { id, token, deadline }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled() || self.deadline_passed()
    }

    pub(crate) fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Err(Interrupted)` once the task was signalled, `Err(Timeout)` once its
    /// declared timeout has elapsed.
    pub fn check(&self) -> SpawnResult<()> {
        if self.token.is_cancelled() {
            Err(SpawnError::Interrupted)
        } else if self.deadline_passed() {
            Err(SpawnError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, returning early with the interruption error.
    pub fn sleep(&self, duration: Duration) -> SpawnResult<()> {
        let started = Instant::now();
        loop {
            self.check()?;
            let elapsed = started.elapsed();
            if elapsed >= duration {
                return Ok(());
            }
            thread::sleep((duration - elapsed).min(SLEEP_SLICE));
        }
    }
}

/// A unit of work producing a value or an error.
///
/// Implemented for every `FnOnce(&TaskContext) -> Result<T, E>` closure.
pub trait Callable: Send + 'static {
    type Output: Send + 'static;

    fn call(self, ctx: &TaskContext) -> Result<Self::Output, BoxError>;
}

impl<F, T, E> Callable for F
where
    F: FnOnce(&TaskContext) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError>,
{
    type Output = T;

    #[inline]
    fn call(self, ctx: &TaskContext) -> Result<T, BoxError> {
        self(ctx).map_err(Into::into)
    }
}

/// Runs the work and publishes its outcome; returns the failure, if any.
pub(crate) type Job = Box<dyn FnOnce(&TaskContext) -> SpawnResult<()> + Send + 'static>;

/// Type-erased view of a handle's state, used by workers and shutdown.
pub(crate) trait Lifecycle: Send + Sync {
    /// Pending -> Running. False when the task must not run.
    fn begin(&self) -> bool;
    /// Pending -> Cancelled.
    fn abandon(&self) -> bool;
    fn state(&self) -> TaskState;
    fn token(&self) -> &CancellationToken;
}

/// A queued unit of work together with its identity and bookkeeping.
pub struct TaskEnvelope {
    id: TaskId,
    job: Job,
    timeout: Option<Duration>,
    created_at: Instant,
    lifecycle: Arc<dyn Lifecycle>,
}

impl TaskEnvelope {
    /// Wraps `callable` and creates the handle its outcome is published to.
    pub(crate) fn new<C: Callable>(
        callable: C,
        timeout: Option<Duration>,
        token: CancellationToken,
    ) -> (Self, TaskHandle<C::Output>) {
        let id = TaskId::next();
        let shared = Shared::new(id, token);
        let publisher = Arc::clone(&shared);

        let job: Job = Box::new(move |ctx: &TaskContext| {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| callable.call(ctx))) {
                Ok(Ok(_)) if ctx.deadline_passed() => Err(SpawnError::Timeout),
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(from_work_error(err)),
                Err(payload) => Err(SpawnError::Panic(panic_message(payload))),
            };
            let failure = outcome.as_ref().err().cloned();
            publisher.complete(outcome);
            failure.map_or(Ok(()), Err)
        });

        let envelope = Self::from_parts(id, job, timeout, shared.clone());
        (envelope, TaskHandle::new(shared))
    }

    pub(crate) fn from_parts(
        id: TaskId,
        job: Job,
        timeout: Option<Duration>,
        lifecycle: Arc<dyn Lifecycle>,
    ) -> Self {
        Self {
            id,
            job,
            timeout,
            created_at: Instant::now(),
            lifecycle,
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// State of the handle this envelope publishes to.
    pub fn state(&self) -> TaskState {
        self.lifecycle.state()
    }

    pub(crate) fn begin(&self) -> bool {
        self.lifecycle.begin()
    }

    pub(crate) fn abandon(&self) -> bool {
        self.lifecycle.abandon()
    }

    /// Executes the job. Must only be called after a successful `begin`.
    pub(crate) fn run(self) -> SpawnResult<()> {
        let deadline = self.timeout.and_then(|t| Instant::now().checked_add(t));
        let ctx = TaskContext::new(self.id, self.lifecycle.token().clone(), deadline);
        (self.job)(&ctx)
    }
}

impl fmt::Debug for TaskEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEnvelope")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("created_at", &self.created_at)
            .field("state", &self.state())
            .finish()
    }
}
