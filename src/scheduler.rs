use super::{
    errors::{RejectReason, SpawnError},
    handle::{Shared, TaskHandle},
    model::{PoolMetrics, PoolState, TaskState},
    pool::{Config, ThreadPool, ThreadPoolInner},
    queue::DelayQueue,
    result::{from_work_error, panic_message, BoxError, SpawnResult},
    task::{Callable, Job, TaskContext, TaskEnvelope, TaskId},
};
use std::{
    convert::Infallible,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    task::{Context, Poll},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

type PeriodicWork = Box<dyn FnMut(&TaskContext) -> Result<(), BoxError> + Send + 'static>;

/// Next trigger of a delayed task, shared with its handle.
struct Trigger {
    at: Mutex<Instant>,
    firings: AtomicU64,
}

impl Trigger {
    fn new(at: Instant) -> Arc<Self> {
        Arc::new(Self {
            at: Mutex::new(at),
            firings: AtomicU64::new(0),
        })
    }

    fn get(&self) -> Instant {
        *self.at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, at: Instant) {
        *self.at.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

#[derive(Debug, Clone, Copy)]
enum Cadence {
    /// Next trigger = previous trigger + period.
    FixedRate(Duration),
    /// Next trigger = completion + delay.
    FixedDelay(Duration),
}

/// A repeating series. Each firing runs as its own envelope; the next one is
/// only armed once the previous firing returned, so firings never overlap.
struct PeriodicTask {
    id: TaskId,
    work: Mutex<PeriodicWork>,
    shared: Arc<Shared<()>>,
    trigger: Arc<Trigger>,
    cadence: Cadence,
    timeout: Option<Duration>,
    delayed: Weak<DelayQueue<Delayed>>,
}

impl PeriodicTask {
    fn envelope(self: &Arc<Self>) -> TaskEnvelope {
        let task = Arc::clone(self);
        let job: Job = Box::new(move |ctx: &TaskContext| task.fire(ctx));
        TaskEnvelope::from_parts(self.id, job, self.timeout, self.shared.clone())
    }

    fn fire(self: &Arc<Self>, ctx: &TaskContext) -> SpawnResult<()> {
        // A firing dispatched before `shutdown` may still be queued.
        if self.scheduler_closed() {
            debug!(task_id = %self.id, "scheduler shut down, periodic series cancelled");
            self.shared.cancel();
            return Err(SpawnError::Cancelled);
        }

        let outcome = {
            let mut work = self.work.lock().unwrap_or_else(PoisonError::into_inner);
            match panic::catch_unwind(AssertUnwindSafe(|| (*work)(ctx))) {
                Ok(Ok(())) if ctx.deadline_passed() => Err(SpawnError::Timeout),
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(from_work_error(err)),
                Err(payload) => Err(SpawnError::Panic(panic_message(payload))),
            }
        };

        match outcome {
            Ok(()) => {
                self.trigger.firings.fetch_add(1, Ordering::Relaxed);
                self.rearm();
                Ok(())
            }
            Err(err) => {
                debug!(task_id = %self.id, error = %err, "periodic task failed, series stopped");
                self.shared.complete(Err(err.clone()));
                Err(err)
            }
        }
    }

    fn rearm(self: &Arc<Self>) {
        if self.shared.state().is_terminal() {
            return;
        }

        let next = match self.cadence {
            Cadence::FixedRate(period) => self.trigger.get().checked_add(period),
            Cadence::FixedDelay(delay) => Instant::now().checked_add(delay),
        };
        let Some(next) = next else {
            warn!(task_id = %self.id, cadence = ?self.cadence, "next trigger out of range, series stopped");
            self.shared.complete(Err(SpawnError::InvalidSchedule(
                "next trigger is out of range".to_string(),
            )));
            return;
        };
        self.trigger.set(next);

        let rearmed = match self.delayed.upgrade() {
            Some(delayed) => delayed
                .push(next, Delayed::Periodic(Arc::clone(self)))
                .is_ok(),
            None => false,
        };
        if !rearmed {
            debug!(task_id = %self.id, "scheduler shut down, periodic series cancelled");
            self.shared.cancel();
        }
    }

    fn scheduler_closed(&self) -> bool {
        self.delayed
            .upgrade()
            .map_or(true, |delayed| delayed.is_closed())
    }
}

/// Record waiting in the delay queue.
enum Delayed {
    Once(TaskEnvelope),
    Periodic(Arc<PeriodicTask>),
}

impl Delayed {
    fn is_live_once(&self) -> bool {
        match self {
            Delayed::Once(envelope) => !envelope.state().is_terminal(),
            Delayed::Periodic(_) => false,
        }
    }

    fn into_envelope(self) -> TaskEnvelope {
        match self {
            Delayed::Once(envelope) => envelope,
            Delayed::Periodic(task) => task.envelope(),
        }
    }

    /// Cancels the record and returns its envelope. Returns `None` for records
    /// whose handle was already terminal.
    fn abandon(self) -> Option<TaskEnvelope> {
        let envelope = self.into_envelope();
        envelope.abandon().then_some(envelope)
    }
}

/// Handle to a delayed or periodic task.
pub struct ScheduledHandle<T> {
    handle: TaskHandle<T>,
    trigger: Arc<Trigger>,
}

impl<T> ScheduledHandle<T> {
    /// Time left until the next trigger; zero once it elapsed or the task is done.
    pub fn remaining_delay(&self) -> Duration {
        if self.handle.is_done() {
            return Duration::ZERO;
        }
        self.trigger.get().saturating_duration_since(Instant::now())
    }

    /// Instant of the next (or last) firing.
    pub fn trigger_at(&self) -> Instant {
        self.trigger.get()
    }

    /// Number of firings that completed successfully.
    pub fn firings(&self) -> u64 {
        self.trigger.firings.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Cancels a pending task, or stops a periodic series.
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    pub fn wait(&self) -> TaskState {
        self.handle.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.handle.wait_timeout(timeout)
    }

    pub fn join(self) -> SpawnResult<T> {
        self.handle.join()
    }

    pub fn handle(&self) -> &TaskHandle<T> {
        &self.handle
    }

    pub fn into_handle(self) -> TaskHandle<T> {
        self.handle
    }
}

impl<T: Clone> ScheduledHandle<T> {
    pub fn get(&self) -> SpawnResult<T> {
        self.handle.get()
    }

    pub fn get_timeout(&self, timeout: Duration) -> SpawnResult<T> {
        self.handle.get_timeout(timeout)
    }
}

impl<T> Future for ScheduledHandle<T> {
    type Output = SpawnResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().handle).poll(cx)
    }
}

impl<T> fmt::Debug for ScheduledHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("remaining_delay", &self.remaining_delay())
            .finish()
    }
}

pub type Scheduler = Arc<SchedulerInner>;

/// A thread pool plus a timer thread that moves delayed tasks onto the pool's
/// queue when their trigger elapses.
///
/// After [`SchedulerInner::shutdown`] pending one-shot tasks still fire at
/// their trigger while periodic series are cancelled.
pub struct SchedulerInner {
    pool: ThreadPool,
    delayed: Arc<DelayQueue<Delayed>>,
}

impl SchedulerInner {
    pub fn new(num_threads: usize) -> SpawnResult<Scheduler> {
        Self::with_config(Config::fixed(num_threads))
    }

    pub fn with_config(config: Config) -> SpawnResult<Scheduler> {
        let timer_name = format!("{}-timer", config.thread_name);
        let pool = ThreadPoolInner::with_config(config)?;
        let delayed = Arc::new(DelayQueue::new());

        pool.attach_thread();
        let timer_pool = Arc::clone(&pool);
        let timer_queue = Arc::clone(&delayed);
        let spawned = thread::Builder::new()
            .name(timer_name)
            .spawn(move || timer_loop(timer_pool, timer_queue));

        if let Err(err) = spawned {
            pool.detach_thread();
            pool.shutdown_now();
            return Err(SpawnError::WorkerSpawn(err.to_string()));
        }

        Ok(Arc::new(Self { pool, delayed }))
    }

    #[inline]
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Runs `f` as soon as a worker is free.
    pub fn submit<T, F>(&self, f: F) -> SpawnResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.pool.submit(f)
    }

    pub fn submit_callable<C: Callable>(&self, callable: C) -> SpawnResult<TaskHandle<C::Output>> {
        self.pool.submit_callable(callable)
    }

    /// Runs `f` once `delay` has elapsed.
    pub fn schedule<T, F>(&self, f: F, delay: Duration) -> SpawnResult<ScheduledHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.schedule_callable(move |_: &TaskContext| Ok::<T, Infallible>(f()), delay)
    }

    pub fn schedule_callable<C: Callable>(
        &self,
        callable: C,
        delay: Duration,
    ) -> SpawnResult<ScheduledHandle<C::Output>> {
        self.pool.ensure_accepting()?;
        let at = trigger_after(delay)?;
        let (envelope, handle) = self.pool.prepare(callable, self.pool.config().task_timeout);
        let id = envelope.id();

        if let Err(record) = self.delayed.push(at, Delayed::Once(envelope)) {
            record.abandon();
            return Err(SpawnError::Rejected(RejectReason::Shutdown));
        }

        trace!(task_id = %id, ?delay, "task scheduled");
        Ok(ScheduledHandle {
            handle,
            trigger: Trigger::new(at),
        })
    }

    /// Runs `f` first after `initial_delay`, then every `period` measured from
    /// the previous trigger. A firing that overruns delays the next one; a
    /// failing firing stops the series and fails its handle.
    pub fn schedule_at_fixed_rate<F, E>(
        &self,
        f: F,
        initial_delay: Duration,
        period: Duration,
    ) -> SpawnResult<ScheduledHandle<()>>
    where
        F: FnMut(&TaskContext) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.schedule_periodic(f, initial_delay, Cadence::FixedRate(period))
    }

    /// Runs `f` first after `initial_delay`, then `delay` after each firing
    /// completes.
    pub fn schedule_with_fixed_delay<F, E>(
        &self,
        f: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> SpawnResult<ScheduledHandle<()>>
    where
        F: FnMut(&TaskContext) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.schedule_periodic(f, initial_delay, Cadence::FixedDelay(delay))
    }

    fn schedule_periodic<F, E>(
        &self,
        mut f: F,
        initial_delay: Duration,
        cadence: Cadence,
    ) -> SpawnResult<ScheduledHandle<()>>
    where
        F: FnMut(&TaskContext) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let (Cadence::FixedRate(period) | Cadence::FixedDelay(period)) = cadence;
        if period.is_zero() {
            return Err(SpawnError::InvalidSchedule(
                "period must be greater than zero".to_string(),
            ));
        }

        self.pool.ensure_accepting()?;
        let at = trigger_after(initial_delay)?;
        if at.checked_add(period).is_none() {
            return Err(SpawnError::InvalidSchedule(format!(
                "period {:?} is out of range",
                period
            )));
        }
        let id = TaskId::next();
        let shared = Shared::periodic(id, self.pool.child_token());
        let trigger = Trigger::new(at);

        let work: PeriodicWork = Box::new(move |ctx: &TaskContext| f(ctx).map_err(Into::into));
        let task = Arc::new(PeriodicTask {
            id,
            work: Mutex::new(work),
            shared: Arc::clone(&shared),
            trigger: Arc::clone(&trigger),
            cadence,
            timeout: self.pool.config().task_timeout,
            delayed: Arc::downgrade(&self.delayed),
        });

        if let Err(record) = self.delayed.push(at, Delayed::Periodic(task)) {
            record.abandon();
            return Err(SpawnError::Rejected(RejectReason::Shutdown));
        }

        trace!(task_id = %id, ?initial_delay, ?cadence, "periodic task scheduled");
        Ok(ScheduledHandle {
            handle: TaskHandle::new(shared),
            trigger,
        })
    }

    /// Delayed records not yet handed to the workers.
    pub fn pending_delayed(&self) -> usize {
        self.delayed.len()
    }

    /// Stops admissions and cancels periodic series. Pending one-shot tasks
    /// still fire; the pool terminates once they and the queued work are done.
    pub fn shutdown(&self) {
        if self.pool.begin_shutdown() {
            info!("scheduler shutting down");
        }
        self.delayed.close();

        let purged = self.delayed.retain(Delayed::is_live_once);
        let cancelled = purged.into_iter().filter_map(Delayed::abandon).count();
        debug!(cancelled, "periodic series cancelled on shutdown");
    }

    /// Stops admissions, interrupts running tasks and cancels everything that
    /// has not started, delayed records included.
    pub fn shutdown_now(&self) -> Vec<TaskEnvelope> {
        self.pool.begin_shutdown();
        self.delayed.close();

        let mut abandoned: Vec<TaskEnvelope> = self
            .delayed
            .drain()
            .into_iter()
            .filter_map(|(_, record)| record.abandon())
            .collect();
        abandoned.extend(self.pool.shutdown_now());
        abandoned
    }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.pool.await_termination(timeout)
    }

    #[inline]
    pub fn state(&self) -> PoolState {
        self.pool.state()
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.pool.is_terminated()
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }
}

fn trigger_after(delay: Duration) -> SpawnResult<Instant> {
    Instant::now()
        .checked_add(delay)
        .ok_or_else(|| SpawnError::InvalidSchedule(format!("delay {:?} is out of range", delay)))
}

fn timer_loop(pool: ThreadPool, delayed: Arc<DelayQueue<Delayed>>) {
    debug!("timer started");

    // Dispatching under the delay queue's lock keeps a taken record visible
    // to `shutdown_now`, which drains that queue before the pool's.
    let dispatch = |trigger: Instant, record: Delayed| {
        let envelope = record.into_envelope();
        trace!(
            task_id = %envelope.id(),
            late = ?trigger.elapsed(),
            "dispatching delayed task"
        );
        pool.dispatch(envelope);
    };
    while delayed.take_with(&dispatch).is_some() {}

    // Nothing left to fire: let the workers drain and exit.
    pool.close_queue();
    debug!("timer exiting");
    pool.detach_thread();
}
