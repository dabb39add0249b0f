use super::{
    errors::{RejectReason, SpawnError},
    handle::TaskHandle,
    model::{PoolMetrics, PoolState},
    queue::{FifoQueue, StealingQueue},
    result::SpawnResult,
    task::{Callable, TaskContext, TaskEnvelope},
};
use std::{
    convert::Infallible,
    env,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};
use crossbeam::deque::Worker;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Thread pool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub num_threads: usize,
    /// Upper bound on queued tasks; submissions beyond it are rejected.
    pub max_pending: Option<usize>,
    pub enable_work_stealing: bool,
    /// Declared timeout applied to every submitted task.
    pub task_timeout: Option<Duration>,
    /// Worker threads are named `<thread_name>-<index>`.
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            num_threads: num_cpus * 2, // for I/O-bound work
            max_pending: None,
            enable_work_stealing: false,
            task_timeout: None,
            thread_name: "taskpool-worker".to_string(),
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        Self {
            num_threads: num_cpus::get(),
            enable_work_stealing: true,
            ..Default::default()
        }
    }

    pub fn io_bound() -> Self {
        Self {
            num_threads: num_cpus::get() * 2,
            enable_work_stealing: true,
            ..Default::default()
        }
    }

    pub fn fixed(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Default::default()
        }
    }

    pub fn single_thread() -> Self {
        Self::fixed(1)
    }

    pub fn work_stealing() -> Self {
        Self {
            num_threads: num_cpus::get(),
            enable_work_stealing: true,
            ..Default::default()
        }
    }

    /// Defaults overridden by `TASKPOOL_THREADS`, `TASKPOOL_MAX_PENDING`,
    /// `TASKPOOL_WORK_STEALING` and `TASKPOOL_TASK_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(threads) = env_parse::<usize>("TASKPOOL_THREADS") {
            config.num_threads = threads;
        }
        if let Some(max_pending) = env_parse::<usize>("TASKPOOL_MAX_PENDING") {
            config.max_pending = Some(max_pending);
        }
        if let Some(stealing) = env_parse::<bool>("TASKPOOL_WORK_STEALING") {
            config.enable_work_stealing = stealing;
        }
        if let Some(ms) = env_parse::<u64>("TASKPOOL_TASK_TIMEOUT_MS") {
            config.task_timeout = Some(Duration::from_millis(ms));
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable pool setting");
            None
        }
    }
}

#[inline(always)]
fn unlikely(b: bool) -> bool {
    #[cold]
    fn cold() {}
    if b {
        cold()
    }
    b
}

/// The queue workers pull from.
enum WorkQueue {
    Fifo(FifoQueue<TaskEnvelope>),
    Stealing(StealingQueue<TaskEnvelope>),
}

impl WorkQueue {
    fn push(&self, envelope: TaskEnvelope) -> Result<(), TaskEnvelope> {
        match self {
            WorkQueue::Fifo(q) => q.push(envelope),
            WorkQueue::Stealing(q) => q.push(envelope),
        }
    }

    fn take(&self, local: Option<&Worker<TaskEnvelope>>) -> Option<TaskEnvelope> {
        match (self, local) {
            (WorkQueue::Fifo(q), _) => q.take(),
            (WorkQueue::Stealing(q), Some(local)) => q.take(local),
            (WorkQueue::Stealing(_), None) => None,
        }
    }

    fn close(&self) {
        match self {
            WorkQueue::Fifo(q) => q.close(),
            WorkQueue::Stealing(q) => q.close(),
        }
    }

    fn drain(&self) -> Vec<TaskEnvelope> {
        match self {
            WorkQueue::Fifo(q) => q.drain(),
            WorkQueue::Stealing(q) => q.drain(),
        }
    }
}

struct PoolStatus {
    state: PoolState,
    // Worker threads plus auxiliary threads (the scheduler's timer).
    live_threads: usize,
}

pub type ThreadPool = Arc<ThreadPoolInner>;

/// Fixed-size pool of worker threads sharing one work queue.
///
/// Workers keep the pool alive; call [`ThreadPoolInner::shutdown`] or
/// [`ThreadPoolInner::shutdown_now`] to let them exit.
pub struct ThreadPoolInner {
    queue: WorkQueue,
    status: Mutex<PoolStatus>,
    terminated: Condvar,
    cancellation_token: CancellationToken,
    active_tasks: AtomicUsize,
    queued_tasks: AtomicUsize,
    total_spawned: AtomicUsize,
    completed_tasks: AtomicUsize,
    failed_tasks: AtomicUsize,
    cancelled_tasks: AtomicUsize,
    config: Config,
}

impl ThreadPoolInner {
    pub fn new(num_threads: usize, max_pending: Option<usize>) -> SpawnResult<ThreadPool> {
        let config = Config {
            num_threads,
            max_pending,
            ..Default::default()
        };
        Self::with_config(config)
    }

    pub fn new_cpu() -> SpawnResult<ThreadPool> {
        Self::with_config(Config::cpu_bound())
    }

    pub fn with_config(mut config: Config) -> SpawnResult<ThreadPool> {
        if config.num_threads == 0 {
            warn!("num_threads = 0, starting a single worker");
            config.num_threads = 1;
        }

        let (queue, locals): (WorkQueue, Vec<Option<Worker<TaskEnvelope>>>) =
            if config.enable_work_stealing {
                let (queue, locals) = StealingQueue::new(config.num_threads);
                (
                    WorkQueue::Stealing(queue),
                    locals.into_iter().map(Some).collect(),
                )
            } else {
                (
                    WorkQueue::Fifo(FifoQueue::new()),
                    (0..config.num_threads).map(|_| None).collect(),
                )
            };

        let pool = Arc::new(ThreadPoolInner {
            queue,
            status: Mutex::new(PoolStatus {
                state: PoolState::Running,
                live_threads: 0,
            }),
            terminated: Condvar::new(),
            cancellation_token: CancellationToken::new(),
            active_tasks: AtomicUsize::new(0),
            queued_tasks: AtomicUsize::new(0),
            total_spawned: AtomicUsize::new(0),
            completed_tasks: AtomicUsize::new(0),
            failed_tasks: AtomicUsize::new(0),
            cancelled_tasks: AtomicUsize::new(0),
            config,
        });

        for (index, local) in locals.into_iter().enumerate() {
            if let Err(err) = pool.spawn_worker(index, local) {
                pool.shutdown_now();
                return Err(err);
            }
        }

        debug!(
            threads = pool.config.num_threads,
            work_stealing = pool.config.enable_work_stealing,
            "pool started"
        );
        Ok(pool)
    }

    fn spawn_worker(
        self: &Arc<Self>,
        index: usize,
        local: Option<Worker<TaskEnvelope>>,
    ) -> SpawnResult<()> {
        self.attach_thread();
        let pool = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name, index))
            .spawn(move || pool.worker_loop(index, local));

        if let Err(err) = spawned {
            self.detach_thread();
            return Err(SpawnError::WorkerSpawn(err.to_string()));
        }
        Ok(())
    }

    fn worker_loop(&self, index: usize, local: Option<Worker<TaskEnvelope>>) {
        debug!(worker = index, "worker started");

        while let Some(envelope) = self.queue.take(local.as_ref()) {
            self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
            self.run_task(index, envelope);
        }

        debug!(worker = index, "worker exiting");
        self.detach_thread();
    }

    fn run_task(&self, worker: usize, envelope: TaskEnvelope) {
        let id = envelope.id();
        if !envelope.begin() {
            trace!(task_id = %id, worker, "skipping task cancelled before start");
            self.cancelled_tasks.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.active_tasks.fetch_add(1, Ordering::Relaxed);
        trace!(task_id = %id, worker, "task started");
        let started = Instant::now();

        let outcome = envelope.run();

        self.active_tasks.fetch_sub(1, Ordering::Relaxed);
        match outcome {
            Ok(()) => {
                self.completed_tasks.fetch_add(1, Ordering::Relaxed);
                trace!(task_id = %id, worker, elapsed = ?started.elapsed(), "task completed");
            }
            Err(SpawnError::Cancelled) => {
                self.cancelled_tasks.fetch_add(1, Ordering::Relaxed);
                trace!(task_id = %id, worker, "task cancelled itself");
            }
            Err(err) => {
                self.failed_tasks.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %id, worker, error = %err, "task failed");
            }
        }
    }

    #[inline]
    fn lock_status(&self) -> MutexGuard<'_, PoolStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach_thread(&self) {
        self.lock_status().live_threads += 1;
    }

    pub(crate) fn detach_thread(&self) {
        let mut status = self.lock_status();
        status.live_threads = status.live_threads.saturating_sub(1);
        self.try_terminate(&mut status);
    }

    fn try_terminate(&self, status: &mut PoolStatus) {
        if status.live_threads == 0 && status.state == PoolState::ShuttingDown {
            status.state = PoolState::Terminated;
            info!("pool terminated");
            self.terminated.notify_all();
        }
    }

    #[inline]
    pub fn state(&self) -> PoolState {
        self.lock_status().state
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.state() != PoolState::Running
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.state() == PoolState::Terminated
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.config.num_threads
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_running(&self) -> SpawnResult<()> {
        if unlikely(self.is_shutdown()) {
            warn!("rejecting submission: pool is shut down");
            return Err(SpawnError::Rejected(RejectReason::Shutdown));
        }
        Ok(())
    }

    /// Admission check for work that is queued later, such as delayed tasks.
    pub(crate) fn ensure_accepting(&self) -> SpawnResult<()> {
        self.ensure_running()?;
        if let Some(limit) = self.config.max_pending {
            if unlikely(self.queued_tasks.load(Ordering::Relaxed) >= limit) {
                warn!(limit, "rejecting submission: work queue is full");
                return Err(SpawnError::Rejected(RejectReason::QueueFull));
            }
        }
        Ok(())
    }

    /// Wraps `callable` in an envelope bound to this pool's cancellation token.
    pub(crate) fn prepare<C: Callable>(
        &self,
        callable: C,
        timeout: Option<Duration>,
    ) -> (TaskEnvelope, TaskHandle<C::Output>) {
        self.total_spawned.fetch_add(1, Ordering::Relaxed);
        TaskEnvelope::new(callable, timeout, self.cancellation_token.child_token())
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    /// Claims a queue slot, failing with `QueueFull` once `max_pending` slots
    /// are taken.
    fn reserve_slot(&self) -> SpawnResult<()> {
        let limit = self.config.max_pending;
        let reserved = self
            .queued_tasks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| match limit {
                Some(limit) if queued >= limit => None,
                _ => Some(queued + 1),
            });
        if unlikely(reserved.is_err()) {
            warn!(max_pending = ?limit, "rejecting submission: work queue is full");
            return Err(SpawnError::Rejected(RejectReason::QueueFull));
        }
        Ok(())
    }

    #[inline(always)]
    fn enqueue(&self, envelope: TaskEnvelope) -> Result<(), TaskEnvelope> {
        self.queued_tasks.fetch_add(1, Ordering::Relaxed);
        self.queue.push(envelope).map_err(|envelope| {
            self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
            envelope
        })
    }

    /// Hands an already admitted envelope to the workers, cancelling it if the
    /// queue is closed.
    pub(crate) fn dispatch(&self, envelope: TaskEnvelope) {
        if let Err(envelope) = self.enqueue(envelope) {
            debug!(task_id = %envelope.id(), "queue closed, cancelling dispatched task");
            if envelope.abandon() {
                self.cancelled_tasks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Submits a value-producing closure.
    pub fn submit<T, F>(&self, f: F) -> SpawnResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_callable(move |_: &TaskContext| Ok::<T, Infallible>(f()))
    }

    /// Submits fire-and-forget work.
    pub fn execute<F>(&self, f: F) -> SpawnResult<TaskHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(f)
    }

    pub fn submit_callable<C: Callable>(&self, callable: C) -> SpawnResult<TaskHandle<C::Output>> {
        self.submit_with(callable, self.config.task_timeout)
    }

    /// Submits `callable` with its own declared timeout.
    pub fn submit_with_timeout<C: Callable>(
        &self,
        callable: C,
        timeout: Duration,
    ) -> SpawnResult<TaskHandle<C::Output>> {
        self.submit_with(callable, Some(timeout))
    }

    fn submit_with<C: Callable>(
        &self,
        callable: C,
        timeout: Option<Duration>,
    ) -> SpawnResult<TaskHandle<C::Output>> {
        self.ensure_running()?;
        self.reserve_slot()?;
        let (envelope, handle) = self.prepare(callable, timeout);
        let id = envelope.id();

        if let Err(envelope) = self.queue.push(envelope) {
            self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
            envelope.abandon();
            warn!(task_id = %id, "rejecting submission: pool is shut down");
            return Err(SpawnError::Rejected(RejectReason::Shutdown));
        }

        trace!(task_id = %id, "task submitted");
        Ok(handle)
    }

    /// Submits every task, then blocks until all of them are done.
    ///
    /// Handles come back in input order. One failing task does not affect the
    /// others; if a submission is rejected, the tasks already submitted are
    /// cancelled and the rejection is returned.
    pub fn invoke_all<C, I>(&self, tasks: I) -> SpawnResult<Vec<TaskHandle<C::Output>>>
    where
        C: Callable,
        I: IntoIterator<Item = C>,
    {
        let tasks = tasks.into_iter();
        let mut handles = Vec::with_capacity(tasks.size_hint().0);

        for task in tasks {
            match self.submit_callable(task) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in &handles {
                        handle.cancel();
                    }
                    return Err(err);
                }
            }
        }

        for handle in &handles {
            handle.wait();
        }
        Ok(handles)
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        let live = self.lock_status().live_threads;
        let active = self.active_tasks.load(Ordering::Relaxed);
        PoolMetrics {
            active_tasks: active,
            idle_workers: live.min(self.config.num_threads).saturating_sub(active),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            total_spawned: self.total_spawned.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            cancelled_tasks: self.cancelled_tasks.load(Ordering::Relaxed),
        }
    }

    /// Marks the pool ShuttingDown. Returns false if it already was.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let mut status = self.lock_status();
        if status.state != PoolState::Running {
            return false;
        }
        status.state = PoolState::ShuttingDown;
        self.try_terminate(&mut status);
        true
    }

    pub(crate) fn close_queue(&self) {
        self.queue.close();
    }

    /// Stops admissions; queued and running tasks still finish.
    pub fn shutdown(&self) {
        if self.begin_shutdown() {
            info!("pool shutting down");
        }
        self.close_queue();
    }

    /// Stops admissions, interrupts running tasks and cancels queued ones.
    ///
    /// Returns the envelopes that never started.
    pub fn shutdown_now(&self) -> Vec<TaskEnvelope> {
        self.begin_shutdown();
        self.cancellation_token.cancel();
        self.queue.close();

        let abandoned = self.queue.drain();
        self.queued_tasks.fetch_sub(abandoned.len(), Ordering::Relaxed);
        for envelope in &abandoned {
            if envelope.abandon() {
                self.cancelled_tasks.fetch_add(1, Ordering::Relaxed);
            }
        }

        info!(abandoned = abandoned.len(), "pool shut down immediately");
        abandoned
    }

    /// Blocks until every worker exited, or `timeout` elapsed.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        let mut status = self.lock_status();
        while status.state != PoolState::Terminated {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return false;
            }
            let (guard, _) = self
                .terminated
                .wait_timeout(status, timeout - elapsed)
                .unwrap_or_else(PoisonError::into_inner);
            status = guard;
        }
        true
    }

    /// Graceful shutdown bounded by `timeout`, forced once it expires.
    pub fn shutdown_timeout(&self, timeout: Duration) -> bool {
        self.shutdown();
        if !self.await_termination(timeout) {
            self.shutdown_now();
            return false;
        }
        true
    }
}
