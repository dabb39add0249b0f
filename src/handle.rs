use super::{
    errors::SpawnError,
    model::{JoinOrdering, TaskState},
    result::SpawnResult,
    task::{Lifecycle, TaskId},
};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    time::{Duration, Instant},
};
use futures::{
    future,
    stream::{FuturesUnordered, StreamExt},
    task::AtomicWaker,
};
use tokio_util::sync::CancellationToken;

struct Slot<T> {
    state: TaskState,
    outcome: Option<SpawnResult<T>>,
}

impl<T> Slot<T> {
    fn take(&mut self) -> SpawnResult<T> {
        match self.state {
            TaskState::Cancelled => Err(SpawnError::Cancelled),
            _ => self.outcome.take().unwrap_or(Err(SpawnError::ResultTaken)),
        }
    }
}

impl<T: Clone> Slot<T> {
    fn read(&self) -> SpawnResult<T> {
        match self.state {
            TaskState::Cancelled => Err(SpawnError::Cancelled),
            _ => self.outcome.clone().unwrap_or(Err(SpawnError::ResultTaken)),
        }
    }
}

/// Completion state shared by a handle and the worker that runs its task.
///
/// Only the worker moves a task out of `Running`; the waiter side reads.
pub(crate) struct Shared<T> {
    id: TaskId,
    slot: Mutex<Slot<T>>,
    done: Condvar,
    waker: AtomicWaker,
    token: CancellationToken,
    // A periodic series stays Running across firings and may be cancelled
    // between them.
    periodic: bool,
}

impl<T> Shared<T> {
    pub(crate) fn new(id: TaskId, token: CancellationToken) -> Arc<Self> {
        Self::build(id, token, false)
    }

    pub(crate) fn periodic(id: TaskId, token: CancellationToken) -> Arc<Self> {
        Self::build(id, token, true)
    }

    fn build(id: TaskId, token: CancellationToken, periodic: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            slot: Mutex::new(Slot {
                state: TaskState::Pending,
                outcome: None,
            }),
            done: Condvar::new(),
            waker: AtomicWaker::new(),
            token,
            periodic,
        })
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> TaskState {
        self.lock().state
    }

    pub(crate) fn start(&self) -> bool {
        let mut slot = self.lock();
        match slot.state {
            TaskState::Pending => {
                slot.state = TaskState::Running;
                true
            }
            TaskState::Running => self.periodic,
            _ => false,
        }
    }

    /// Running -> Completed/Failed. Ignored from any other state.
    pub(crate) fn complete(&self, outcome: SpawnResult<T>) -> bool {
        let mut slot = self.lock();
        if slot.state != TaskState::Running {
            return false;
        }
        slot.state = if outcome.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        slot.outcome = Some(outcome);
        drop(slot);
        self.wake_all();
        true
    }

    pub(crate) fn cancel(&self) -> bool {
        let mut slot = self.lock();
        let allowed = match slot.state {
            TaskState::Pending => true,
            TaskState::Running => self.periodic,
            _ => false,
        };
        if !allowed {
            return false;
        }
        slot.state = TaskState::Cancelled;
        drop(slot);
        self.token.cancel();
        self.wake_all();
        true
    }

    fn wake_all(&self) {
        self.done.notify_all();
        self.waker.wake();
    }

    fn wait_terminal(&self) -> MutexGuard<'_, Slot<T>> {
        let mut slot = self.lock();
        while !slot.state.is_terminal() {
            slot = self.done.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
        slot
    }

    fn wait_terminal_timeout(&self, timeout: Duration) -> Option<MutexGuard<'_, Slot<T>>> {
        let started = Instant::now();
        let mut slot = self.lock();
        while !slot.state.is_terminal() {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return None;
            }
            let (guard, _) = self
                .done
                .wait_timeout(slot, timeout - elapsed)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
        Some(slot)
    }
}

impl<T: Send + 'static> Lifecycle for Shared<T> {
    fn begin(&self) -> bool {
        self.start()
    }

    fn abandon(&self) -> bool {
        self.cancel()
    }

    fn state(&self) -> TaskState {
        Shared::state(self)
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Handle to a submitted task's eventual outcome.
///
/// Wait on it by blocking (`get`, `get_timeout`, `join`, `wait`), by polling
/// (`is_done`, `state`), or by `.await`ing it.
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    /// Never blocks.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Cancels a task that has not started yet and returns true.
    ///
    /// A running task only receives the interruption signal and keeps its
    /// handle until it finishes; false is returned in that case.
    pub fn cancel(&self) -> bool {
        if self.shared.cancel() {
            return true;
        }
        if self.state() == TaskState::Running {
            self.shared.token.cancel();
        }
        false
    }

    /// Blocks until the task reaches a terminal state.
    pub fn wait(&self) -> TaskState {
        self.shared.wait_terminal().state
    }

    /// True if the task reached a terminal state within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.shared.wait_terminal_timeout(timeout).is_some()
    }

    /// Blocks until the task is done and moves its outcome out.
    pub fn join(self) -> SpawnResult<T> {
        self.shared.wait_terminal().take()
    }

    /// `.await` with an upper bound; the handle stays usable after a timeout.
    pub async fn await_timeout(&mut self, timeout: Duration) -> SpawnResult<T> {
        match tokio::time::timeout(timeout, &mut *self).await {
            Ok(result) => result,
            Err(_) => Err(SpawnError::Timeout),
        }
    }

    /// `.await` that gives up with `Interrupted` when `interrupt` fires first.
    pub async fn await_interruptible(&mut self, interrupt: &CancellationToken) -> SpawnResult<T> {
        tokio::select! {
            biased;
            result = &mut *self => result,
            _ = interrupt.cancelled() => Err(SpawnError::Interrupted),
        }
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Blocks until the task is done.
    pub fn get(&self) -> SpawnResult<T> {
        self.shared.wait_terminal().read()
    }

    /// Like [`TaskHandle::get`], failing with `Timeout` if the task is not done
    /// within `timeout`. The task itself keeps running.
    pub fn get_timeout(&self, timeout: Duration) -> SpawnResult<T> {
        match self.shared.wait_terminal_timeout(timeout) {
            Some(slot) => slot.read(),
            None => Err(SpawnError::Timeout),
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = SpawnResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let shared = &self.get_mut().shared;
        shared.waker.register(cx.waker());
        let mut slot = shared.lock();
        if slot.state.is_terminal() {
            Poll::Ready(slot.take())
        } else {
            Poll::Pending
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Awaits every handle, in input order or in completion order.
pub async fn join_handles<T>(handles: Vec<TaskHandle<T>>, ordering: JoinOrdering) -> Vec<SpawnResult<T>> {
    if handles.is_empty() {
        return Vec::new();
    }

    match ordering {
        JoinOrdering::Ordered => future::join_all(handles).await,
        JoinOrdering::UnOrdered => {
            let len = handles.len();
            let mut futures = FuturesUnordered::from_iter(handles);
            let mut results = Vec::with_capacity(len);

            while let Some(result) = futures.next().await {
                results.push(result);
            }

            results
        }
    }
}
