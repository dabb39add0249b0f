//! Queues feeding the workers.
//!
//! All three block a taker on a `Condvar` and hand the item back from `push`
//! once closed. Closing never discards: takers keep receiving what is left and
//! see `None` only when the queue is closed and empty.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    iter, mem,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use crossbeam::deque::{Injector, Steal, Stealer, Worker};

#[inline]
fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FifoState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Strict FIFO queue shared by every worker.
pub struct FifoQueue<T> {
    state: Mutex<FifoState<T>>,
    available: Condvar,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FifoState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends and wakes one taker.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until an item is available; `None` once closed and drained.
    pub fn take(&self) -> Option<T> {
        let mut state = lock(&self.state);
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.available.notify_all();
    }

    /// Removes every queued item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        lock(&self.state).items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Work-stealing queue: a global injector plus one deque per worker.
///
/// Workers own their [`Worker`] deque and pass it to [`StealingQueue::take`].
pub struct StealingQueue<T> {
    injector: Injector<T>,
    stealers: Vec<Stealer<T>>,
    closed: Mutex<bool>,
    available: Condvar,
}

impl<T> StealingQueue<T> {
    /// Creates the queue and the local deques of `workers` workers.
    pub fn new(workers: usize) -> (Self, Vec<Worker<T>>) {
        let locals: Vec<Worker<T>> = (0..workers).map(|_| Worker::new_fifo()).collect();
        let stealers = locals.iter().map(Worker::stealer).collect();
        let queue = Self {
            injector: Injector::new(),
            stealers,
            closed: Mutex::new(false),
            available: Condvar::new(),
        };
        (queue, locals)
    }

    pub fn push(&self, item: T) -> Result<(), T> {
        // Pushing under the lock pairs with the emptiness re-check in `take`.
        let closed = lock(&self.closed);
        if *closed {
            return Err(item);
        }
        self.injector.push(item);
        drop(closed);
        self.available.notify_one();
        Ok(())
    }

    pub fn take(&self, local: &Worker<T>) -> Option<T> {
        loop {
            if let Some(item) = self.find_task(local) {
                return Some(item);
            }

            let closed = lock(&self.closed);
            if self.has_work() {
                continue;
            }
            if *closed {
                return None;
            }
            let _guard = self
                .available
                .wait(closed)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn find_task(&self, local: &Worker<T>) -> Option<T> {
        local.pop().or_else(|| {
            iter::repeat_with(|| {
                self.injector
                    .steal_batch_and_pop(local)
                    .or_else(|| self.stealers.iter().map(Stealer::steal).collect())
            })
            .find(|s| !s.is_retry())
            .and_then(Steal::success)
        })
    }

    fn has_work(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    pub fn close(&self) {
        *lock(&self.closed) = true;
        self.available.notify_all();
    }

    /// Steals everything left in the injector and in every worker deque.
    pub fn drain(&self) -> Vec<T> {
        let mut drained = Vec::new();
        loop {
            match self.injector.steal() {
                Steal::Success(item) => drained.push(item),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        for stealer in &self.stealers {
            loop {
                match stealer.steal() {
                    Steal::Success(item) => drained.push(item),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.injector.len() + self.stealers.iter().map(Stealer::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_work()
    }
}

struct Entry<T> {
    trigger: Instant,
    seq: u64,
    item: T,
}

// Reversed so that the max-heap pops the earliest trigger, oldest first on ties.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .trigger
            .cmp(&self.trigger)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.trigger == other.trigger && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

struct DelayState<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    closed: bool,
}

/// Time-ordered queue: an item becomes visible once its trigger has elapsed.
pub struct DelayQueue<T> {
    state: Mutex<DelayState<T>>,
    available: Condvar,
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DelayState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, trigger: Instant, item: T) -> Result<(), T> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(item);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let new_head = state.heap.peek().map_or(true, |head| trigger < head.trigger);
        state.heap.push(Entry { trigger, seq, item });
        drop(state);
        // Takers sleeping until a later trigger must re-arm their wait.
        if new_head {
            self.available.notify_all();
        }
        Ok(())
    }

    /// Blocks until the earliest trigger has elapsed and returns that item.
    pub fn take(&self) -> Option<(Instant, T)> {
        self.take_with(|trigger, item| (trigger, item))
    }

    /// Like [`DelayQueue::take`], but hands the item to `f` before the queue
    /// is unlocked, so `drain` and `retain` never miss an item in transit.
    pub fn take_with<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(Instant, T) -> R,
    {
        let mut state = lock(&self.state);
        loop {
            let now = Instant::now();
            match state.heap.peek().map(|head| head.trigger) {
                Some(trigger) if trigger <= now => {
                    if let Some(entry) = state.heap.pop() {
                        if !state.heap.is_empty() {
                            self.available.notify_one();
                        }
                        return Some(f(entry.trigger, entry.item));
                    }
                }
                Some(trigger) => {
                    let (guard, _) = self
                        .available
                        .wait_timeout(state, trigger - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
                None if state.closed => return None,
                None => {
                    state = self
                        .available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Stops admissions. Queued items still fire at their trigger.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Keeps the items matching `keep` and returns the others.
    pub fn retain<F>(&self, mut keep: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut state = lock(&self.state);
        let (kept, removed): (Vec<_>, Vec<_>) = mem::take(&mut state.heap)
            .into_vec()
            .into_iter()
            .partition(|entry| keep(&entry.item));
        state.heap = kept.into();
        drop(state);
        self.available.notify_all();
        removed.into_iter().map(|entry| entry.item).collect()
    }

    /// Removes every item, earliest trigger first.
    pub fn drain(&self) -> Vec<(Instant, T)> {
        let mut entries = mem::take(&mut lock(&self.state).heap).into_sorted_vec();
        entries.reverse();
        entries
            .into_iter()
            .map(|entry| (entry.trigger, entry.item))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
