//! Blocking double-ended work queue with a deadline-ordered delay set.
//!
//! The queue is a pure mechanism: storage is unbounded and capacity decisions
//! belong to the caller. Two kinds of entries live in it:
//!
//! - **Ready entries** in a `VecDeque`, dispatched front to back.
//! - **Delayed entries** in a min-heap keyed by due time. They are promoted to
//!   the back of the ready deque by whichever thread next pops once they are due,
//!   so a task waiting out a backoff never occupies a worker.
//!
//! A [`Dispatch::Stop`] sentinel tells exactly one consumer to exit.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// What a consumer receives from [`WorkQueue::pop`].
#[derive(Debug)]
pub enum Dispatch<T> {
    /// A work item to run.
    Run(T),
    /// Shutdown sentinel: the consumer should exit.
    Stop,
}

/// Delayed entry ordered so the earliest due time sits on top of the max-heap.
struct Delayed<T> {
    due: Instant,
    /// Insertion order, keeps entries with equal due times FIFO.
    order: u64,
    item: T,
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.order == other.order
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a max-heap: earlier due first, then earlier insertion.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.order.cmp(&self.order))
    }
}

struct QueueState<T> {
    ready: VecDeque<Dispatch<T>>,
    delayed: BinaryHeap<Delayed<T>>,
    next_order: u64,
}

impl<T> QueueState<T> {
    /// Move every due delayed entry to the back of the ready deque.
    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(entry) = self.delayed.pop() {
                self.ready.push_back(Dispatch::Run(entry.item));
                promoted += 1;
            }
        }
        promoted
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.due)
    }
}

/// Blocking work queue shared by producers and the worker pool.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                next_order: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Insert an item at the front of the ready deque.
    pub fn push_front(&self, item: T) {
        self.state.lock().ready.push_front(Dispatch::Run(item));
        self.available.notify_one();
    }

    /// Insert an item at the back of the ready deque.
    pub fn push_back(&self, item: T) {
        self.state.lock().ready.push_back(Dispatch::Run(item));
        self.available.notify_one();
    }

    /// Make an item ready after `delay` has elapsed.
    pub fn push_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.push_back(item);
            return;
        }
        {
            let mut state = self.state.lock();
            let order = state.next_order;
            state.next_order = state.next_order.wrapping_add(1);
            state.delayed.push(Delayed {
                due: Instant::now() + delay,
                order,
                item,
            });
        }
        // A sleeping consumer may need to shorten its wait.
        self.available.notify_one();
    }

    /// Append one shutdown sentinel; it wakes exactly one consumer.
    pub fn push_stop(&self) {
        self.state.lock().ready.push_back(Dispatch::Stop);
        self.available.notify_one();
    }

    /// Take the next entry, blocking until one is ready.
    pub fn pop(&self) -> Dispatch<T> {
        let mut state = self.state.lock();
        loop {
            state.promote_due(Instant::now());
            if let Some(entry) = state.ready.pop_front() {
                if !state.ready.is_empty() {
                    // Several entries may have been promoted at once.
                    self.available.notify_one();
                }
                return entry;
            }
            match state.next_due() {
                Some(due) => {
                    self.available.wait_until(&mut state, due);
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Take the next ready entry without blocking.
    pub fn try_pop(&self) -> Option<Dispatch<T>> {
        let mut state = self.state.lock();
        state.promote_due(Instant::now());
        state.ready.pop_front()
    }

    /// Number of queued work items, ready or delayed. Sentinels are not counted.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        let ready = state
            .ready
            .iter()
            .filter(|d| matches!(d, Dispatch::Run(_)))
            .count();
        ready + state.delayed.len()
    }

    /// Number of delayed items not yet due.
    pub fn delayed_len(&self) -> usize {
        self.state.lock().delayed.len()
    }

    /// Whether no work items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every work item, ready ones first, then delayed ones in due order.
    /// Sentinels are discarded.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let mut items: Vec<T> = state
            .ready
            .drain(..)
            .filter_map(|d| match d {
                Dispatch::Run(item) => Some(item),
                Dispatch::Stop => None,
            })
            .collect();
        while let Some(entry) = state.delayed.pop() {
            items.push(entry.item);
        }
        items
    }

    /// Block on the queue's condition for at most `timeout`.
    ///
    /// Returns `true` if woken by a notification rather than the timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        !self.available.wait_for(&mut state, timeout).timed_out()
    }

    /// Wake one thread blocked in [`pop`](Self::pop) or [`wait_for`](Self::wait_for).
    pub fn notify_one(&self) {
        self.available.notify_one();
    }

    /// Wake every blocked thread.
    pub fn notify_all(&self) {
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn run<T>(d: Dispatch<T>) -> T {
        match d {
            Dispatch::Run(item) => item,
            Dispatch::Stop => panic!("unexpected sentinel"),
        }
    }

    #[test]
    fn test_fifo_with_front_insertion() {
        let q = WorkQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.push_front(0);
        assert_eq!(q.len(), 3);
        assert_eq!(run(q.pop()), 0);
        assert_eq!(run(q.pop()), 1);
        assert_eq!(run(q.pop()), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_sentinel_not_counted() {
        let q = WorkQueue::<u32>::new();
        q.push_stop();
        assert_eq!(q.len(), 0);
        assert!(matches!(q.pop(), Dispatch::Stop));
    }

    #[test]
    fn test_delayed_item_waits_until_due() {
        let q = WorkQueue::new();
        let start = Instant::now();
        q.push_after("late", Duration::from_millis(60));
        q.push_back("now");

        assert_eq!(run(q.pop()), "now");
        assert!(q.try_pop().is_none());
        assert_eq!(q.delayed_len(), 1);

        assert_eq!(run(q.pop()), "late");
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_delayed_items_ordered_by_due_time() {
        let q = WorkQueue::new();
        q.push_after(3, Duration::from_millis(30));
        q.push_after(1, Duration::from_millis(10));
        q.push_after(2, Duration::from_millis(20));
        assert_eq!(run(q.pop()), 1);
        assert_eq!(run(q.pop()), 2);
        assert_eq!(run(q.pop()), 3);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let q = Arc::new(WorkQueue::new());
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || run(q.pop()))
        };
        thread::sleep(Duration::from_millis(20));
        q.push_back(42);
        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn test_one_sentinel_per_consumer() {
        let q = Arc::new(WorkQueue::<u32>::new());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || matches!(q.pop(), Dispatch::Stop))
            })
            .collect();
        for _ in 0..4 {
            q.push_stop();
        }
        for c in consumers {
            assert!(c.join().unwrap());
        }
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_drain_takes_ready_and_delayed() {
        let q = WorkQueue::new();
        q.push_back(1);
        q.push_stop();
        q.push_after(3, Duration::from_secs(60));
        q.push_back(2);
        assert_eq!(q.drain(), vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_wait_for_times_out_and_notifies() {
        let q = Arc::new(WorkQueue::<u32>::new());
        assert!(!q.wait_for(Duration::from_millis(10)));

        let waiter = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.wait_for(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(30));
        q.notify_all();
        assert!(waiter.join().unwrap());
    }
}
