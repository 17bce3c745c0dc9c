//! Bounded hand-off between a foreign thread and one async consumer.
//!
//! Producers never block: when the queue is full the oldest pending item is
//! displaced and counted as dropped. The consumer waits on a [`Notify`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;

pub struct HandoffQueue<T> {
    queue: ArrayQueue<T>,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl<T> HandoffQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Enqueue without blocking, displacing the oldest item when full.
    ///
    /// Returns `false` if an item was dropped to make room.
    pub fn push(&self, item: T) -> bool {
        let displaced = self.queue.force_push(item).is_some();
        if displaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        !displaced
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Wait for the next item. Returns `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Wake the consumer and make `recv` return `None` after draining.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Items displaced since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}
