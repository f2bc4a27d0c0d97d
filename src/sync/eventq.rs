//! Thread-safe mailbox with priority insertion.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Where a message lands in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Appended after everything already queued.
    Normal,
    /// Delivered before every queued message.
    Urgent,
}

/// FIFO of messages addressed to a single thread.
///
/// Any thread may [`send`](Self::send); the owner drains it with
/// [`next_event`](Self::next_event) or blocks in one of the wait calls.
/// Each message is delivered exactly once.
#[derive(Debug)]
pub struct EventQueue<M> {
    queue: Mutex<VecDeque<M>>,
    signal: Condvar,
}

impl<M> Default for EventQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventQueue<M> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, VecDeque<M>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `msg` and wakes one waiter.
    pub fn send(&self, msg: M, priority: Priority) {
        let mut queue = self.lock();
        match priority {
            Priority::Normal => queue.push_back(msg),
            Priority::Urgent => queue.push_front(msg),
        }
        drop(queue);
        self.signal.notify_one();
    }

    /// Takes the head of the queue without blocking.
    pub fn next_event(&self) -> Option<M> {
        self.lock().pop_front()
    }

    /// Blocks until a message arrives.
    pub fn wait_event(&self) -> M {
        let mut queue = self.lock();
        loop {
            if let Some(msg) = queue.pop_front() {
                return msg;
            }
            queue = self
                .signal
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks for at most `timeout`; `None` means nothing arrived in time.
    pub fn wait_event_timeout(&self, timeout: Duration) -> Option<M> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        loop {
            if let Some(msg) = queue.pop_front() {
                return Some(msg);
            }
            let left = deadline.checked_duration_since(Instant::now())?;
            if left.is_zero() {
                return None;
            }
            queue = self
                .signal
                .wait_timeout(queue, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
