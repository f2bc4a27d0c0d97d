use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Mutual exclusion with a bounded wait.
///
/// Workers take this before calling `accept` so only one of them sits on the
/// listening socket; the others give up after a timeout and go check their
/// mailbox.
#[derive(Debug, Default)]
pub struct TimedLock {
    held: Mutex<bool>,
    released: Condvar,
}

/// Releases the [`TimedLock`] on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct TimedLockGuard<'a> {
    lock: &'a TimedLock,
}

impl TimedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits at most `timeout` for the lock.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<TimedLockGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            let left = deadline.checked_duration_since(Instant::now())?;
            if left.is_zero() {
                return None;
            }
            held = self
                .released
                .wait_timeout(held, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *held = true;
        Some(TimedLockGuard { lock: self })
    }

    pub fn try_lock(&self) -> Option<TimedLockGuard<'_>> {
        self.try_lock_for(Duration::ZERO)
    }
}

impl Drop for TimedLockGuard<'_> {
    fn drop(&mut self) {
        *self
            .lock
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
        self.lock.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    #[test]
    fn second_taker_times_out() {
        let lock = TimedLock::new();
        let guard = lock.try_lock().unwrap();
        assert!(lock.try_lock_for(Duration::from_millis(30)).is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn excludes_concurrent_holders() {
        let lock = Arc::new(TimedLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (lock, inside) = (Arc::clone(&lock), Arc::clone(&inside));
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _g = lock.try_lock_for(Duration::from_secs(10)).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}
