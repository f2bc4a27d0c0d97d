//! Registry of live worker threads.

use super::eventq::{EventQueue, Priority};
use crossbeam::sync::ShardedLock;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, Weak,
    },
    thread,
    time::{Duration, Instant},
};

/// One pooled thread: a name, a mailbox and a liveness flag.
#[derive(Debug)]
pub struct Worker<M> {
    name: String,
    queue: EventQueue<M>,
    finished: AtomicBool,
}

impl<M> Worker<M> {
    fn new(name: String) -> Self {
        Self {
            name,
            queue: EventQueue::new(),
            finished: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn queue(&self) -> &EventQueue<M> {
        &self.queue
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Ordered set of live workers.
///
/// A worker joins the pool before its thread starts and leaves it when the
/// thread exits (even by panic). Index positions shift as members leave.
#[derive(Debug)]
pub struct WorkerPool<M> {
    members: ShardedLock<Vec<Arc<Worker<M>>>>,
}

impl<M> Default for WorkerPool<M> {
    fn default() -> Self {
        Self {
            members: ShardedLock::new(Vec::new()),
        }
    }
}

struct ExitGuard<M> {
    pool: Weak<WorkerPool<M>>,
    worker: Arc<Worker<M>>,
}

impl<M> Drop for ExitGuard<M> {
    fn drop(&mut self) {
        self.worker.finished.store(true, Ordering::Release);
        if let Some(pool) = self.pool.upgrade() {
            pool.remove(&self.worker);
        }
    }
}

impl<M: Send + 'static> WorkerPool<M> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts a named thread running `body` and registers it.
    pub fn spawn<F>(self: &Arc<Self>, name: String, body: F) -> io::Result<Arc<Worker<M>>>
    where
        F: FnOnce(&Arc<Worker<M>>) + Send + 'static,
    {
        let worker = Arc::new(Worker::new(name.clone()));
        self.add(Arc::clone(&worker));

        let guard = ExitGuard {
            pool: Arc::downgrade(self),
            worker: Arc::clone(&worker),
        };
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let guard = guard;
            body(&guard.worker);
        });

        match spawned {
            Ok(_detached) => Ok(worker),
            Err(err) => {
                worker.finished.store(true, Ordering::Release);
                self.remove(&worker);
                Err(err)
            }
        }
    }
}

impl<M> WorkerPool<M> {
    pub fn add(&self, worker: Arc<Worker<M>>) {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(worker);
    }

    /// Drops `worker` from the pool; unknown workers are ignored.
    pub fn remove(&self, worker: &Arc<Worker<M>>) {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = members.iter().position(|w| Arc::ptr_eq(w, worker)) {
            members.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Panics
    /// When `index` is not below [`len`](Self::len).
    #[track_caller]
    pub fn get(&self, index: usize) -> Arc<Worker<M>> {
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        match members.get(index) {
            Some(worker) => Arc::clone(worker),
            None => panic!(
                "worker index {index} out of range (pool size {})",
                members.len()
            ),
        }
    }

    /// The longest-serving member, if any.
    pub fn oldest(&self) -> Option<Arc<Worker<M>>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    /// Removes members whose threads already exited but are still listed.
    pub fn gc(&self) -> usize {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        let before = members.len();
        members.retain(|w| !w.is_finished());
        before - members.len()
    }

    /// Waits until the pool is empty or `timeout` passes; returns whether it emptied.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.gc();
            if self.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl<M: Clone> WorkerPool<M> {
    /// Sends `msg` to every member, newest first.
    ///
    /// Works on a snapshot, so members leaving meanwhile are harmless.
    pub fn broadcast(&self, msg: M, priority: Priority) {
        let snapshot = self
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for worker in snapshot.iter().rev() {
            worker.queue.send(msg.clone(), priority);
        }
    }
}

/// Number of connections currently being served.
#[derive(Debug, Default)]
pub struct LoadCounter(ShardedLock<usize>);

impl LoadCounter {
    /// Returns the load including the new connection.
    pub fn increment(&self) -> usize {
        let mut load = self.0.write().unwrap_or_else(PoisonError::into_inner);
        *load += 1;
        *load
    }

    pub fn decrement(&self) -> usize {
        let mut load = self.0.write().unwrap_or_else(PoisonError::into_inner);
        *load = load.saturating_sub(1);
        *load
    }

    pub fn get(&self) -> usize {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Cmd {
        Die,
    }

    fn idle(worker: &Arc<Worker<Cmd>>) {
        while worker.queue().wait_event() != Cmd::Die {}
    }

    #[test]
    fn spawn_and_broadcast_die() {
        let pool = WorkerPool::new();
        for i in 0..4 {
            pool.spawn(format!("w-{i}"), idle).unwrap();
        }
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.get(0).name(), "w-0");

        pool.broadcast(Cmd::Die, Priority::Urgent);
        assert!(pool.drain(Duration::from_secs(5)));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn panicking_worker_leaves_pool() {
        let pool = WorkerPool::new();
        pool.spawn("boom".into(), |_: &Arc<Worker<Cmd>>| panic!("worker body"))
            .unwrap();
        assert!(pool.drain(Duration::from_secs(5)));
    }

    #[test]
    fn concurrent_exit_during_broadcast() {
        let pool = WorkerPool::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            pool.spawn(format!("w-{i}"), move |w| {
                idle(w);
                tx.send(()).unwrap();
            })
            .unwrap();
        }

        pool.get(3).queue().send(Cmd::Die, Priority::Normal);
        pool.broadcast(Cmd::Die, Priority::Normal);

        for _ in 0..16 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(pool.drain(Duration::from_secs(5)));
    }

    #[test]
    fn gc_prunes_finished() {
        let pool: WorkerPool<Cmd> = WorkerPool::default();
        let worker = Arc::new(Worker::new("stale".into()));
        pool.add(Arc::clone(&worker));
        assert_eq!(pool.gc(), 0);

        worker.finished.store(true, Ordering::Release);
        assert_eq!(pool.gc(), 1);
        assert!(pool.is_empty());
        assert!(pool.oldest().is_none());
    }

    #[test]
    fn oldest_is_first_added() {
        let pool: WorkerPool<Cmd> = WorkerPool::default();
        assert!(pool.oldest().is_none());

        let first = Arc::new(Worker::new("first".into()));
        pool.add(Arc::clone(&first));
        pool.add(Arc::new(Worker::new("second".into())));
        assert!(pool.oldest().is_some_and(|w| Arc::ptr_eq(&w, &first)));

        pool.remove(&first);
        assert_eq!(pool.oldest().map(|w| w.name().to_string()), Some("second".into()));
    }

    #[test]
    #[should_panic(expected = "worker index 2 out of range (pool size 1)")]
    fn get_out_of_range() {
        let pool: WorkerPool<Cmd> = WorkerPool::default();
        pool.add(Arc::new(Worker::new("only".into())));
        pool.get(2);
    }

    #[test]
    fn load_counter() {
        let load = LoadCounter::default();
        assert_eq!(load.increment(), 1);
        assert_eq!(load.increment(), 2);
        assert_eq!(load.decrement(), 1);
        assert_eq!(load.get(), 1);
        load.decrement();
        assert_eq!(load.decrement(), 0);
    }
}
