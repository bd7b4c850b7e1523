//! Timed background task scheduler.
//!
//! Runs deferred coordinator work on a fixed pool of worker threads:
//! transaction timeouts, outcome-delivery retries and anything else the
//! service wants off the caller's thread. Tasks are either ready now or
//! due at an instant; due tasks are promoted into the ready queue, which is
//! ordered by priority and then by submission order.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

/// Priority levels for background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Housekeeping
    Low = 0,
    /// Outcome-delivery retries
    Normal = 1,
    /// Transaction timeouts
    High = 2,
}

/// Submission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The queue is at capacity.
    #[error("background scheduler queue is full")]
    Backpressure,
    /// The scheduler has been shut down.
    #[error("background scheduler is shut down")]
    ShutDown,
}

/// Scheduler metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks ready to run.
    pub queue_depth: usize,
    /// Tasks waiting for their due time.
    pub delayed_tasks: usize,
    /// Tasks currently being executed by workers.
    pub active_tasks: usize,
    /// Tasks completed since creation.
    pub tasks_completed: u64,
    /// Number of worker threads.
    pub worker_count: usize,
}

/// Handle of a delayed task, used to cancel it before it is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

type Work = Box<dyn FnOnce() + Send>;

struct TaskEnvelope {
    priority: TaskPriority,
    sequence: u64,
    work: Work,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first, then lower sequence (older) first
impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct DelayedTask {
    due: Instant,
    task: TaskEnvelope,
}

impl Eq for DelayedTask {}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.task.sequence == other.task.sequence
    }
}

// Earliest due first; BinaryHeap is a max-heap so the comparison is reversed
impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then(other.task.sequence.cmp(&self.task.sequence))
    }
}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Queues {
    ready: BinaryHeap<TaskEnvelope>,
    delayed: BinaryHeap<DelayedTask>,
}

impl Queues {
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().map_or(false, |t| t.due <= now) {
            if let Some(t) = self.delayed.pop() {
                self.ready.push(t.task);
            }
        }
    }
}

struct SchedulerInner {
    queues: ParkingMutex<Queues>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
}

/// A background task scheduler with priority ordering and delayed tasks.
///
/// Tasks are executed by a fixed pool of worker threads. Among ready tasks,
/// higher priority runs first and equal priorities run in FIFO order.
pub struct BackgroundScheduler {
    inner: Arc<SchedulerInner>,
    workers: ParkingMutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl BackgroundScheduler {
    /// Create a scheduler with the given number of worker threads.
    ///
    /// Workers are named `txcoord-bg-0`, `txcoord-bg-1`, etc.
    ///
    /// # Errors
    /// Fails when a worker thread cannot be spawned; workers already
    /// started are stopped again.
    pub fn new(num_threads: usize, max_queue_depth: usize) -> std::io::Result<Self> {
        let inner = Arc::new(SchedulerInner {
            queues: ParkingMutex::new(Queues::default()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth,
            tasks_completed: AtomicU64::new(0),
        });

        let scheduler = Self {
            inner,
            workers: ParkingMutex::new(Vec::with_capacity(num_threads)),
            num_threads,
        };

        for i in 0..num_threads {
            let inner_clone = Arc::clone(&scheduler.inner);
            let spawned = std::thread::Builder::new()
                .name(format!("txcoord-bg-{}", i))
                .spawn(move || worker_loop(&inner_clone));
            match spawned {
                Ok(handle) => scheduler.workers.lock().push(handle),
                Err(e) => {
                    scheduler.shutdown();
                    return Err(e);
                }
            }
        }

        Ok(scheduler)
    }

    /// Submit a task to run as soon as a worker is free.
    pub fn submit(
        &self,
        priority: TaskPriority,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<(), SchedulerError> {
        self.enqueue(None, priority, Box::new(work)).map(|_| ())
    }

    /// Submit a task to run once `delay` has elapsed.
    ///
    /// The returned id can [`cancel`](Self::cancel) the task until it is due.
    pub fn submit_after(
        &self,
        delay: Duration,
        priority: TaskPriority,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<TaskId, SchedulerError> {
        let due = Instant::now() + delay;
        self.enqueue(Some(due), priority, Box::new(work)).map(TaskId)
    }

    /// Drop a delayed task that is not yet due.
    ///
    /// Returns false when the task already ran, is running, or was promoted
    /// to the ready queue.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut queues = self.inner.queues.lock();
        let before = queues.delayed.len();
        queues.delayed.retain(|t| t.task.sequence != id.0);
        queues.delayed.len() != before
    }

    fn enqueue(
        &self,
        due: Option<Instant>,
        priority: TaskPriority,
        work: Work,
    ) -> Result<u64, SchedulerError> {
        // Workers exit after shutdown; the task would never run
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }

        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let task = TaskEnvelope {
            priority,
            sequence,
            work,
        };

        {
            let mut queues = self.inner.queues.lock();
            if queues.ready.len() + queues.delayed.len() >= self.inner.max_queue_depth {
                return Err(SchedulerError::Backpressure);
            }
            match due {
                Some(due) => queues.delayed.push(DelayedTask { due, task }),
                None => queues.ready.push(task),
            }
        }

        // A waiting worker recomputes its deadline when woken
        self.inner.work_ready.notify_one();
        Ok(sequence)
    }

    /// Block until every ready and in-flight task has completed.
    ///
    /// Tasks whose due time has not yet come are not waited for. Workers
    /// keep running afterwards.
    pub fn drain(&self) {
        let mut queues = self.inner.queues.lock();
        loop {
            queues.promote_due(Instant::now());
            if queues.ready.is_empty() && self.inner.active_tasks.load(AtomicOrdering::Acquire) == 0
            {
                return;
            }
            if !queues.ready.is_empty() {
                self.inner.work_ready.notify_one();
            }
            self.inner.drain_cond.wait(&mut queues);
        }
    }

    /// Shut down the scheduler: signal workers to exit and join all threads.
    ///
    /// Ready tasks still run before the workers exit; delayed tasks that
    /// are not yet due are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);

        // Lock before notifying: a worker between its shutdown check and its
        // wait holds this lock, so it either sees the flag or gets the wakeup
        {
            let _queues = self.inner.queues.lock();
            self.inner.work_ready.notify_all();
        }

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// True once `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(AtomicOrdering::Acquire)
    }

    /// Return a snapshot of scheduler metrics.
    pub fn stats(&self) -> SchedulerStats {
        let queues = self.inner.queues.lock();
        SchedulerStats {
            queue_depth: queues.ready.len(),
            delayed_tasks: queues.delayed.len(),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(AtomicOrdering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl std::fmt::Debug for BackgroundScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundScheduler")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Decrements `active_tasks` and notifies drain waiters on drop, so a
/// panicking task cannot leave `drain()` waiting forever.
struct ActiveTaskGuard<'a> {
    inner: &'a SchedulerInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        self.inner
            .tasks_completed
            .fetch_add(1, AtomicOrdering::Relaxed);

        // drain() holds the lock while checking and waiting
        if prev_active == 1 {
            let _queues = self.inner.queues.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let task = {
            let mut queues = inner.queues.lock();
            loop {
                queues.promote_due(Instant::now());
                if let Some(task) = queues.ready.pop() {
                    inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
                    break task;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    let dropped = queues.delayed.len();
                    queues.delayed.clear();
                    if dropped > 0 {
                        debug!(target: "txcoord::service", dropped, "Dropped delayed tasks at shutdown");
                    }
                    inner.drain_cond.notify_all();
                    return;
                }
                match queues.delayed.peek().map(|t| t.due) {
                    Some(due) => {
                        inner.work_ready.wait_until(&mut queues, due);
                    }
                    None => inner.work_ready.wait(&mut queues),
                }
            }
        };

        let _guard = ActiveTaskGuard { inner };

        // catch_unwind keeps the worker alive; the guard does the bookkeeping
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task.work)) {
            error!(
                target: "txcoord::service",
                "background task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    fn scheduler(threads: usize, depth: usize) -> BackgroundScheduler {
        BackgroundScheduler::new(threads, depth).unwrap()
    }

    #[test]
    fn test_submit_and_drain() {
        let scheduler = scheduler(2, 4096);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::Normal, move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }

        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 10);
        scheduler.shutdown();
    }

    #[test]
    fn test_priority_ordering() {
        let scheduler = scheduler(1, 4096);

        // Block the single worker so we can queue tasks
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler
            .submit(TaskPriority::Low, move || {
                b.wait();
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let order = Arc::new(ParkingMutex::new(Vec::new()));
        for (priority, label) in [
            (TaskPriority::Low, "low"),
            (TaskPriority::Normal, "normal"),
            (TaskPriority::High, "high"),
        ] {
            let o = Arc::clone(&order);
            scheduler
                .submit(priority, move || {
                    o.lock().push(label);
                })
                .unwrap();
        }

        barrier.wait();
        scheduler.drain();

        assert_eq!(*order.lock(), vec!["high", "normal", "low"]);
        scheduler.shutdown();
    }

    #[test]
    fn test_fifo_within_same_priority() {
        let scheduler = scheduler(1, 4096);

        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler
            .submit(TaskPriority::Low, move || {
                b.wait();
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let order = Arc::new(ParkingMutex::new(Vec::new()));
        for i in 0..5 {
            let o = Arc::clone(&order);
            scheduler
                .submit(TaskPriority::Normal, move || {
                    o.lock().push(i);
                })
                .unwrap();
        }

        barrier.wait();
        scheduler.drain();

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        scheduler.shutdown();
    }

    #[test]
    fn test_delayed_task_waits_for_due_time() {
        let scheduler = scheduler(1, 4096);
        let ran_at = Arc::new(ParkingMutex::new(None));
        let start = Instant::now();

        let r = Arc::clone(&ran_at);
        scheduler
            .submit_after(Duration::from_millis(100), TaskPriority::High, move || {
                *r.lock() = Some(Instant::now());
            })
            .unwrap();

        assert_eq!(scheduler.stats().delayed_tasks, 1);
        std::thread::sleep(Duration::from_millis(300));

        let ran_at = ran_at.lock().expect("delayed task did not run");
        assert!(ran_at.duration_since(start) >= Duration::from_millis(100));
        assert_eq!(scheduler.stats().delayed_tasks, 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_delayed_tasks_run_in_due_order() {
        let scheduler = scheduler(1, 4096);
        let order = Arc::new(ParkingMutex::new(Vec::new()));

        for (ms, label) in [(150, "late"), (50, "early"), (100, "middle")] {
            let o = Arc::clone(&order);
            scheduler
                .submit_after(Duration::from_millis(ms), TaskPriority::Normal, move || {
                    o.lock().push(label);
                })
                .unwrap();
        }

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
        scheduler.shutdown();
    }

    #[test]
    fn test_ready_task_not_blocked_by_delayed_one() {
        let scheduler = scheduler(1, 4096);
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .submit_after(Duration::from_secs(3600), TaskPriority::High, || {})
            .unwrap();
        let c = Arc::clone(&counter);
        scheduler
            .submit(TaskPriority::Low, move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            })
            .unwrap();

        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(scheduler.stats().delayed_tasks, 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_cancelled_delayed_task_never_runs() {
        let scheduler = scheduler(1, 4096);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let id = scheduler
            .submit_after(Duration::from_millis(50), TaskPriority::High, move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            })
            .unwrap();
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert_eq!(scheduler.stats().delayed_tasks, 0);

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_backpressure() {
        let scheduler = scheduler(1, 2);

        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler
            .submit(TaskPriority::Normal, move || {
                b.wait();
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        scheduler
            .submit(TaskPriority::Normal, move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            })
            .unwrap();
        let c = Arc::clone(&counter);
        scheduler
            .submit_after(Duration::ZERO, TaskPriority::Normal, move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            })
            .unwrap();

        assert_eq!(
            scheduler.submit(TaskPriority::Normal, || {}),
            Err(SchedulerError::Backpressure)
        );

        barrier.wait();
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 2);
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_runs_ready_and_drops_delayed() {
        let scheduler = scheduler(1, 4096);

        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler
            .submit(TaskPriority::Normal, move || {
                b.wait();
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::Normal, move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }
        let c = Arc::clone(&counter);
        scheduler
            .submit_after(Duration::from_secs(3600), TaskPriority::Normal, move || {
                c.fetch_add(100, AtomicOrdering::Relaxed);
            })
            .unwrap();

        barrier.wait();
        scheduler.shutdown();

        assert_eq!(counter.load(AtomicOrdering::Relaxed), 5);
        assert_eq!(scheduler.stats().delayed_tasks, 0);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let scheduler = scheduler(2, 4096);
        scheduler.shutdown();

        assert!(scheduler.is_shut_down());
        assert_eq!(
            scheduler.submit(TaskPriority::Normal, || {}),
            Err(SchedulerError::ShutDown)
        );
        assert_eq!(
            scheduler.submit_after(Duration::from_millis(1), TaskPriority::Normal, || {}),
            Err(SchedulerError::ShutDown)
        );
    }

    #[test]
    fn test_task_panic_does_not_hang_drain() {
        let scheduler = scheduler(2, 4096);
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .submit(TaskPriority::Normal, || {
                panic!("intentional test panic");
            })
            .unwrap();
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::Normal, move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }

        scheduler.drain();

        assert_eq!(counter.load(AtomicOrdering::Relaxed), 5);
        assert_eq!(scheduler.stats().tasks_completed, 6);
        scheduler.shutdown();
    }

    #[test]
    fn test_concurrent_submits() {
        let scheduler = Arc::new(scheduler(2, 4096));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&scheduler);
                let c = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let c = Arc::clone(&c);
                        s.submit(TaskPriority::Normal, move || {
                            c.fetch_add(1, AtomicOrdering::Relaxed);
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 400);
        assert_eq!(scheduler.stats().tasks_completed, 400);
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let scheduler = scheduler(2, 4096);
        scheduler.submit(TaskPriority::Normal, || {}).unwrap();
        scheduler.drain();

        scheduler.shutdown();
        scheduler.shutdown();
        scheduler.shutdown();
    }

    #[test]
    fn test_drain_returns_when_idle() {
        let scheduler = scheduler(2, 4096);
        scheduler.drain();
        let stats = scheduler.stats();
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.worker_count, 2);
        scheduler.shutdown();
    }
}
