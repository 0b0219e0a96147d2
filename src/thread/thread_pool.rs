//! A thread pool with a fixed number of workers and dependency-aware
//! scheduling.
//!
//! The pool keeps one work list guarded by one mutex. Workers scan the
//! list in insertion order and claim the first task whose dependency has
//! settled, so tasks become runnable implicitly the moment their gate
//! future turns terminal. Completing a task wakes as many additional
//! workers as the task had registered continuations (capped at the
//! worker count): each continuation is potentially a downstream task
//! turning ready, and waking exactly that many avoids both a thundering
//! herd and idle workers sitting on runnable work.

use super::task::{PoolTask, Task};
use crate::future::{DependencyList, Future};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Safety net against lost wake-ups; workers re-scan at least this often.
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

struct WorkSet {
    tasks: Vec<Box<dyn PoolTask>>,
    shutdown: bool,
}

struct PoolShared {
    work: Mutex<WorkSet>,
    condition: Condvar,
    worker_count: usize,
}

impl PoolShared {
    fn request_shutdown(&self) {
        let mut work = self.work.lock().unwrap();
        work.shutdown = true;
        self.condition.notify_all();
    }
}

/// A fixed-size worker pool executing tasks with future dependencies.
///
/// ```
/// use lockstep::StaticThreadPool;
///
/// let pool = StaticThreadPool::new(2).unwrap();
/// let first = pool.execute(|| 21);
/// let gate = first.clone();
/// let doubled = pool.execute_after(gate, move || first.get().unwrap() * 2);
/// assert_eq!(doubled.get().unwrap(), 42);
/// ```
pub struct StaticThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl StaticThreadPool {
    /// Spawns `worker_count` OS threads. The count is fixed for the
    /// pool's lifetime.
    pub fn new(worker_count: usize) -> io::Result<Self> {
        let shared = Arc::new(PoolShared {
            work: Mutex::new(WorkSet {
                tasks: Vec::new(),
                shutdown: false,
            }),
            condition: Condvar::new(),
            worker_count,
        });

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("lockstep-worker-{}", index))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    shared.request_shutdown();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(error);
                }
            }
        }

        Ok(Self { shared, workers })
    }

    /// Spawns one worker per available CPU.
    pub fn with_default_workers() -> io::Result<Self> {
        Self::new(num_cpus::get())
    }

    /// The fixed number of workers.
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    /// Queues a task with no dependencies and returns a future over the
    /// thunk's result.
    pub fn execute<F, T>(&self, func: F) -> Future<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.execute_after((), func)
    }

    /// Queues a task gated on `dependencies` (see [`DependencyList`]).
    /// The task runs once every dependency has settled, in whatever
    /// stage; inspecting their outcomes is the thunk's business.
    pub fn execute_after<D, F, T>(&self, dependencies: D, func: F) -> Future<T>
    where
        D: DependencyList,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let task = Task::new(func, dependencies.fuse());
        let future = task.future();

        let mut work = self.shared.work.lock().unwrap();
        work.tasks.push(Box::new(task));
        log::trace!("task queued, {} in the work set", work.tasks.len());
        self.shared.condition.notify_one();

        future
    }
}

fn worker_loop(shared: &PoolShared) {
    let mut work = shared.work.lock().unwrap();

    while !work.shutdown {
        let ready = work.tasks.iter().position(|task| task.is_ready());
        let claimed = ready.map(|index| work.tasks.remove(index));

        if let Some(mut task) = claimed {
            drop(work);
            task.invoke();
            work = shared.work.lock().unwrap();

            // each continuation is a potential downstream task that just
            // turned ready; wake that many workers, capped at the pool size
            let wakeups = task.number_of_continuations().min(shared.worker_count);
            log::trace!("task finished, waking {} workers", wakeups);
            for _ in 0..wakeups {
                shared.condition.notify_one();
            }
        } else if !work.shutdown {
            let (reacquired, _) = shared
                .condition
                .wait_timeout(work, WORKER_IDLE_TIMEOUT)
                .unwrap();
            work = reacquired;
        }
    }
}

impl Drop for StaticThreadPool {
    /// Stops the workers, then drops every task still in the work set;
    /// their futures become broken promises.
    fn drop(&mut self) {
        self.shared.request_shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Ok(mut work) = self.shared.work.lock() {
            if !work.tasks.is_empty() {
                log::debug!("dropping {} unrun tasks at shutdown", work.tasks.len());
            }
            work.tasks.clear();
        }
    }
}
