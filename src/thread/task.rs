//! A unit of work: a thunk, an optional readiness gate, and the promise
//! its result is published through.

use crate::future::{Future, Promise, TaskError};
use std::panic::{self, AssertUnwindSafe};

/// The capability set the pool needs from a task, independent of its
/// concrete result type.
pub(crate) trait PoolTask: Send {
    /// Whether the task may run now.
    fn is_ready(&self) -> bool;
    /// Runs the thunk and publishes its outcome. At most once.
    fn invoke(&mut self);
    /// How many downstream tasks wait on this one's result.
    fn number_of_continuations(&self) -> usize;
}

/// A thunk producing `T`, gated by an optional void dependency.
///
/// The dependency only gates *when* the task runs, not *whether*: a
/// failed or abandoned dependency still releases the task, and it is the
/// thunk's business to inspect the dependency's outcome if it cares.
pub struct Task<T> {
    func: Option<Box<dyn FnOnce() -> T + Send>>,
    promise: Promise<T>,
    dependency: Option<Future<()>>,
}

impl<T: Send + 'static> Task<T> {
    /// Creates a task from a thunk and an optional dependency.
    pub fn new(func: impl FnOnce() -> T + Send + 'static, dependency: Option<Future<()>>) -> Self {
        Self {
            func: Some(Box::new(func)),
            promise: Promise::new(),
            dependency,
        }
    }

    /// A future over the thunk's eventual result.
    pub fn future(&self) -> Future<T> {
        self.promise.future()
    }
}

impl<T: Send + 'static> PoolTask for Task<T> {
    fn is_ready(&self) -> bool {
        self.dependency
            .as_ref()
            .map_or(true, Future::is_terminal)
    }

    fn invoke(&mut self) {
        let func = match self.func.take() {
            Some(func) => func,
            None => return,
        };
        // the call consumes the thunk, so its captured state is released
        // before the promise settles and continuations run
        match panic::catch_unwind(AssertUnwindSafe(func)) {
            Ok(value) => {
                let _ = self.promise.set_value(value);
            }
            Err(payload) => {
                let _ = self.promise.set_failure(TaskError::from_panic(payload));
            }
        }
    }

    fn number_of_continuations(&self) -> usize {
        self.promise.number_of_continuations()
    }
}
