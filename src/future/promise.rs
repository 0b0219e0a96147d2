//! The user-facing producer and consumer handles over a shared state.

use super::errors::{AlreadySatisfied, FutureError, TaskError};
use super::state::FutureState;
use derivative::Derivative;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

/// The producer side of one asynchronous result.
///
/// A promise owns the right to settle its state exactly once, either with
/// a value or with a failure. Dropping a promise that never settled marks
/// the state abandoned, which every consumer observes as
/// [`FutureError::BrokenPromise`].
pub struct Promise<T> {
    state: Arc<FutureState<T>>,
}

impl<T> Promise<T> {
    /// Creates a promise with a fresh, pending state.
    pub fn new() -> Self {
        Self {
            state: Arc::new(FutureState::new()),
        }
    }

    /// Returns a consumer handle sharing this promise's state. Any number
    /// of futures may be handed out.
    pub fn future(&self) -> Future<T> {
        Future {
            state: Arc::clone(&self.state),
        }
    }

    /// Commits a value, then runs every registered continuation in
    /// registration order on the calling thread.
    pub fn set_value(&self, value: T) -> Result<(), AlreadySatisfied> {
        self.state.set_value(value)
    }

    /// Commits a failure; continuations run exactly as for a value.
    pub fn set_failure(&self, error: impl Into<TaskError>) -> Result<(), AlreadySatisfied> {
        self.state.set_failure(error.into())
    }

    /// How many continuations are registered against the shared state.
    pub fn number_of_continuations(&self) -> usize {
        self.state.number_of_continuations()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.state.mark_abandoned();
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("terminal", &self.state.is_terminal())
            .finish()
    }
}

/// A consumer-side handle to a value that may not exist yet.
///
/// Futures are cheap to clone; every clone observes the same state. The
/// handle can be blocked on ([`get`](Future::get), [`wait`](Future::wait)),
/// chained ([`then`](Future::then)) or `.await`ed: it implements
/// [`futures::Future`] with a stored waker.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Future<T> {
    state: Arc<FutureState<T>>,
}

impl<T> Future<T> {
    pub(crate) fn from_state(state: Arc<FutureState<T>>) -> Self {
        Self { state }
    }

    pub(crate) fn state(&self) -> &Arc<FutureState<T>> {
        &self.state
    }

    /// Returns whether the state has settled (ready, failed or abandoned).
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Blocks until the state settles.
    pub fn wait(&self) {
        self.state.wait();
    }

    /// Blocks for at most `timeout`. Returns whether the state settled.
    pub fn wait_bounded(&self, timeout: Duration) -> bool {
        self.state.wait_bounded(timeout)
    }

    /// How many continuations are registered against the shared state.
    pub fn number_of_continuations(&self) -> usize {
        self.state.number_of_continuations()
    }
}

impl<T: Clone> Future<T> {
    /// Blocks until the state settles, then returns a copy of the value,
    /// the stored failure, or [`FutureError::BrokenPromise`].
    pub fn get(&self) -> Result<T, FutureError> {
        self.state.get()
    }
}

impl<T: Send + 'static> Future<T> {
    /// Registers a continuation and returns a future over its result.
    ///
    /// Once this future settles, `f` is invoked with a handle to it,
    /// on the settling thread, or inline if the state already settled.
    /// `f`'s return value settles the downstream future; a panic inside
    /// `f` is captured and settles it with a failure. If this future is
    /// abandoned the continuation never runs and the downstream future is
    /// abandoned as well.
    ///
    /// The continuation holds the upstream state only weakly; the strong
    /// reference lives in the handle passed to `f` at invocation time, so
    /// a pending continuation does not keep its own state alive.
    pub fn then<F, U>(&self, f: F) -> Future<U>
    where
        F: FnOnce(Future<T>) -> U + Send + 'static,
        U: Send + 'static,
    {
        let downstream = Promise::new();
        let result = downstream.future();
        let upstream: Weak<FutureState<T>> = Arc::downgrade(&self.state);
        self.state.attach_continuation(Box::new(move || {
            if let Some(state) = upstream.upgrade() {
                let settled = Future::from_state(state);
                match panic::catch_unwind(AssertUnwindSafe(move || f(settled))) {
                    Ok(value) => {
                        let _ = downstream.set_value(value);
                    }
                    Err(payload) => {
                        let _ = downstream.set_failure(TaskError::from_panic(payload));
                    }
                }
            }
            // upgrade failure means the producer vanished mid-settlement;
            // dropping `downstream` here abandons the chained state
        }));
        result
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("terminal", &self.state.is_terminal())
            .finish()
    }
}

impl<T: Clone> futures::Future for Future<T> {
    type Output = Result<T, FutureError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.state.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    #[test]
    fn get_returns_the_committed_value() {
        let promise = Promise::new();
        let future = promise.future();
        promise.set_value(42).unwrap();
        assert_eq!(future.get().unwrap(), 42);
    }

    #[test]
    fn every_clone_observes_the_same_state() {
        let promise = Promise::new();
        let first = promise.future();
        let second = first.clone();
        promise.set_value(String::from("shared")).unwrap();
        assert_eq!(first.get().unwrap(), "shared");
        assert_eq!(second.get().unwrap(), "shared");
    }

    #[test]
    fn dropping_the_promise_breaks_the_future() {
        let promise: Promise<i32> = Promise::new();
        let future = promise.future();
        drop(promise);
        assert!(future.is_terminal());
        assert!(matches!(future.get(), Err(FutureError::BrokenPromise)));
    }

    #[test]
    fn dropping_a_settled_promise_keeps_the_value() {
        let promise = Promise::new();
        let future = promise.future();
        promise.set_value(5).unwrap();
        drop(promise);
        assert_eq!(future.get().unwrap(), 5);
    }

    #[test]
    fn get_blocks_until_another_thread_sets() {
        let promise = Promise::new();
        let future = promise.future();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            promise.set_value(99).unwrap();
        });
        assert_eq!(future.get().unwrap(), 99);
        setter.join().unwrap();
    }

    #[test]
    fn then_sees_the_upstream_value() {
        let promise = Promise::new();
        let doubled = promise.future().then(|settled| settled.get().unwrap() * 2);
        promise.set_value(21).unwrap();
        assert_eq!(doubled.get().unwrap(), 42);
    }

    #[test]
    fn then_runs_inline_when_already_settled() {
        let promise = Promise::new();
        promise.set_value(10).unwrap();
        let observed = promise.future().then(|settled| settled.get().unwrap());
        assert!(observed.is_terminal());
        assert_eq!(observed.get().unwrap(), 10);
    }

    #[test]
    fn then_captures_a_panic_as_failure() {
        let promise: Promise<i32> = Promise::new();
        let chained: Future<i32> = promise.future().then(|_| panic!("downstream failure"));
        promise.set_value(1).unwrap();
        match chained.get() {
            Err(FutureError::Failed(error)) => {
                assert_eq!(error.to_string(), "downstream failure")
            }
            other => panic!("unexpected outcome: {:?}", other.err()),
        }
    }

    #[test]
    fn then_chains_arbitrarily_deep() {
        let promise = Promise::new();
        let mut chained = promise.future();
        for _ in 0..100 {
            chained = chained.then(|settled| settled.get().unwrap() + 1);
        }
        promise.set_value(0).unwrap();
        assert_eq!(chained.get().unwrap(), 100);
    }

    #[test]
    fn abandonment_propagates_down_a_then_chain() {
        let promise: Promise<i32> = Promise::new();
        let chained = promise
            .future()
            .then(|settled| settled.get().map(|v| v + 1))
            .then(|settled| settled.get().unwrap());
        drop(promise);
        assert!(chained.is_terminal());
        assert!(matches!(chained.get(), Err(FutureError::BrokenPromise)));
    }

    #[test]
    fn continuations_run_on_the_setting_thread() {
        let promise = Promise::new();
        let setter_thread = Arc::new(Mutex::new(None));
        let recorded = Arc::clone(&setter_thread);
        let _chained = promise.future().then(move |_| {
            *recorded.lock().unwrap() = Some(thread::current().id());
        });
        let handle = thread::spawn(move || {
            let id = thread::current().id();
            promise.set_value(1).unwrap();
            id
        });
        let setter_id = handle.join().unwrap();
        assert_eq!(*setter_thread.lock().unwrap(), Some(setter_id));
    }

    #[test]
    fn continuation_ordering_is_registration_order() {
        let promise = Promise::new();
        let future = promise.future();
        let trace = Arc::new(Mutex::new(Vec::new()));
        for label in ["c1", "c2", "c3"].iter() {
            let trace = Arc::clone(&trace);
            let _ = future.then(move |settled: Future<i32>| {
                assert_eq!(settled.get().unwrap(), 42);
                trace.lock().unwrap().push(*label);
            });
        }
        promise.set_value(42).unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn number_of_continuations_counts_stored_ones() {
        let promise: Promise<i32> = Promise::new();
        let future = promise.future();
        assert_eq!(promise.number_of_continuations(), 0);
        let _a = future.then(|_| ());
        let _b = future.then(|_| ());
        assert_eq!(promise.number_of_continuations(), 2);
    }

    #[test]
    fn await_support_through_the_futures_crate() {
        let promise = Promise::new();
        let future = promise.future();
        promise.set_value(7).unwrap();
        let value = futures::executor::block_on(future);
        assert_eq!(value.unwrap(), 7);
    }

    #[test]
    fn await_wakes_when_set_from_another_thread() {
        let promise = Promise::new();
        let future = promise.future();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            promise.set_value(11).unwrap();
        });
        let value = futures::executor::block_on(future);
        assert_eq!(value.unwrap(), 11);
        setter.join().unwrap();
    }

    #[test]
    fn each_continuation_runs_exactly_once() {
        let promise = Promise::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _chained = promise.future().then(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        promise.set_value(1).unwrap();
        drop(promise);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
