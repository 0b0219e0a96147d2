//! The shared synchronization object behind a future/promise pair.
//!
//! One [`FutureState`] is the authoritative record of one asynchronous
//! result: its stage, the stored value or failure, the continuations to
//! run once the stage settles, and the condition used to block waiters.
//!
//! The locking contract is fixed: stage transitions are committed under
//! the state's lock, waiters are signalled there, and continuations run
//! strictly after the lock has been released. A continuation may touch
//! other states (chained `then`), so running it under the lock would
//! re-enter lock acquisitions.

use super::errors::{AlreadySatisfied, FutureError, TaskError};
use std::mem;
use std::sync::{Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// A deferred callable registered against a pending state.
pub(crate) type Continuation = Box<dyn FnOnce() + Send>;

/// The lifecycle of one asynchronous result.
///
/// Transitions are monotone: `Pending` moves to exactly one of the
/// terminal stages and never leaves it again.
enum Stage<T> {
    /// No result yet; holds the continuations to run on settlement.
    Pending(Vec<Continuation>),
    /// The computation produced a value.
    Ready(T),
    /// The computation failed.
    Failed(TaskError),
    /// The producer disappeared; no value will ever arrive.
    Abandoned,
}

impl<T> Stage<T> {
    fn is_pending(&self) -> bool {
        matches!(self, Stage::Pending(_))
    }
}

struct StateInner<T> {
    stage: Stage<T>,
    /// How many continuations were ever stored while pending. Survives
    /// the transition so schedulers can still ask afterwards.
    attached: usize,
    /// Waker of the most recent `poll`, woken on settlement.
    waker: Option<Waker>,
}

pub(crate) struct FutureState<T> {
    inner: Mutex<StateInner<T>>,
    condition: Condvar,
}

impl<T> FutureState<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                stage: Stage::Pending(Vec::new()),
                attached: 0,
                waker: None,
            }),
            condition: Condvar::new(),
        }
    }

    /// Returns whether the stage has left `Pending`.
    pub(crate) fn is_terminal(&self) -> bool {
        !self.inner.lock().unwrap().stage.is_pending()
    }

    /// Blocks the calling thread until the stage is terminal.
    pub(crate) fn wait(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.stage.is_pending() {
            inner = self.condition.wait(inner).unwrap();
        }
    }

    /// Blocks for at most `timeout`; returns whether a terminal stage was
    /// reached.
    pub(crate) fn wait_bounded(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.stage.is_pending() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (reacquired, _) = self.condition.wait_timeout(inner, deadline - now).unwrap();
            inner = reacquired;
        }
        true
    }

    /// Commits a terminal stage, signalling waiters and returning the
    /// drained continuations for the caller to run outside the lock.
    fn commit(&self, stage: Stage<T>) -> Result<Vec<Continuation>, AlreadySatisfied> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.stage.is_pending() {
            return Err(AlreadySatisfied);
        }
        let previous = mem::replace(&mut inner.stage, stage);
        let waker = inner.waker.take();
        self.condition.notify_all();
        drop(inner);
        if let Some(waker) = waker {
            waker.wake();
        }
        match previous {
            Stage::Pending(continuations) => Ok(continuations),
            _ => Ok(Vec::new()),
        }
    }

    /// Transitions to `Ready`, then runs every stored continuation in
    /// registration order on the calling thread.
    pub(crate) fn set_value(&self, value: T) -> Result<(), AlreadySatisfied> {
        let continuations = self.commit(Stage::Ready(value))?;
        for continuation in continuations {
            continuation();
        }
        Ok(())
    }

    /// Transitions to `Failed`; otherwise identical to [`set_value`].
    ///
    /// [`set_value`]: FutureState::set_value
    pub(crate) fn set_failure(&self, error: TaskError) -> Result<(), AlreadySatisfied> {
        let continuations = self.commit(Stage::Failed(error))?;
        for continuation in continuations {
            continuation();
        }
        Ok(())
    }

    /// Transitions to `Abandoned` if still pending.
    ///
    /// Stored continuations are dropped unrun: whatever producer handles
    /// they captured are released, which is how abandonment propagates
    /// down `then` chains.
    pub(crate) fn mark_abandoned(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.stage.is_pending() {
            return;
        }
        let previous = mem::replace(&mut inner.stage, Stage::Abandoned);
        let waker = inner.waker.take();
        self.condition.notify_all();
        drop(inner);
        if let Some(waker) = waker {
            waker.wake();
        }
        drop(previous);
    }

    /// Registers `continuation` if the state is pending; otherwise runs it
    /// inline on the calling thread, except against an abandoned state,
    /// where it is dropped.
    pub(crate) fn attach_continuation(&self, continuation: Continuation) {
        let mut inner = self.inner.lock().unwrap();
        match inner.stage {
            Stage::Pending(ref mut continuations) => {
                continuations.push(continuation);
            }
            Stage::Abandoned => {
                drop(inner);
                drop(continuation);
                return;
            }
            Stage::Ready(_) | Stage::Failed(_) => {
                drop(inner);
                continuation();
                return;
            }
        }
        inner.attached += 1;
    }

    /// How many continuations were stored against this state.
    pub(crate) fn number_of_continuations(&self) -> usize {
        self.inner.lock().unwrap().attached
    }
}

impl<T: Clone> FutureState<T> {
    /// Blocks until terminal, then surfaces the stored outcome.
    pub(crate) fn get(&self) -> Result<T, FutureError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match &inner.stage {
                Stage::Ready(value) => return Ok(value.clone()),
                Stage::Failed(error) => return Err(FutureError::Failed(error.clone())),
                Stage::Abandoned => return Err(FutureError::BrokenPromise),
                Stage::Pending(_) => {
                    inner = self.condition.wait(inner).unwrap();
                }
            }
        }
    }

    /// Non-blocking readiness probe for the async integration.
    pub(crate) fn poll(&self, cx: &mut Context<'_>) -> Poll<Result<T, FutureError>> {
        let mut inner = self.inner.lock().unwrap();
        match &inner.stage {
            Stage::Pending(_) => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Stage::Ready(value) => Poll::Ready(Ok(value.clone())),
            Stage::Failed(error) => Poll::Ready(Err(FutureError::Failed(error.clone()))),
            Stage::Abandoned => Poll::Ready(Err(FutureError::BrokenPromise)),
        }
    }
}
