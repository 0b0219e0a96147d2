//! Combinators over futures: joining, racing, and dependency fusion.
//!
//! All combinators share one mechanism, lifted from the promise
//! machinery: a sink state plus a reference-counted guard. Every input
//! future gets a continuation that releases its reference to the guard;
//! what the guard does when the last reference disappears decides the
//! combinator. [`when_all`] commits the sink from the guard's disposer;
//! [`when_any`] commits the sink from the first continuation to run and
//! uses the guard only to abandon a sink none of the inputs ever settled.

use super::promise::{Future, Promise};
use crate::util::Disposer;
use std::ops::{BitAnd, BitOr};
use std::sync::Arc;

/// Attaches a continuation to `future` that drops `guard` once the
/// future settles (or immediately, if it already has; or on abandonment,
/// when the stored continuation itself is dropped).
fn observe_with_guard<T: Send + 'static>(future: &Future<T>, guard: &Arc<Disposer>) {
    let guard = Arc::clone(guard);
    future.state().attach_continuation(Box::new(move || drop(guard)));
}

/// Attaches a continuation to `future` that settles the shared `sink`.
/// Settling is idempotent across inputs; later attempts are no-ops.
fn observe_with_sink<T: Send + 'static>(future: &Future<T>, sink: &Arc<Promise<()>>) {
    let sink = Arc::clone(sink);
    future.state().attach_continuation(Box::new(move || {
        let _ = sink.set_value(());
    }));
}

fn all_guard(sink: Promise<()>) -> Arc<Disposer> {
    Arc::new(Disposer::new(move || {
        let _ = sink.set_value(());
    }))
}

/// Returns a future that becomes ready exactly when every input has
/// settled; ready, failed and abandoned inputs all count.
///
/// With zero inputs the result is ready immediately.
pub fn when_all<'a, T, I>(futures: I) -> Future<()>
where
    T: Send + 'static,
    I: IntoIterator<Item = &'a Future<T>>,
{
    let sink = Promise::new();
    let result = sink.future();
    let guard = all_guard(sink);
    for future in futures {
        observe_with_guard(future, &guard);
    }
    result
}

/// Returns a future that becomes ready as soon as any input settles.
///
/// Every input is observed; there is no short-circuiting. If every input
/// is abandoned the sink is abandoned too and consumers see a broken
/// promise.
pub fn when_any<'a, T, I>(futures: I) -> Future<()>
where
    T: Send + 'static,
    I: IntoIterator<Item = &'a Future<T>>,
{
    let sink = Arc::new(Promise::new());
    let result = sink.future();
    for future in futures {
        observe_with_sink(future, &sink);
    }
    result
}

/// `a & b` is [`when_all`] over two futures of possibly different types.
impl<T: Send + 'static, U: Send + 'static> BitAnd<Future<U>> for Future<T> {
    type Output = Future<()>;

    fn bitand(self, rhs: Future<U>) -> Future<()> {
        let sink = Promise::new();
        let result = sink.future();
        let guard = all_guard(sink);
        observe_with_guard(&self, &guard);
        observe_with_guard(&rhs, &guard);
        result
    }
}

/// `a | b` is [`when_any`] over two futures of possibly different types.
impl<T: Send + 'static, U: Send + 'static> BitOr<Future<U>> for Future<T> {
    type Output = Future<()>;

    fn bitor(self, rhs: Future<U>) -> Future<()> {
        let sink = Arc::new(Promise::new());
        let result = sink.future();
        observe_with_sink(&self, &sink);
        observe_with_sink(&rhs, &sink);
        result
    }
}

/// The dependency list accepted by
/// [`StaticThreadPool::execute_after`](crate::thread::StaticThreadPool::execute_after).
///
/// Fuses any number of futures, of any result types, into the single
/// void-typed dependency a task carries: `()` means no dependency, a
/// single future is observed directly, and tuples, vectors and slices are
/// joined with [`when_all`] semantics.
pub trait DependencyList {
    /// Collapses the list into one future that settles when every
    /// member has, or `None` for an empty list.
    fn fuse(self) -> Option<Future<()>>;
}

impl DependencyList for () {
    fn fuse(self) -> Option<Future<()>> {
        None
    }
}

impl<T: Send + 'static> DependencyList for Future<T> {
    fn fuse(self) -> Option<Future<()>> {
        Some(when_all(std::iter::once(&self)))
    }
}

impl<'a, T: Send + 'static> DependencyList for &'a Future<T> {
    fn fuse(self) -> Option<Future<()>> {
        Some(when_all(std::iter::once(self)))
    }
}

impl<T: Send + 'static> DependencyList for Vec<Future<T>> {
    fn fuse(self) -> Option<Future<()>> {
        Some(when_all(self.iter()))
    }
}

impl<'a, T: Send + 'static> DependencyList for &'a [Future<T>] {
    fn fuse(self) -> Option<Future<()>> {
        Some(when_all(self.iter()))
    }
}

macro_rules! dependency_list_for_tuple {
    ($($future:ident : $result:ident),+) => {
        impl<$($result: Send + 'static),+> DependencyList for ($(Future<$result>,)+) {
            fn fuse(self) -> Option<Future<()>> {
                let ($($future,)+) = self;
                let sink = Promise::new();
                let fused = sink.future();
                let guard = all_guard(sink);
                $(observe_with_guard(&$future, &guard);)+
                Some(fused)
            }
        }

        impl<'a, $($result: Send + 'static),+> DependencyList for ($(&'a Future<$result>,)+) {
            fn fuse(self) -> Option<Future<()>> {
                let ($($future,)+) = self;
                let sink = Promise::new();
                let fused = sink.future();
                let guard = all_guard(sink);
                $(observe_with_guard($future, &guard);)+
                Some(fused)
            }
        }
    };
}

dependency_list_for_tuple!(a: A);
dependency_list_for_tuple!(a: A, b: B);
dependency_list_for_tuple!(a: A, b: B, c: C);
dependency_list_for_tuple!(a: A, b: B, c: C, d: D);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureError;

    #[test]
    fn when_all_with_zero_inputs_is_ready_immediately() {
        let joined: Future<()> = when_all(std::iter::empty::<&Future<i32>>());
        assert!(joined.is_terminal());
        assert!(joined.get().is_ok());
    }

    #[test]
    fn when_all_waits_for_every_input() {
        let first = Promise::new();
        let second = Promise::new();
        let joined = when_all(vec![first.future(), second.future()].iter());

        assert!(!joined.is_terminal());
        first.set_value(1).unwrap();
        assert!(!joined.is_terminal());
        second.set_value(2).unwrap();
        assert!(joined.is_terminal());
        assert!(joined.get().is_ok());
    }

    #[test]
    fn when_all_counts_failed_and_abandoned_inputs_as_settled() {
        let failing = Promise::new();
        let abandoned: Promise<i32> = Promise::new();
        let joined = when_all(vec![failing.future(), abandoned.future()].iter());

        failing.set_failure("not today").unwrap();
        assert!(!joined.is_terminal());
        drop(abandoned);
        assert!(joined.is_terminal());
        assert!(joined.get().is_ok());
    }

    #[test]
    fn when_any_settles_on_the_first_input() {
        let first: Promise<i32> = Promise::new();
        let second: Promise<i32> = Promise::new();
        let raced = when_any(vec![first.future(), second.future()].iter());

        assert!(!raced.is_terminal());
        second.set_value(2).unwrap();
        assert!(raced.is_terminal());
        // the slower input settling later is an idempotent no-op
        first.set_value(1).unwrap();
        assert!(raced.get().is_ok());
    }

    #[test]
    fn when_any_with_all_inputs_abandoned_is_broken() {
        let first: Promise<i32> = Promise::new();
        let second: Promise<i32> = Promise::new();
        let raced = when_any(vec![first.future(), second.future()].iter());

        drop(first);
        drop(second);
        assert!(raced.is_terminal());
        assert!(matches!(raced.get(), Err(FutureError::BrokenPromise)));
    }

    #[test]
    fn and_then_or_composition() {
        // R = (Fa and Fb) or Fc; settling a then b settles R
        let pa: Promise<i32> = Promise::new();
        let pb: Promise<i32> = Promise::new();
        let pc: Promise<i32> = Promise::new();
        let combined = (pa.future() & pb.future()) | pc.future();

        pa.set_value(1).unwrap();
        assert!(!combined.is_terminal());
        pb.set_value(2).unwrap();
        assert!(combined.is_terminal());
    }

    #[test]
    fn or_arm_alone_settles_the_composition() {
        let pa: Promise<i32> = Promise::new();
        let pb: Promise<i32> = Promise::new();
        let pc: Promise<i32> = Promise::new();
        let combined = (pa.future() & pb.future()) | pc.future();

        pc.set_value(3).unwrap();
        assert!(combined.is_terminal());
        assert!(combined.get().is_ok());
    }

    #[test]
    fn operators_mix_result_types() {
        let text = Promise::new();
        let number = Promise::new();
        let joined = text.future() & number.future();

        text.set_value(String::from("left")).unwrap();
        number.set_value(17u64).unwrap();
        assert!(joined.is_terminal());
    }

    #[test]
    fn fuse_of_unit_is_no_dependency() {
        assert!(().fuse().is_none());
    }

    #[test]
    fn fuse_of_single_future_tracks_it() {
        let promise = Promise::new();
        let fused = promise.future().fuse().unwrap();
        assert!(!fused.is_terminal());
        promise.set_value(1).unwrap();
        assert!(fused.is_terminal());
    }

    #[test]
    fn fuse_of_heterogeneous_tuple_waits_for_all_members() {
        let text = Promise::new();
        let number = Promise::new();
        let fused = (text.future(), number.future()).fuse().unwrap();

        text.set_value(String::from("dep")).unwrap();
        assert!(!fused.is_terminal());
        number.set_value(1.5f64).unwrap();
        assert!(fused.is_terminal());
    }

    #[test]
    fn fuse_of_empty_vector_is_ready() {
        let fused = Vec::<Future<i32>>::new().fuse().unwrap();
        assert!(fused.is_terminal());
    }
}
