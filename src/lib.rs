//! Futures with continuations, dependency-aware thread pools, and
//! cross-process synchronization primitives.
//!
//! The crate is split in two halves that compose but do not depend on
//! each other:
//!
//! * [`future`] and [`thread`] form the in-process half: a
//!   [`Promise`](future::Promise)/[`Future`](future::Future) pair with
//!   continuation chaining, a [`StaticThreadPool`](thread::StaticThreadPool)
//!   that runs tasks once their declared dependencies have settled, and a
//!   [`KernelExecutor`](thread::KernelExecutor) that spreads an
//!   N-dimensional index space across the pool.
//! * [`ipc`] is the cross-process half: named shared memory, a ring
//!   buffer over caller-provided memory, a robust mutex that survives the
//!   death of its holder, and a named condition variable.

pub mod future;
pub mod ipc;
pub mod thread;
pub mod util;

pub use future::{
    when_all, when_any, AlreadySatisfied, DependencyList, Future, FutureError, Promise, TaskError,
};
pub use thread::{IndexSpace, KernelExecutor, StaticThreadPool, Task, WorkItem};
