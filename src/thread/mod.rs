//! Task representation, the worker pool, and the data-parallel executor.

mod kernel_executor;
mod task;
mod thread_pool;

pub use kernel_executor::{IndexSpace, KernelExecutor, WorkItem};
pub use task::Task;
pub use thread_pool::StaticThreadPool;
