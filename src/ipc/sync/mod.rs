//! Cross-process synchronization: a robust mutex and a named condition
//! variable that pairs with it.

mod condition_variable;
mod robust_mutex;

pub use condition_variable::ConditionVariable;
pub use robust_mutex::{RobustMutex, ScopedLock};
