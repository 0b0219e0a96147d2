//! A scope guard that runs a deferred action when it goes out of scope.

use std::fmt;

/// Holds an optional action and runs it exactly once on drop.
///
/// Used throughout the crate to tie resource release to scope exit:
/// unmapping shared memory, unlinking named OS objects, or committing a
/// combinator sink once the last reference disappears.
///
/// ```
/// use lockstep::util::Disposer;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// let fired = Arc::new(AtomicBool::new(false));
/// {
///     let fired = Arc::clone(&fired);
///     let _guard = Disposer::new(move || fired.store(true, Ordering::SeqCst));
/// }
/// assert!(fired.load(Ordering::SeqCst));
/// ```
#[derive(Default)]
pub struct Disposer {
    action: Option<Box<dyn FnOnce() + Send>>,
}

// A shared reference can only observe `is_armed`; the action itself is
// reachable solely through `&mut self` or drop.
unsafe impl Sync for Disposer {}

impl Disposer {
    /// Constructs a guard holding `action`.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// Constructs a guard with no action.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replaces the held action. A previously held action is dropped
    /// without running.
    pub fn set(&mut self, action: impl FnOnce() + Send + 'static) {
        self.action = Some(Box::new(action));
    }

    /// Drops the held action without running it.
    pub fn disarm(&mut self) {
        self.action = None;
    }

    /// Returns whether an action is currently held.
    pub fn is_armed(&self) -> bool {
        self.action.is_some()
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("armed", &self.is_armed())
            .finish()
    }
}
