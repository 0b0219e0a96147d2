//! Errors surfaced by the future/promise API.

use std::any::Any;
use std::error::Error;
use std::fmt::{self, Display};
use std::sync::Arc;

/// An opaque, cheaply clonable description of why a computation failed.
///
/// The same descriptor is surfaced on every retrieval of a failed result,
/// so it can be observed any number of times by any number of consumers.
#[derive(Clone)]
pub struct TaskError {
    inner: Arc<dyn Error + Send + Sync>,
}

impl TaskError {
    /// Wraps an arbitrary error value.
    pub fn new(error: impl Error + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Creates a descriptor from a plain message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MessageError(message.into())),
        }
    }

    /// Converts the payload of a caught panic into a descriptor.
    ///
    /// Panic payloads are almost always `&str` or `String`; anything else
    /// is reported with a generic message.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            Self::message(*message)
        } else if let Some(message) = payload.downcast_ref::<String>() {
            Self::message(message.clone())
        } else {
            Self::message("task panicked")
        }
    }
}

impl Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskError({})", self.inner)
    }
}

impl Error for TaskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.inner.as_ref() as &(dyn Error + 'static))
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::message(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::message(message)
    }
}

impl From<Box<dyn Error + Send + Sync>> for TaskError {
    fn from(error: Box<dyn Error + Send + Sync>) -> Self {
        Self {
            inner: Arc::from(error),
        }
    }
}

#[derive(Debug)]
struct MessageError(String);

impl Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for MessageError {}

/// Why a future completed without producing a value.
#[derive(Clone, Debug)]
pub enum FutureError {
    /// The producer side was dropped before a result was committed.
    BrokenPromise,
    /// The computation failed; the original failure is attached.
    Failed(TaskError),
}

impl Display for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FutureError::BrokenPromise => write!(f, "broken promise"),
            FutureError::Failed(error) => write!(f, "task failed: {}", error),
        }
    }
}

impl Error for FutureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FutureError::BrokenPromise => None,
            FutureError::Failed(error) => error.source(),
        }
    }
}

impl FutureError {
    /// Returns whether this is the broken-promise case.
    pub fn is_broken_promise(&self) -> bool {
        matches!(self, FutureError::BrokenPromise)
    }
}

/// A value or failure was already committed to the state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AlreadySatisfied;

impl Display for AlreadySatisfied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the promise was already satisfied")
    }
}

impl Error for AlreadySatisfied {}
