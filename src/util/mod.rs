//! Small support utilities.

mod disposer;

pub use disposer::Disposer;
