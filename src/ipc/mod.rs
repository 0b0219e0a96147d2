//! Cross-process facilities: named shared memory, a ring buffer over
//! caller-provided memory, and the synchronization primitives in
//! [`sync`].
//!
//! Every named object follows the same ownership rule: the *owner*
//! creates the underlying OS resource and removes it again on drop;
//! *non-owners* only attach to something that already exists and detach
//! on drop. Opening a name nobody owns fails with
//! [`IpcError::ResourceMissing`], which callers may treat as an
//! invitation to retry as owner.

pub mod sync;

mod errors;
#[cfg(target_os = "macos")]
mod fifo;
mod ring_buffer;
mod shared_memory;

pub use errors::{IpcError, OsError};
pub use ring_buffer::{BufferFull, RingBuffer};
pub use shared_memory::SharedMemory;

#[cfg(target_os = "macos")]
pub(crate) use fifo::Fifo;
