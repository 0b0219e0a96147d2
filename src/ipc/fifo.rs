//! A named FIFO used as a one-slot wakeup channel between processes.

use super::errors::{last_os_error, os_error, IpcError};
use std::ffi::CString;
use std::os::raw::c_void;

/// How long a nominally unbounded read polls per round before retrying.
const READ_POLL_INTERVAL_MS: i32 = 10_000;

/// A named FIFO under `/tmp`, opened nonblocking and read via `poll`.
///
/// The waiter side of the condition variable owns its channel (creates
/// and unlinks it); notifiers attach as non-owners just long enough to
/// write a sync word.
pub(crate) struct Fifo {
    fd: libc::c_int,
    path: CString,
    owner: bool,
}

impl Fifo {
    pub(crate) fn new(name: &str, owner: bool) -> Result<Self, IpcError> {
        let path = CString::new(format!("/tmp/lockstep_{}", name))
            .map_err(|_| os_error("fifo_name", libc::EINVAL))?;

        if owner && unsafe { libc::mkfifo(path.as_ptr(), libc::S_IRUSR | libc::S_IWUSR) } != 0 {
            return Err(last_os_error("mkfifo"));
        }

        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if fd < 0 {
            let error = last_os_error("open");
            if owner {
                unsafe { libc::unlink(path.as_ptr()) };
            }
            return Err(error);
        }

        Ok(Self { fd, path, owner })
    }

    pub(crate) fn write(&self, buffer: &[u8]) -> Result<(), IpcError> {
        let written =
            unsafe { libc::write(self.fd, buffer.as_ptr() as *const c_void, buffer.len()) };
        if written < 0 {
            return Err(last_os_error("write"));
        }
        Ok(())
    }

    /// Blocking read; polls in bounded rounds so a lost writer cannot
    /// wedge the caller in an uninterruptible state forever.
    pub(crate) fn read(&self, buffer: &mut [u8]) -> Result<usize, IpcError> {
        loop {
            match self.poll_readable(READ_POLL_INTERVAL_MS)? {
                true => return self.read_some(buffer),
                false => continue,
            }
        }
    }

    /// Bounded read: `Ok(None)` on timeout.
    pub(crate) fn timed_read(
        &self,
        buffer: &mut [u8],
        timeout_ms: i32,
    ) -> Result<Option<usize>, IpcError> {
        if !self.poll_readable(timeout_ms)? {
            return Ok(None);
        }
        self.read_some(buffer).map(Some)
    }

    fn poll_readable(&self, timeout_ms: i32) -> Result<bool, IpcError> {
        let mut poll_details = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let result = unsafe { libc::poll(&mut poll_details, 1, timeout_ms) };
        if result < 0 {
            return Err(last_os_error("poll"));
        }
        Ok(result > 0)
    }

    fn read_some(&self, buffer: &mut [u8]) -> Result<usize, IpcError> {
        let read = unsafe { libc::read(self.fd, buffer.as_mut_ptr() as *mut c_void, buffer.len()) };
        if read < 0 {
            return Err(last_os_error("read"));
        }
        Ok(read as usize)
    }
}

impl Drop for Fifo {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
            if self.owner {
                libc::unlink(self.path.as_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        format!("{}_{:08x}", prefix, rand::random::<u32>())
    }

    #[test]
    fn write_then_read_round_trip() {
        let name = unique_name("fifo_roundtrip");
        let reader = Fifo::new(&name, true).unwrap();
        let writer = Fifo::new(&name, false).unwrap();

        writer.write(&[1, 2, 3, 4]).unwrap();
        let mut buffer = [0u8; 4];
        let read = reader.read(&mut buffer).unwrap();
        assert_eq!(read, 4);
        assert_eq!(buffer, [1, 2, 3, 4]);
    }

    #[test]
    fn timed_read_reports_a_timeout() {
        let name = unique_name("fifo_timeout");
        let reader = Fifo::new(&name, true).unwrap();
        let mut buffer = [0u8; 4];
        assert_eq!(reader.timed_read(&mut buffer, 50).unwrap(), None);
    }

    #[test]
    fn owner_unlinks_the_fifo_on_drop() {
        let name = unique_name("fifo_cleanup");
        {
            let _owner = Fifo::new(&name, true).unwrap();
        }
        assert!(Fifo::new(&name, false).is_err());
    }
}
