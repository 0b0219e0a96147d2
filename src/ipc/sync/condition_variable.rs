//! A named condition variable usable across processes, paired with
//! [`RobustMutex`].
//!
//! Two realizations:
//!
//! * Linux hosts a process-shared `pthread_cond_t` in shared memory and
//!   uses the realtime clock for timed waits.
//! * Darwin and Windows have no process-shared kernel condvar, so the
//!   wait/notify protocol is built from parts: a queue of waiting thread
//!   ids (a [`RingBuffer`](crate::ipc::RingBuffer) in shared memory,
//!   guarded by its own robust mutex) plus a per-waiter one-slot wakeup
//!   channel (a named FIFO on Darwin, a named semaphore on Windows).
//!
//! Wakeup order follows enrollment order only loosely; notifications may
//! race with new waiters. Spurious wakeups are permitted and callers
//! must re-check their predicate after every wait.

use super::robust_mutex::ScopedLock;
use crate::ipc::errors::IpcError;
use std::fmt;
use std::time::Duration;

/// A named cross-process condition variable.
///
/// Waiting requires the paired mutex to be held; the lock is released
/// for the duration of the wait and re-acquired before returning.
pub struct ConditionVariable {
    name: String,
    inner: platform::CondVar,
}

impl ConditionVariable {
    /// Creates the condition variable `name` as owner.
    pub fn create(name: &str) -> Result<Self, IpcError> {
        Ok(Self {
            name: name.to_owned(),
            inner: platform::CondVar::new(name, true)?,
        })
    }

    /// Opens the existing condition variable `name` as non-owner.
    pub fn open(name: &str) -> Result<Self, IpcError> {
        Ok(Self {
            name: name.to_owned(),
            inner: platform::CondVar::new(name, false)?,
        })
    }

    /// The logical name of the condition variable.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically releases the lock and blocks until notified, then
    /// re-acquires the lock.
    pub fn wait(&self, lock: &ScopedLock<'_>) -> Result<(), IpcError> {
        self.inner.wait(lock.mutex())
    }

    /// Like [`wait`](ConditionVariable::wait), but gives up after
    /// `timeout`. Returns whether the wait was notified (`false` on
    /// timeout). The lock is re-acquired either way.
    pub fn wait_bounded(&self, lock: &ScopedLock<'_>, timeout: Duration) -> Result<bool, IpcError> {
        self.inner.wait_bounded(lock.mutex(), timeout)
    }

    /// Wakes one waiter, if any.
    pub fn notify_one(&self) -> Result<(), IpcError> {
        self.inner.notify_one()
    }

    /// Wakes every current waiter.
    pub fn notify_all(&self) -> Result<(), IpcError> {
        self.inner.notify_all()
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use crate::ipc::errors::{os_error, IpcError};
    use crate::ipc::sync::RobustMutex;
    use crate::ipc::SharedMemory;
    use std::mem;
    use std::time::Duration;

    pub(super) struct CondVar {
        memory: SharedMemory,
        owner: bool,
    }

    fn absolute_deadline(timeout: Duration) -> libc::timespec {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

        let mut deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t,
            tv_nsec: now.tv_nsec + timeout.subsec_nanos() as libc::c_long,
        };
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_nsec -= 1_000_000_000;
            deadline.tv_sec += 1;
        }
        deadline
    }

    impl CondVar {
        pub(super) fn new(name: &str, owner: bool) -> Result<Self, IpcError> {
            let region_name = format!("ipc_cond_{}", name);
            let size = mem::size_of::<libc::pthread_cond_t>();
            let memory = if owner {
                SharedMemory::create(&region_name, size)?
            } else {
                SharedMemory::open(&region_name)?
            };

            let condvar = Self { memory, owner };
            if owner {
                unsafe {
                    let mut attributes: libc::pthread_condattr_t = mem::zeroed();
                    libc::pthread_condattr_init(&mut attributes);
                    libc::pthread_condattr_setpshared(
                        &mut attributes,
                        libc::PTHREAD_PROCESS_SHARED,
                    );
                    libc::pthread_condattr_setclock(&mut attributes, libc::CLOCK_REALTIME);

                    let result = libc::pthread_cond_init(condvar.handle(), &attributes);
                    libc::pthread_condattr_destroy(&mut attributes);
                    if result != 0 {
                        return Err(os_error("pthread_cond_init", result));
                    }
                }
            }
            Ok(condvar)
        }

        fn handle(&self) -> *mut libc::pthread_cond_t {
            self.memory.as_ptr() as *mut libc::pthread_cond_t
        }

        pub(super) fn notify_one(&self) -> Result<(), IpcError> {
            match unsafe { libc::pthread_cond_signal(self.handle()) } {
                0 => Ok(()),
                code => Err(os_error("pthread_cond_signal", code)),
            }
        }

        pub(super) fn notify_all(&self) -> Result<(), IpcError> {
            match unsafe { libc::pthread_cond_broadcast(self.handle()) } {
                0 => Ok(()),
                code => Err(os_error("pthread_cond_broadcast", code)),
            }
        }

        pub(super) fn wait(&self, mutex: &RobustMutex) -> Result<(), IpcError> {
            match unsafe { libc::pthread_cond_wait(self.handle(), mutex.raw()) } {
                0 => Ok(()),
                code => Err(os_error("pthread_cond_wait", code)),
            }
        }

        pub(super) fn wait_bounded(
            &self,
            mutex: &RobustMutex,
            timeout: Duration,
        ) -> Result<bool, IpcError> {
            let deadline = absolute_deadline(timeout);
            match unsafe { libc::pthread_cond_timedwait(self.handle(), mutex.raw(), &deadline) } {
                0 => Ok(true),
                libc::ETIMEDOUT => Ok(false),
                code => Err(os_error("pthread_cond_timedwait", code)),
            }
        }
    }

    impl Drop for CondVar {
        fn drop(&mut self) {
            if self.owner {
                unsafe { libc::pthread_cond_destroy(self.handle()) };
            }
        }
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use crate::ipc::errors::{os_error, IpcError};
    use crate::ipc::sync::RobustMutex;
    use crate::ipc::{Fifo, RingBuffer, SharedMemory};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    const THREAD_QUEUE_STORAGE_SIZE: usize = 128 * 1024;
    const FIFO_SYNC_MESSAGE: u32 = 0x1234_5678;

    pub(super) struct CondVar {
        // keeps the queue's backing pages mapped
        _queue_memory: SharedMemory,
        queue: Mutex<RingBuffer<u64>>,
        queue_mutex: RobustMutex,
        name: String,
    }

    fn current_thread_id() -> u64 {
        let mut thread_id = 0u64;
        unsafe { libc::pthread_threadid_np(std::ptr::null_mut(), &mut thread_id) };
        thread_id
    }

    impl CondVar {
        pub(super) fn new(name: &str, owner: bool) -> Result<Self, IpcError> {
            let queue_name = format!("{}_threadqueue", name);
            let queue_memory = if owner {
                SharedMemory::create(&queue_name, THREAD_QUEUE_STORAGE_SIZE)?
            } else {
                SharedMemory::open(&queue_name)?
            };
            let queue = unsafe {
                RingBuffer::attach(queue_memory.as_ptr(), queue_memory.len(), owner)
            };
            let queue_mutex = if owner {
                RobustMutex::create(&queue_name)?
            } else {
                RobustMutex::open(&queue_name)?
            };

            Ok(Self {
                _queue_memory: queue_memory,
                queue: Mutex::new(queue),
                queue_mutex,
                name: name.to_owned(),
            })
        }

        fn channel_name(&self, thread_id: u64) -> String {
            format!("{}_{}", self.name, thread_id)
        }

        fn enroll(&self, thread_id: u64) -> Result<(), IpcError> {
            self.queue
                .lock()
                .unwrap()
                .push_back(thread_id)
                .map_err(|_| os_error("waiter_queue_push", libc::ENOSPC))
        }

        fn withdraw(&self, thread_id: u64) -> Result<(), IpcError> {
            self.queue_mutex.lock()?;
            self.queue.lock().unwrap().remove(&thread_id);
            self.queue_mutex.unlock()
        }

        fn signal(&self, thread_id: u64) -> Result<(), IpcError> {
            let channel = Fifo::new(&self.channel_name(thread_id), false)?;
            channel.write(&FIFO_SYNC_MESSAGE.to_ne_bytes())
        }

        pub(super) fn notify_one(&self) -> Result<(), IpcError> {
            self.queue_mutex.lock()?;
            let waiter = self.queue.lock().unwrap().pop_front();
            let signalled = match waiter {
                Some(thread_id) => self.signal(thread_id),
                None => Ok(()),
            };
            signalled.and(self.queue_mutex.unlock())
        }

        pub(super) fn notify_all(&self) -> Result<(), IpcError> {
            self.queue_mutex.lock()?;
            let mut signalled = Ok(());
            while let Some(thread_id) = self.queue.lock().unwrap().pop_front() {
                signalled = signalled.and(self.signal(thread_id));
            }
            signalled.and(self.queue_mutex.unlock())
        }

        /// Opens the caller's wakeup channel, enrolls it in the waiter
        /// queue and releases both the user mutex and the queue mutex.
        fn begin_wait(&self, mutex: &RobustMutex, thread_id: u64) -> Result<Fifo, IpcError> {
            let channel = Fifo::new(&self.channel_name(thread_id), true)?;
            self.queue_mutex.lock()?;
            if let Err(error) = self.enroll(thread_id) {
                let _ = self.queue_mutex.unlock();
                return Err(error);
            }
            if let Err(error) = mutex.unlock() {
                self.queue.lock().unwrap().remove(&thread_id);
                let _ = self.queue_mutex.unlock();
                return Err(error);
            }
            self.queue_mutex.unlock()?;
            Ok(channel)
        }

        pub(super) fn wait(&self, mutex: &RobustMutex) -> Result<(), IpcError> {
            let thread_id = current_thread_id();
            let channel = self.begin_wait(mutex, thread_id)?;

            let mut buffer = [0u8; 4];
            let mut received = 0;
            while received < buffer.len() {
                received += channel.read(&mut buffer[received..])?;
            }

            mutex.lock()
        }

        pub(super) fn wait_bounded(
            &self,
            mutex: &RobustMutex,
            timeout: Duration,
        ) -> Result<bool, IpcError> {
            let thread_id = current_thread_id();
            let channel = self.begin_wait(mutex, thread_id)?;

            let deadline = Instant::now() + timeout;
            let mut buffer = [0u8; 4];
            let mut received = 0;
            let mut notified = true;
            while received < buffer.len() {
                let now = Instant::now();
                let remaining = if deadline > now {
                    deadline - now
                } else {
                    Duration::from_millis(0)
                };
                let remaining_ms = remaining.as_millis().min(i32::max_value() as u128) as i32;
                match channel.timed_read(&mut buffer[received..], remaining_ms)? {
                    Some(read) => received += read,
                    None => {
                        notified = false;
                        break;
                    }
                }
            }

            if !notified {
                self.withdraw(thread_id)?;
            }
            mutex.lock()?;
            Ok(notified)
        }
    }
}

#[cfg(windows)]
mod platform {
    use crate::ipc::errors::{last_os_error, os_error, IpcError};
    use crate::ipc::sync::RobustMutex;
    use crate::ipc::{RingBuffer, SharedMemory};
    use std::collections::HashMap;
    use std::ffi::CString;
    use std::ptr;
    use std::sync::Mutex;
    use std::time::Duration;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::GetCurrentThreadId;
    use winapi::um::synchapi::{ReleaseSemaphore, WaitForSingleObject};
    use winapi::um::winbase::{CreateSemaphoreA, INFINITE, WAIT_FAILED, WAIT_OBJECT_0};
    use winapi::um::winnt::HANDLE;

    const THREAD_QUEUE_STORAGE_SIZE: usize = 128 * 1024;

    struct Semaphore {
        handle: HANDLE,
    }

    unsafe impl Send for Semaphore {}

    impl Drop for Semaphore {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.handle) };
        }
    }

    pub(super) struct CondVar {
        // keeps the queue's backing pages mapped
        _queue_memory: SharedMemory,
        queue: Mutex<RingBuffer<u64>>,
        queue_mutex: RobustMutex,
        semaphores: Mutex<HashMap<u64, Semaphore>>,
        name: String,
    }

    fn current_thread_id() -> u64 {
        u64::from(unsafe { GetCurrentThreadId() })
    }

    impl CondVar {
        pub(super) fn new(name: &str, owner: bool) -> Result<Self, IpcError> {
            let queue_name = format!("{}_threadqueue", name);
            let queue_memory = if owner {
                SharedMemory::create(&queue_name, THREAD_QUEUE_STORAGE_SIZE)?
            } else {
                SharedMemory::open(&queue_name)?
            };
            let queue = unsafe {
                RingBuffer::attach(queue_memory.as_ptr(), queue_memory.len(), owner)
            };
            let queue_mutex = if owner {
                RobustMutex::create(&queue_name)?
            } else {
                RobustMutex::open(&queue_name)?
            };

            Ok(Self {
                _queue_memory: queue_memory,
                queue: Mutex::new(queue),
                queue_mutex,
                semaphores: Mutex::new(HashMap::new()),
                name: name.to_owned(),
            })
        }

        /// The named one-slot semaphore for `thread_id`, created on first
        /// use and drained of any stale post before reuse.
        fn semaphore(&self, thread_id: u64) -> Result<HANDLE, IpcError> {
            let mut semaphores = self.semaphores.lock().unwrap();
            if let Some(semaphore) = semaphores.get(&thread_id) {
                unsafe { WaitForSingleObject(semaphore.handle, 0) };
                return Ok(semaphore.handle);
            }

            let semaphore_name = CString::new(format!("{}_{}", self.name, thread_id))
                .map_err(|_| os_error("semaphore_name", -1))?;
            let handle =
                unsafe { CreateSemaphoreA(ptr::null_mut(), 0, 1, semaphore_name.as_ptr()) };
            if handle.is_null() {
                return Err(last_os_error("CreateSemaphoreA"));
            }
            semaphores.insert(thread_id, Semaphore { handle });
            Ok(handle)
        }

        pub(super) fn notify_one(&self) -> Result<(), IpcError> {
            self.queue_mutex.lock()?;
            let waiter = self.queue.lock().unwrap().pop_front();
            let signalled = match waiter {
                Some(thread_id) => self.signal(thread_id),
                None => Ok(()),
            };
            signalled.and(self.queue_mutex.unlock())
        }

        pub(super) fn notify_all(&self) -> Result<(), IpcError> {
            self.queue_mutex.lock()?;
            let mut signalled = Ok(());
            while let Some(thread_id) = self.queue.lock().unwrap().pop_front() {
                signalled = signalled.and(self.signal(thread_id));
            }
            signalled.and(self.queue_mutex.unlock())
        }

        fn signal(&self, thread_id: u64) -> Result<(), IpcError> {
            let handle = self.semaphore(thread_id)?;
            if unsafe { ReleaseSemaphore(handle, 1, ptr::null_mut()) } == 0 {
                return Err(last_os_error("ReleaseSemaphore"));
            }
            Ok(())
        }

        /// Enrolls the caller, resolving its semaphore first so a failure
        /// cannot strand an enrolled entry.
        fn begin_wait(&self, mutex: &RobustMutex, thread_id: u64) -> Result<HANDLE, IpcError> {
            self.queue_mutex.lock()?;
            let handle = match self.semaphore(thread_id) {
                Ok(handle) => handle,
                Err(error) => {
                    let _ = self.queue_mutex.unlock();
                    return Err(error);
                }
            };
            if self.queue.lock().unwrap().push_back(thread_id).is_err() {
                let _ = self.queue_mutex.unlock();
                return Err(os_error("waiter_queue_push", -1));
            }
            if let Err(error) = mutex.unlock() {
                self.queue.lock().unwrap().remove(&thread_id);
                let _ = self.queue_mutex.unlock();
                return Err(error);
            }
            self.queue_mutex.unlock()?;
            Ok(handle)
        }

        fn finish_wait(
            &self,
            mutex: &RobustMutex,
            thread_id: u64,
            wait_result: u32,
        ) -> Result<bool, IpcError> {
            if wait_result == WAIT_FAILED {
                let error = last_os_error("WaitForSingleObject");
                self.queue_mutex.lock()?;
                self.queue.lock().unwrap().remove(&thread_id);
                self.queue_mutex.unlock()?;
                mutex.lock()?;
                return Err(error);
            }
            if wait_result != WAIT_OBJECT_0 {
                // timed out; withdraw the stale enrollment
                self.queue_mutex.lock()?;
                self.queue.lock().unwrap().remove(&thread_id);
                self.queue_mutex.unlock()?;
            }
            mutex.lock()?;
            Ok(wait_result == WAIT_OBJECT_0)
        }

        pub(super) fn wait(&self, mutex: &RobustMutex) -> Result<(), IpcError> {
            let thread_id = current_thread_id();
            let handle = self.begin_wait(mutex, thread_id)?;
            let result = unsafe { WaitForSingleObject(handle, INFINITE) };
            self.finish_wait(mutex, thread_id, result).map(|_| ())
        }

        pub(super) fn wait_bounded(
            &self,
            mutex: &RobustMutex,
            timeout: Duration,
        ) -> Result<bool, IpcError> {
            let thread_id = current_thread_id();
            let handle = self.begin_wait(mutex, thread_id)?;
            let result =
                unsafe { WaitForSingleObject(handle, timeout.as_millis() as u32) };
            self.finish_wait(mutex, thread_id, result)
        }
    }
}
