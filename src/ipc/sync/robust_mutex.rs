//! A cross-process mutex that survives the death of its holder.
//!
//! Three realizations, picked per host:
//!
//! * Linux places an OS-robust, process-shared pthread mutex in a named
//!   shared memory region. Owner death is reported by the kernel and the
//!   mutex is marked consistent before the lock is handed over.
//! * Darwin has no robust pthread mutexes, so two locks are layered: a
//!   process-shared errorcheck mutex in a per-process region coordinates
//!   the threads of one process, and an exclusive `flock` on a well-known
//!   lock file coordinates processes; the kernel drops an advisory lock
//!   automatically when its holder dies. Acquisition order is fixed:
//!   local mutex first, then the file.
//! * Windows uses a named kernel mutex, where an abandoned wait result
//!   already means "ownership transferred to you".

use crate::ipc::errors::IpcError;
use std::fmt;

/// A named mutex usable across processes, with owner-death recovery.
///
/// The owner creates the backing OS objects and removes them on drop;
/// any number of non-owners may [`open`](RobustMutex::open) the same
/// name. Locking is not recursive: a second acquisition from the holding
/// thread fails with [`IpcError::RecursiveLock`], and unlocking from a
/// thread that does not hold the mutex fails with
/// [`IpcError::NotOwner`].
pub struct RobustMutex {
    name: String,
    inner: platform::Mutex,
}

impl RobustMutex {
    /// Creates the mutex `name` as owner.
    pub fn create(name: &str) -> Result<Self, IpcError> {
        Ok(Self {
            name: name.to_owned(),
            inner: platform::Mutex::new(name, true)?,
        })
    }

    /// Opens the existing mutex `name` as non-owner.
    pub fn open(name: &str) -> Result<Self, IpcError> {
        Ok(Self {
            name: name.to_owned(),
            inner: platform::Mutex::new(name, false)?,
        })
    }

    /// The logical name of the mutex.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the mutex is acquired. If the previous holder died
    /// while holding it, the acquisition succeeds and ownership of the
    /// protected data transfers to the caller.
    pub fn lock(&self) -> Result<(), IpcError> {
        self.inner.lock()
    }

    /// Attempts the acquisition without blocking; `false` on contention,
    /// with no side effects.
    pub fn try_lock(&self) -> Result<bool, IpcError> {
        self.inner.try_lock()
    }

    /// Releases the mutex.
    pub fn unlock(&self) -> Result<(), IpcError> {
        self.inner.unlock()
    }

    /// Locks and returns a guard that unlocks on drop. This is the form
    /// [`ConditionVariable`](crate::ipc::sync::ConditionVariable) waits
    /// with.
    pub fn scoped(&self) -> Result<ScopedLock<'_>, IpcError> {
        self.lock()?;
        Ok(ScopedLock { mutex: self })
    }

    #[cfg(target_os = "linux")]
    pub(in crate::ipc::sync) fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.raw()
    }
}

impl fmt::Debug for RobustMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobustMutex").field("name", &self.name).finish()
    }
}

/// RAII ownership of a locked [`RobustMutex`]; unlocks on drop,
/// swallowing any release failure.
pub struct ScopedLock<'a> {
    mutex: &'a RobustMutex,
}

impl<'a> ScopedLock<'a> {
    /// The mutex this guard holds.
    pub fn mutex(&self) -> &'a RobustMutex {
        self.mutex
    }
}

impl<'a> Drop for ScopedLock<'a> {
    fn drop(&mut self) {
        if let Err(error) = self.mutex.unlock() {
            log::warn!("failed to release mutex {}: {}", self.mutex.name(), error);
        }
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use crate::ipc::errors::{os_error, IpcError};
    use crate::ipc::SharedMemory;
    use std::mem;

    pub(super) struct Mutex {
        memory: SharedMemory,
        owner: bool,
    }

    impl Mutex {
        pub(super) fn new(name: &str, owner: bool) -> Result<Self, IpcError> {
            let region_name = format!("ipc_mutex_{}", name);
            let size = mem::size_of::<libc::pthread_mutex_t>();
            let memory = if owner {
                SharedMemory::create(&region_name, size)?
            } else {
                SharedMemory::open(&region_name)?
            };

            let mutex = Self { memory, owner };
            if owner {
                unsafe {
                    let mut attributes: libc::pthread_mutexattr_t = mem::zeroed();
                    libc::pthread_mutexattr_init(&mut attributes);
                    libc::pthread_mutexattr_setrobust(&mut attributes, libc::PTHREAD_MUTEX_ROBUST);
                    libc::pthread_mutexattr_setpshared(
                        &mut attributes,
                        libc::PTHREAD_PROCESS_SHARED,
                    );
                    libc::pthread_mutexattr_settype(
                        &mut attributes,
                        libc::PTHREAD_MUTEX_ERRORCHECK,
                    );

                    let result = libc::pthread_mutex_init(mutex.raw(), &attributes);
                    libc::pthread_mutexattr_destroy(&mut attributes);
                    if result != 0 {
                        return Err(os_error("pthread_mutex_init", result));
                    }
                }
            }
            Ok(mutex)
        }

        pub(super) fn raw(&self) -> *mut libc::pthread_mutex_t {
            self.memory.as_ptr() as *mut libc::pthread_mutex_t
        }

        pub(super) fn lock(&self) -> Result<(), IpcError> {
            match unsafe { libc::pthread_mutex_lock(self.raw()) } {
                0 => Ok(()),
                libc::EDEADLK => Err(IpcError::RecursiveLock),
                libc::EOWNERDEAD => {
                    log::warn!("previous holder died; recovering the mutex");
                    unsafe { libc::pthread_mutex_consistent(self.raw()) };
                    Ok(())
                }
                code => Err(os_error("pthread_mutex_lock", code)),
            }
        }

        pub(super) fn try_lock(&self) -> Result<bool, IpcError> {
            match unsafe { libc::pthread_mutex_trylock(self.raw()) } {
                0 => Ok(true),
                libc::EBUSY => Ok(false),
                libc::EDEADLK => Err(IpcError::RecursiveLock),
                libc::EOWNERDEAD => {
                    log::warn!("previous holder died; recovering the mutex");
                    unsafe { libc::pthread_mutex_consistent(self.raw()) };
                    Ok(true)
                }
                code => Err(os_error("pthread_mutex_trylock", code)),
            }
        }

        pub(super) fn unlock(&self) -> Result<(), IpcError> {
            match unsafe { libc::pthread_mutex_unlock(self.raw()) } {
                0 => Ok(()),
                libc::EPERM => Err(IpcError::NotOwner),
                code => Err(os_error("pthread_mutex_unlock", code)),
            }
        }
    }

    impl Drop for Mutex {
        fn drop(&mut self) {
            if self.owner {
                unsafe { libc::pthread_mutex_destroy(self.raw()) };
            }
        }
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use crate::ipc::errors::{errno, last_os_error, os_error, IpcError};
    use crate::ipc::SharedMemory;
    use std::ffi::CString;
    use std::mem;

    pub(super) struct Mutex {
        local: SharedMemory,
        local_owner: bool,
        file: libc::c_int,
        lock_path: CString,
        owner: bool,
    }

    impl Mutex {
        pub(super) fn new(name: &str, owner: bool) -> Result<Self, IpcError> {
            let (local, local_owner) = open_local_region(name, owner)?;
            let (file, lock_path) = open_lock_file(name, owner)?;

            let mutex = Self {
                local,
                local_owner,
                file,
                lock_path,
                owner,
            };
            if mutex.local_owner {
                unsafe {
                    let mut attributes: libc::pthread_mutexattr_t = mem::zeroed();
                    libc::pthread_mutexattr_init(&mut attributes);
                    libc::pthread_mutexattr_settype(
                        &mut attributes,
                        libc::PTHREAD_MUTEX_ERRORCHECK,
                    );
                    libc::pthread_mutexattr_setpshared(
                        &mut attributes,
                        libc::PTHREAD_PROCESS_SHARED,
                    );

                    let result = libc::pthread_mutex_init(mutex.local_handle(), &attributes);
                    libc::pthread_mutexattr_destroy(&mut attributes);
                    if result != 0 {
                        return Err(os_error("pthread_mutex_init", result));
                    }
                }
            }
            Ok(mutex)
        }

        fn local_handle(&self) -> *mut libc::pthread_mutex_t {
            self.local.as_ptr() as *mut libc::pthread_mutex_t
        }

        pub(super) fn lock(&self) -> Result<(), IpcError> {
            match unsafe { libc::pthread_mutex_lock(self.local_handle()) } {
                0 => {}
                libc::EDEADLK => return Err(IpcError::RecursiveLock),
                code => return Err(os_error("pthread_mutex_lock", code)),
            }
            if unsafe { libc::flock(self.file, libc::LOCK_EX) } != 0 {
                let error = last_os_error("flock");
                unsafe { libc::pthread_mutex_unlock(self.local_handle()) };
                return Err(error);
            }
            Ok(())
        }

        pub(super) fn try_lock(&self) -> Result<bool, IpcError> {
            match unsafe { libc::pthread_mutex_trylock(self.local_handle()) } {
                0 => {}
                libc::EBUSY => return Ok(false),
                libc::EDEADLK => return Err(IpcError::RecursiveLock),
                code => return Err(os_error("pthread_mutex_trylock", code)),
            }
            if unsafe { libc::flock(self.file, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
                let code = errno();
                // back out of the local mutex so contention has no side effects
                unsafe { libc::pthread_mutex_unlock(self.local_handle()) };
                if code == libc::EWOULDBLOCK {
                    return Ok(false);
                }
                return Err(os_error("flock", code));
            }
            Ok(true)
        }

        pub(super) fn unlock(&self) -> Result<(), IpcError> {
            if unsafe { libc::flock(self.file, libc::LOCK_UN) } != 0 {
                return Err(last_os_error("flock"));
            }
            match unsafe { libc::pthread_mutex_unlock(self.local_handle()) } {
                0 => Ok(()),
                libc::EPERM => Err(IpcError::NotOwner),
                code => Err(os_error("pthread_mutex_unlock", code)),
            }
        }
    }

    impl Drop for Mutex {
        fn drop(&mut self) {
            unsafe {
                if self.local_owner {
                    libc::pthread_mutex_destroy(self.local_handle());
                }
                libc::close(self.file);
                if self.owner {
                    libc::unlink(self.lock_path.as_ptr());
                }
            }
        }
    }

    /// The intra-process half of the layered lock: a pthread mutex in a
    /// region scoped to this process. Another process may have created
    /// the advisory-lock half already, so a missing region means *we*
    /// initialize the local one regardless of the caller's role.
    fn open_local_region(name: &str, owner: bool) -> Result<(SharedMemory, bool), IpcError> {
        let region_name = format!("{}_mutex_memory_{}", name, std::process::id());
        let size = mem::size_of::<libc::pthread_mutex_t>();
        if owner {
            return Ok((SharedMemory::create(&region_name, size)?, true));
        }
        match SharedMemory::open(&region_name) {
            Ok(memory) => Ok((memory, false)),
            Err(IpcError::ResourceMissing) => Ok((SharedMemory::create(&region_name, size)?, true)),
            Err(error) => Err(error),
        }
    }

    fn open_lock_file(name: &str, owner: bool) -> Result<(libc::c_int, CString), IpcError> {
        let path = CString::new(format!("/tmp/mutex_{}.lock", name))
            .map_err(|_| os_error("lock_path", libc::EINVAL))?;

        let flags = if owner {
            libc::O_RDWR | libc::O_CREAT
        } else {
            libc::O_RDONLY
        };
        let fd = unsafe { libc::open(path.as_ptr(), flags, 0o644) };
        if fd < 0 {
            return Err(if !owner && errno() == libc::ENOENT {
                IpcError::ResourceMissing
            } else {
                last_os_error("open")
            });
        }
        Ok((fd, path))
    }
}

#[cfg(windows)]
mod platform {
    use crate::ipc::errors::{last_os_error, os_error, IpcError};
    use std::ffi::CString;
    use std::ptr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use winapi::shared::winerror::ERROR_NOT_OWNER;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::GetCurrentThreadId;
    use winapi::um::synchapi::{CreateMutexA, ReleaseMutex, WaitForSingleObject};
    use winapi::um::winbase::{INFINITE, WAIT_ABANDONED, WAIT_FAILED, WAIT_OBJECT_0};
    use winapi::um::winnt::HANDLE;

    pub(super) struct Mutex {
        handle: HANDLE,
        /// Thread id of the current holder, 0 when unheld. The kernel
        /// object allows recursion and cross-thread release; this cell
        /// provides the stricter contract.
        holder: AtomicU32,
    }

    unsafe impl Send for Mutex {}
    unsafe impl Sync for Mutex {}

    impl Mutex {
        pub(super) fn new(name: &str, _owner: bool) -> Result<Self, IpcError> {
            let mutex_name = CString::new(name).map_err(|_| os_error("mutex_name", -1))?;
            let handle = unsafe { CreateMutexA(ptr::null_mut(), 0, mutex_name.as_ptr()) };
            if handle.is_null() {
                return Err(last_os_error("CreateMutexA"));
            }
            Ok(Self {
                handle,
                holder: AtomicU32::new(0),
            })
        }

        fn acquire(&self, timeout: u32) -> Result<bool, IpcError> {
            let thread_id = unsafe { GetCurrentThreadId() };
            if self.holder.load(Ordering::SeqCst) == thread_id {
                return Err(IpcError::RecursiveLock);
            }
            match unsafe { WaitForSingleObject(self.handle, timeout) } {
                result if result == WAIT_OBJECT_0 || result == WAIT_ABANDONED => {
                    if result == WAIT_ABANDONED {
                        log::warn!("previous holder died; recovering the mutex");
                    }
                    self.holder.store(thread_id, Ordering::SeqCst);
                    Ok(true)
                }
                WAIT_FAILED => Err(IpcError::Os(crate::ipc::OsError {
                    op: "WaitForSingleObject",
                    code: unsafe { GetLastError() } as i32,
                })),
                _ => Ok(false),
            }
        }

        pub(super) fn lock(&self) -> Result<(), IpcError> {
            self.acquire(INFINITE).map(|_| ())
        }

        pub(super) fn try_lock(&self) -> Result<bool, IpcError> {
            self.acquire(0)
        }

        pub(super) fn unlock(&self) -> Result<(), IpcError> {
            let thread_id = unsafe { GetCurrentThreadId() };
            if self.holder.load(Ordering::SeqCst) != thread_id {
                return Err(IpcError::NotOwner);
            }
            self.holder.store(0, Ordering::SeqCst);
            if unsafe { ReleaseMutex(self.handle) } == 0 {
                let code = unsafe { GetLastError() };
                if code == ERROR_NOT_OWNER {
                    return Err(IpcError::NotOwner);
                }
                return Err(os_error("ReleaseMutex", code as i32));
            }
            Ok(())
        }
    }

    impl Drop for Mutex {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.handle) };
        }
    }
}
