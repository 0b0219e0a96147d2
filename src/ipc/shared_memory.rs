//! A named, kernel-backed shared memory region.

use super::errors::IpcError;
use std::fmt;

/// A named shared memory region mapped read/write into this process.
///
/// Owners ([`create`](SharedMemory::create)) make the region, size it and
/// remove it again when dropped; non-owners ([`open`](SharedMemory::open))
/// attach to an existing region and only unmap on drop. The region is raw
/// bytes; whoever places data in it provides the synchronization
/// (see [`sync`](crate::ipc::sync)).
pub struct SharedMemory {
    name: String,
    region: platform::Region,
}

impl SharedMemory {
    /// Creates (or replaces) the region `name` with `size` bytes and maps
    /// it. The caller becomes the owner: dropping this handle removes the
    /// region.
    pub fn create(name: &str, size: usize) -> Result<Self, IpcError> {
        let region = platform::Region::create(name, size)?;
        log::debug!("created shared memory region {} ({} bytes)", name, size);
        Ok(Self {
            name: name.to_owned(),
            region,
        })
    }

    /// Opens the existing region `name` and maps it. The region's size is
    /// taken from the object itself. Fails with
    /// [`IpcError::ResourceMissing`] if no such region exists.
    pub fn open(name: &str) -> Result<Self, IpcError> {
        let region = platform::Region::open(name)?;
        log::debug!(
            "opened shared memory region {} ({} bytes)",
            name,
            region.size
        );
        Ok(Self {
            name: name.to_owned(),
            region,
        })
    }

    /// The logical (caller-supplied) name of the region.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The mapped size in bytes.
    pub fn len(&self) -> usize {
        self.region.size
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.region.size == 0
    }

    /// Whether this handle owns (and will remove) the region.
    pub fn is_owner(&self) -> bool {
        self.region.owner
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.region.address
    }
}

// The mapping is plain shared bytes; moving or sharing the handle between
// threads is no different from sharing it between processes. Callers
// synchronize all access to the contents.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.region.size)
            .field("owner", &self.region.owner)
            .finish()
    }
}

#[cfg(unix)]
mod platform {
    use crate::ipc::errors::{errno, last_os_error, os_error, IpcError};
    use std::ffi::CString;
    use std::ptr;

    pub(super) struct Region {
        pub(super) address: *mut u8,
        pub(super) size: usize,
        pub(super) owner: bool,
        fd: libc::c_int,
        shm_name: CString,
    }

    /// The OS-level object name for a logical region name.
    #[cfg(target_os = "linux")]
    fn object_name(name: &str) -> Result<CString, IpcError> {
        CString::new(format!("/{}", name)).map_err(|_| os_error("shm_name", libc::EINVAL))
    }

    /// Darwin limits object names to 31 bytes; a base64-encoded SHA-1
    /// digest is deterministic, unique enough, and always fits. The
    /// url-safe alphabet keeps '/' out of the name body.
    #[cfg(target_os = "macos")]
    fn object_name(name: &str) -> Result<CString, IpcError> {
        use sha1::{Digest, Sha1};
        let digest = Sha1::digest(name.as_bytes());
        let encoded = base64::encode_config(digest, base64::URL_SAFE);
        CString::new(format!("/{}", encoded)).map_err(|_| os_error("shm_name", libc::EINVAL))
    }

    fn map(fd: libc::c_int, size: usize) -> Result<*mut u8, IpcError> {
        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_NORESERVE,
                fd,
                0,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(last_os_error("mmap"));
        }
        Ok(address as *mut u8)
    }

    fn size_on_disk(fd: libc::c_int) -> Result<usize, IpcError> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            return Err(last_os_error("fstat"));
        }
        Ok(stat.st_size as usize)
    }

    impl Region {
        pub(super) fn create(name: &str, size: usize) -> Result<Self, IpcError> {
            let shm_name = object_name(name)?;

            // a stale region left behind by a crashed owner must not
            // survive into the new lifetime
            #[cfg(target_os = "macos")]
            unsafe {
                libc::shm_unlink(shm_name.as_ptr());
            }

            let flags = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;
            let mut fd = unsafe { libc::shm_open(shm_name.as_ptr(), flags, 0o640) };
            if fd < 0 && errno() == libc::EEXIST {
                if unsafe { libc::shm_unlink(shm_name.as_ptr()) } != 0 {
                    return Err(last_os_error("shm_unlink"));
                }
                fd = unsafe { libc::shm_open(shm_name.as_ptr(), flags, 0o640) };
            }
            if fd < 0 {
                return Err(last_os_error("shm_open"));
            }

            let needs_truncate = match size_on_disk(fd) {
                Ok(existing) => existing == 0,
                Err(_) => true,
            };
            if needs_truncate && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                let error = last_os_error("ftruncate");
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(shm_name.as_ptr());
                }
                return Err(error);
            }

            let address = match map(fd, size) {
                Ok(address) => address,
                Err(error) => {
                    unsafe {
                        libc::close(fd);
                        libc::shm_unlink(shm_name.as_ptr());
                    }
                    return Err(error);
                }
            };

            Ok(Self {
                address,
                size,
                owner: true,
                fd,
                shm_name,
            })
        }

        pub(super) fn open(name: &str) -> Result<Self, IpcError> {
            let shm_name = object_name(name)?;

            let fd = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0o640) };
            if fd < 0 {
                return Err(if errno() == libc::ENOENT {
                    IpcError::ResourceMissing
                } else {
                    last_os_error("shm_open")
                });
            }

            let size = match size_on_disk(fd) {
                Ok(size) => size,
                Err(error) => {
                    unsafe { libc::close(fd) };
                    return Err(error);
                }
            };

            let address = match map(fd, size) {
                Ok(address) => address,
                Err(error) => {
                    unsafe { libc::close(fd) };
                    return Err(error);
                }
            };

            Ok(Self {
                address,
                size,
                owner: false,
                fd,
                shm_name,
            })
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.address as *mut libc::c_void, self.size);
                libc::close(self.fd);
                if self.owner {
                    libc::shm_unlink(self.shm_name.as_ptr());
                }
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use crate::ipc::errors::{last_os_error, os_error, IpcError};
    use std::ffi::CString;
    use std::mem;
    use std::ptr;
    use winapi::shared::minwindef::FALSE;
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::memoryapi::{MapViewOfFile, UnmapViewOfFile, VirtualQuery, FILE_MAP_ALL_ACCESS};
    use winapi::um::winbase::{CreateFileMappingA, OpenFileMappingA};
    use winapi::um::winnt::{HANDLE, MEMORY_BASIC_INFORMATION, PAGE_READWRITE};

    pub(super) struct Region {
        pub(super) address: *mut u8,
        pub(super) size: usize,
        pub(super) owner: bool,
        handle: HANDLE,
    }

    fn object_name(name: &str) -> Result<CString, IpcError> {
        CString::new(name).map_err(|_| os_error("mapping_name", -1))
    }

    impl Region {
        pub(super) fn create(name: &str, size: usize) -> Result<Self, IpcError> {
            let mapping_name = object_name(name)?;
            let handle = unsafe {
                CreateFileMappingA(
                    INVALID_HANDLE_VALUE,
                    ptr::null_mut(),
                    PAGE_READWRITE,
                    (size as u64 >> 32) as u32,
                    (size as u64 & 0xffff_ffff) as u32,
                    mapping_name.as_ptr(),
                )
            };
            if handle.is_null() {
                return Err(last_os_error("CreateFileMappingA"));
            }
            Self::map(handle, size, true)
        }

        pub(super) fn open(name: &str) -> Result<Self, IpcError> {
            let mapping_name = object_name(name)?;
            let handle =
                unsafe { OpenFileMappingA(FILE_MAP_ALL_ACCESS, FALSE, mapping_name.as_ptr()) };
            if handle.is_null() {
                return Err(IpcError::ResourceMissing);
            }
            // 0 maps the whole object; the actual size is read back below
            Self::map(handle, 0, false)
        }

        fn map(handle: HANDLE, size: usize, owner: bool) -> Result<Self, IpcError> {
            let address = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
            if address.is_null() {
                let error = last_os_error("MapViewOfFile");
                unsafe { CloseHandle(handle) };
                return Err(error);
            }

            let size = if owner {
                size
            } else {
                let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
                let written =
                    unsafe { VirtualQuery(address, &mut info, mem::size_of_val(&info)) };
                if written == 0 {
                    let error = last_os_error("VirtualQuery");
                    unsafe {
                        UnmapViewOfFile(address);
                        CloseHandle(handle);
                    }
                    return Err(error);
                }
                info.RegionSize
            };

            Ok(Self {
                address: address as *mut u8,
                size,
                owner,
                handle,
            })
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe {
                UnmapViewOfFile(self.address as *mut _);
                CloseHandle(self.handle);
            }
        }
    }
}
