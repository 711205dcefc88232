//! POSIX shared memory region backing.
//!
//! The participant that allocates an endpoint creates the shared memory
//! object and writes the region header; remote participants attach by name,
//! validate the header and map the size it records.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

use super::{RegionBacking, RegionHeader};

/// Failures while creating, attaching or mapping a region
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shm_open(O_CREAT) failed: {0}")]
    CreateFailed(#[source] io::Error),
    #[error("shm_open failed: {0}")]
    OpenFailed(#[source] io::Error),
    #[error("ftruncate of region failed: {0}")]
    TruncateFailed(#[source] io::Error),
    #[error("mmap of region failed: {0}")]
    MmapFailed(#[source] io::Error),
    /// Magic or version mismatch in the first bytes of the object
    #[error("region header has wrong magic or version")]
    InvalidHeader,
    #[error("not a usable shm object name: {0:?}")]
    InvalidName(String),
}

/// A mapped POSIX shared memory object
#[derive(Debug)]
pub struct ShmBacking {
    /// Object name, always with a leading '/'
    name: String,
    base_ptr: NonNull<u8>,
    total_size: usize,
    /// Creator unlinks the object on drop
    is_owner: bool,
}

// SAFETY: the mapping is process-shared, not thread-specific, and all
// concurrently accessed words inside it are atomics.
unsafe impl Send for ShmBacking {}

// SAFETY: see `Send`.
unsafe impl Sync for ShmBacking {}

impl ShmBacking {
    /// Create a new shared memory object of `size` bytes (endpoint owner side).
    pub fn create(name: &str, size: usize) -> Result<Self, ShmError> {
        let shm_name = Self::normalize_name(name);
        let c_name = Self::c_name(&shm_name)?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::CreateFailed(io::Error::last_os_error()));
        }

        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(ShmError::TruncateFailed(err));
        }

        let mapped = Self::map_fd(fd, size);
        unsafe { libc::close(fd) };

        let base_ptr = match mapped {
            Ok(ptr) => ptr,
            Err(e) => {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(e);
            }
        };

        tracing::debug!("Created shared memory {} ({} bytes)", shm_name, size);

        Ok(Self {
            name: shm_name,
            base_ptr,
            total_size: size,
            is_owner: true,
        })
    }

    /// Attach to an existing shared memory object (remote side).
    pub fn attach(name: &str) -> Result<Self, ShmError> {
        let shm_name = Self::normalize_name(name);
        let c_name = Self::c_name(&shm_name)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ShmError::OpenFailed(io::Error::last_os_error()));
        }

        // First, map just the header to learn the region size
        let header_size = std::mem::size_of::<RegionHeader>();
        let header_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                header_size,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if header_ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ShmError::MmapFailed(err));
        }

        // SAFETY: the header mapping is at least size_of::<RegionHeader>() bytes.
        let header = unsafe { std::ptr::read_unaligned(header_ptr as *const RegionHeader) };
        unsafe { libc::munmap(header_ptr, header_size) };

        if !header.validate() {
            unsafe { libc::close(fd) };
            return Err(ShmError::InvalidHeader);
        }

        let total_size = header.size as usize;
        let mapped = Self::map_fd(fd, total_size);
        unsafe { libc::close(fd) };
        let base_ptr = mapped?;

        tracing::debug!("Attached to shared memory {} ({} bytes)", shm_name, total_size);

        Ok(Self {
            name: shm_name,
            base_ptr,
            total_size,
            is_owner: false,
        })
    }

    /// Like [`attach`](Self::attach), with a missing object reported as `None`
    pub fn try_attach(name: &str) -> Result<Option<Self>, ShmError> {
        match Self::attach(name) {
            Ok(backing) => Ok(Some(backing)),
            Err(ShmError::OpenFailed(e)) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn map_fd(fd: libc::c_int, size: usize) -> Result<NonNull<u8>, ShmError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmError::MmapFailed(io::Error::last_os_error()));
        }
        NonNull::new(ptr as *mut u8).ok_or_else(|| {
            ShmError::MmapFailed(io::Error::new(io::ErrorKind::Other, "mmap returned null"))
        })
    }

    fn c_name(shm_name: &str) -> Result<CString, ShmError> {
        CString::new(shm_name).map_err(|_| ShmError::InvalidName(shm_name.to_string()))
    }

    fn normalize_name(name: &str) -> String {
        match name.strip_prefix('/') {
            Some(_) => name.to_string(),
            None => format!("/{}", name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

impl RegionBacking for ShmBacking {
    fn base(&self) -> NonNull<u8> {
        self.base_ptr
    }

    fn len(&self) -> usize {
        self.total_size
    }
}

impl Drop for ShmBacking {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base_ptr.as_ptr() as *mut libc::c_void, self.total_size);
        }

        if self.is_owner {
            if let Ok(c_name) = CString::new(self.name.as_str()) {
                unsafe {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::init_header;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "dp_shm_test_{}_{}_{}",
            tag,
            std::process::id(),
            TEST_COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_names_get_leading_slash() {
        assert_eq!(ShmBacking::normalize_name("test"), "/test".to_string());
        assert_eq!(ShmBacking::normalize_name("/test"), "/test".to_string());
    }

    #[test]
    fn test_create_and_attach_share_memory() {
        let name = unique_name("share");
        let owner = ShmBacking::create(&name, 64 * 1024).unwrap();
        init_header(&owner, 3);
        assert!(owner.is_owner());

        let peer = ShmBacking::attach(&name).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.len(), 64 * 1024);

        unsafe {
            *owner.base().as_ptr().add(8192) = 0xAB;
            assert_eq!(*peer.base().as_ptr().add(8192), 0xAB);
        }
    }

    #[test]
    fn test_try_attach_missing() {
        let name = unique_name("missing");
        assert!(ShmBacking::try_attach(&name).unwrap().is_none());
    }

    #[test]
    fn test_attach_rejects_bad_header() {
        let name = unique_name("badhdr");
        let _owner = ShmBacking::create(&name, 8192).unwrap();
        assert!(matches!(
            ShmBacking::attach(&name),
            Err(ShmError::InvalidHeader)
        ));
    }

    #[test]
    fn test_owner_unlinks_on_drop() {
        let name = unique_name("unlink");
        let owner = ShmBacking::create(&name, 8192).unwrap();
        init_header(&owner, 0);
        drop(owner);
        assert!(ShmBacking::try_attach(&name).unwrap().is_none());
    }

    #[test]
    fn test_create_twice_fails() {
        let name = unique_name("excl");
        let _owner = ShmBacking::create(&name, 8192).unwrap();
        assert!(matches!(
            ShmBacking::create(&name, 8192),
            Err(ShmError::CreateFailed(_))
        ));
    }
}
