use std::{
    io,
    os::unix::io::BorrowedFd,
    ptr::{self, NonNull},
};

use rustix::mm::{self, MapFlags, ProtFlags};
use tracing::warn;

/// A shared CPU mapping of buffer memory.
///
/// The mapping is removed once this value is dropped.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
}

// SAFETY: the mapping is plain shared memory, access is synchronized by its owners.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map `len` bytes of `fd` starting at `offset`.
    ///
    /// `offset` has to be page aligned.
    pub fn new(fd: BorrowedFd<'_>, offset: u64, len: usize, writable: bool) -> io::Result<Mapping> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty buffer"));
        }

        let prot = if writable {
            ProtFlags::READ | ProtFlags::WRITE
        } else {
            ProtFlags::READ
        };
        // SAFETY: we request a fresh mapping, nothing else is referencing the returned range yet.
        let ptr = unsafe { mm::mmap(ptr::null_mut(), len, prot, MapFlags::SHARED, fd, offset)? };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        Ok(Mapping { ptr, len, writable })
    }

    /// Length of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping covers no memory
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping was created writable
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Start of the mapped memory
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr and len describe exactly the range returned by mmap.
        if let Err(err) = unsafe { mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            warn!(?err, len = self.len, "failed to unmap buffer memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::MemfdFlags;
    use std::os::unix::io::AsFd;

    #[test]
    fn write_through_shared_mapping_is_visible() {
        let fd = rustix::fs::memfd_create("kmspool-map-test", MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, 8192).unwrap();

        let writer = Mapping::new(fd.as_fd(), 0, 8192, true).unwrap();
        let reader = Mapping::new(fd.as_fd(), 0, 8192, false).unwrap();
        assert!(writer.is_writable());
        assert!(!reader.is_writable());

        unsafe {
            writer.as_ptr().add(4100).write(0xab);
            assert_eq!(reader.as_ptr().add(4100).read(), 0xab);
        }
    }

    #[test]
    fn empty_mapping_is_rejected() {
        let fd = rustix::fs::memfd_create("kmspool-map-empty", MemfdFlags::CLOEXEC).unwrap();
        let err = Mapping::new(fd.as_fd(), 0, 0, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
