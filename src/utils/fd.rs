#![forbid(unsafe_op_in_unsafe_fn)]

use std::{
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    path::Path,
    sync::Arc,
};

use rustix::fs::{Mode, OFlags, SeekFrom};

/// Ref-counted file descriptor of an open device node
#[derive(Debug, Clone)]
pub struct DeviceFd(Arc<OwnedFd>);

impl DeviceFd {
    /// Open the device node at `path` for reading and writing
    pub fn open(path: impl AsRef<Path>) -> io::Result<DeviceFd> {
        let fd = rustix::fs::open(path.as_ref(), OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;
        Ok(DeviceFd(Arc::new(fd)))
    }
}

impl AsFd for DeviceFd {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl From<OwnedFd> for DeviceFd {
    #[inline]
    fn from(fd: OwnedFd) -> Self {
        DeviceFd(Arc::new(fd))
    }
}

/// Duplicate `fd` into a new descriptor owned by the caller.
///
/// The duplicate is close-on-exec and refers to the same open file description,
/// so for dma-bufs it references the same memory.
pub fn dup_fd(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    Ok(rustix::io::fcntl_dupfd_cloexec(fd, 0)?)
}

/// Size in bytes of the memory behind a dma-buf (or memfd) descriptor.
///
/// Seeking a dma-buf to its end reports its size without moving any shared state
/// other processes care about.
pub fn dmabuf_size(fd: BorrowedFd<'_>) -> io::Result<usize> {
    let size = rustix::fs::seek(fd, SeekFrom::End(0))?;
    usize::try_from(size).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "buffer too large to map"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::MemfdFlags;
    use std::os::unix::io::AsRawFd;

    fn memfd(len: u64) -> OwnedFd {
        let fd = rustix::fs::memfd_create("kmspool-fd-test", MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, len).unwrap();
        fd
    }

    #[test]
    fn duplicate_is_distinct_descriptor() {
        let fd = memfd(4096);
        let dup = dup_fd(fd.as_fd()).unwrap();
        assert_ne!(fd.as_raw_fd(), dup.as_raw_fd());
        assert_eq!(dmabuf_size(dup.as_fd()).unwrap(), 4096);
    }

    #[test]
    fn size_of_memfd() {
        let fd = memfd(3 * 4096 + 17);
        assert_eq!(dmabuf_size(fd.as_fd()).unwrap(), 3 * 4096 + 17);
    }

    #[test]
    fn device_fd_clones_share_the_descriptor() {
        let device = DeviceFd::from(memfd(1));
        let clone = device.clone();
        assert_eq!(device.as_fd().as_raw_fd(), clone.as_fd().as_raw_fd());
        drop(device);
        assert_eq!(dmabuf_size(clone.as_fd()).unwrap(), 1);
    }
}
