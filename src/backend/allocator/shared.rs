//! Planes backed by memory that is already shareable.
//!
//! No device object is created on this path. The descriptors of an existing
//! [`Dmabuf`] are duplicated and the duplicates are owned by the plane.

use std::fmt;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use tracing::{debug, debug_span, trace};

use super::{
    dmabuf::Dmabuf,
    format::{PlaneLayout, VideoFrameDescriptor},
    AllocationError, Modifier, PlaneAllocator, PlaneMemory, Planes,
};
use crate::utils::dup_fd;

/// A plane referencing a region of a dma-buf
#[derive(Debug)]
pub struct SharedPlane {
    fd: OwnedFd,
    layout: PlaneLayout,
    modifier: Modifier,
}

impl SharedPlane {
    /// The owned duplicate of the dma-buf descriptor
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Stride and offset of the plane inside the dma-buf
    pub fn layout(&self) -> PlaneLayout {
        self.layout
    }

    /// Layout modifier of the dma-buf
    pub fn modifier(&self) -> Modifier {
        self.modifier
    }
}

/// Adopt the planes of `dmabuf` for a frame described by `descriptor`.
///
/// Every plane of the descriptor gets its own duplicated descriptor. Planes the
/// dma-buf has no descriptor for (or does not list at all) duplicate the descriptor of
/// a valid sibling, so no plane ever carries an invalid handle. The layout of planes
/// missing from the dma-buf is taken from the descriptor.
///
/// Fails if the dma-buf has a different format or is smaller than the frame.
pub fn import_dmabuf(dmabuf: &Dmabuf, descriptor: &VideoFrameDescriptor) -> Result<Planes, AllocationError> {
    if dmabuf.format() != descriptor.fourcc()
        || dmabuf.width() < descriptor.width()
        || dmabuf.height() < descriptor.height()
    {
        return Err(AllocationError::Incompatible {
            format: dmabuf.format(),
            width: dmabuf.width(),
            height: dmabuf.height(),
        });
    }

    let handles = dmabuf.handles().collect::<Vec<_>>();
    let offsets = dmabuf.offsets().collect::<Vec<_>>();
    let strides = dmabuf.strides().collect::<Vec<_>>();
    let sibling = handles.iter().flatten().next().copied();

    let mut planes = Planes::new();
    for plane in 0..descriptor.plane_count() {
        let fd = match handles.get(plane).copied().flatten() {
            Some(fd) => fd,
            None => {
                let fd = sibling.ok_or(AllocationError::MissingHandle { plane })?;
                trace!(plane, "plane shares the memory of a sibling");
                fd
            }
        };
        let layout = match (offsets.get(plane), strides.get(plane)) {
            (Some(&offset), Some(&stride)) => PlaneLayout { stride, offset },
            _ => descriptor.planes()[plane],
        };
        let fd = dup_fd(fd).map_err(|source| AllocationError::Export { plane, source })?;

        planes.push(PlaneMemory::Shared(SharedPlane {
            fd,
            layout,
            modifier: dmabuf.modifier(),
        }));
    }

    Ok(planes)
}

/// Producer of dma-bufs for whole frames
pub trait DmabufSource: fmt::Debug {
    /// Acquire whatever device context the source needs
    fn start(&mut self) -> Result<(), AllocationError> {
        Ok(())
    }

    /// Release the device context
    fn stop(&mut self) {}

    /// Create a dma-buf able to hold the described frame
    fn create_dmabuf(&mut self, descriptor: &VideoFrameDescriptor) -> Result<Dmabuf, AllocationError>;
}

/// Allocator adopting the dma-bufs of a [`DmabufSource`]
#[derive(Debug)]
pub struct DmabufAllocator<S: DmabufSource> {
    source: S,
    started: bool,
    span: tracing::Span,
}

impl<S: DmabufSource> DmabufAllocator<S> {
    /// Create a new allocator for the given source
    pub fn new(source: S) -> DmabufAllocator<S> {
        DmabufAllocator {
            source,
            started: false,
            span: debug_span!("dmabuf_allocator"),
        }
    }

    /// The underlying source
    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: DmabufSource> PlaneAllocator for DmabufAllocator<S> {
    fn start(&mut self) -> Result<(), AllocationError> {
        let _guard = self.span.enter();
        if !self.started {
            self.source.start()?;
            self.started = true;
            debug!("dma-buf source started");
        }
        Ok(())
    }

    fn stop(&mut self) {
        let _guard = self.span.enter();
        if self.started {
            self.source.stop();
            self.started = false;
            debug!("dma-buf source stopped");
        }
    }

    fn is_started(&self) -> bool {
        self.started
    }

    #[profiling::function]
    fn allocate(&mut self, descriptor: &VideoFrameDescriptor) -> Result<Planes, AllocationError> {
        let _guard = self.span.enter();
        if !self.started {
            return Err(AllocationError::NotStarted);
        }

        let dmabuf = self.source.create_dmabuf(descriptor)?;
        let planes = import_dmabuf(&dmabuf, descriptor)?;
        debug!(
            format = ?descriptor.fourcc(),
            planes = planes.len(),
            "adopted dma-buf planes"
        );
        Ok(planes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::{dmabuf::DmabufFlags, Fourcc};
    use crate::backend::test::MemfdDmabufSource;
    use rustix::fs::MemfdFlags;
    use std::os::unix::io::AsRawFd;

    fn memfd(len: u64) -> OwnedFd {
        let fd = rustix::fs::memfd_create("kmspool-shared-test", MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, len).unwrap();
        fd
    }

    #[test]
    fn siblings_are_duplicated() {
        let mut allocator = DmabufAllocator::new(MemfdDmabufSource::default());
        allocator.start().unwrap();

        let desc = VideoFrameDescriptor::new(320, 240, Fourcc::Nv12).unwrap();
        let planes = allocator.allocate(&desc).unwrap();
        assert_eq!(planes.len(), 2);
        assert_ne!(planes[0].fd().as_raw_fd(), planes[1].fd().as_raw_fd());
        assert_eq!(planes[0].layout(), desc.planes()[0]);
        assert_eq!(planes[1].layout(), desc.planes()[1]);
        assert!(planes.iter().all(|plane| plane.mapping().is_none()));
    }

    #[test]
    fn missing_planes_use_descriptor_layout() {
        let desc = VideoFrameDescriptor::new(64, 64, Fourcc::Yuv420).unwrap();
        let mut builder = Dmabuf::builder(64, 64, Fourcc::Yuv420, DmabufFlags::empty());
        builder.add_plane(Some(memfd(desc.size() as u64)), 0, 0, 64, Modifier::Linear);
        let dmabuf = builder.build().unwrap();

        let planes = import_dmabuf(&dmabuf, &desc).unwrap();
        assert_eq!(planes.len(), 3);
        assert_eq!(planes[2].layout(), desc.planes()[2]);
    }

    #[test]
    fn duplicates_outlive_the_dmabuf() {
        let desc = VideoFrameDescriptor::new(16, 16, Fourcc::Xrgb8888).unwrap();
        let mut builder = Dmabuf::builder(16, 16, Fourcc::Xrgb8888, DmabufFlags::empty());
        builder.add_plane(Some(memfd(1024)), 0, 0, 64, Modifier::Linear);
        let dmabuf = builder.build().unwrap();

        let planes = import_dmabuf(&dmabuf, &desc).unwrap();
        drop(dmabuf);
        assert_eq!(crate::utils::dmabuf_size(planes[0].fd()).unwrap(), 1024);
    }

    #[test]
    fn incompatible_dmabuf_is_refused() {
        let desc = VideoFrameDescriptor::new(64, 64, Fourcc::Nv12).unwrap();
        for (width, height, format) in [(64, 64, Fourcc::Xrgb8888), (32, 64, Fourcc::Nv12), (64, 63, Fourcc::Nv12)] {
            let mut builder = Dmabuf::builder(width, height, format, DmabufFlags::empty());
            builder.add_plane(Some(memfd(desc.size() as u64)), 0, 0, 64, Modifier::Linear);
            let dmabuf = builder.build().unwrap();

            let err = import_dmabuf(&dmabuf, &desc).unwrap_err();
            assert!(
                matches!(err, AllocationError::Incompatible { format: f, width: w, height: h } if (w, h, f) == (width, height, format)),
                "{:?}",
                err
            );
        }
    }

    #[test]
    fn not_started() {
        let mut allocator = DmabufAllocator::new(MemfdDmabufSource::default());
        let desc = VideoFrameDescriptor::new(16, 16, Fourcc::Xrgb8888).unwrap();
        assert!(matches!(allocator.allocate(&desc), Err(AllocationError::NotStarted)));
    }
}
