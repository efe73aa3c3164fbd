//! Module for [DumbBuffer](https://01.org/linuxgraphics/gfx-docs/drm/gpu/drm-kms.html#dumb-buffer-objects) backed planes
//!
//! Every plane of a frame is stored in its own dumb buffer object. Dumb buffers only
//! know a single bpp and are always linear, so each plane is requested as a 32 bpp
//! buffer wide enough to hold its stride, see [`dumb_width`].

use std::fmt;
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use tracing::{debug, debug_span, trace, warn};

use super::{format::VideoFrameDescriptor, AllocationError, PlaneAllocator, PlaneMemory, Planes};
use crate::utils::Mapping;

/// Bits per pixel of every dumb buffer created for a plane (XRGB8888)
pub const DUMB_BPP: u32 = 32;

/// Width in pixels of the 32 bpp dumb buffer holding a plane with the given stride.
///
/// The stride is converted to pixels and padded to a multiple of 32 pixels,
/// which is the pitch granularity drivers enforce for scanout buffers.
///
/// ```
/// # use kmspool::backend::allocator::dumb::dumb_width;
/// assert_eq!(dumb_width(7680), 1920);
/// assert_eq!(dumb_width(130), 64);
/// ```
pub const fn dumb_width(stride: u32) -> u32 {
    (((stride + 3) / 4 + 31) >> 5) << 5
}

/// A dumb buffer object as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbObject {
    /// Device local handle
    pub handle: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in rows
    pub height: u32,
    /// Actual pitch in bytes, may exceed the requested width
    pub pitch: u32,
    /// Size of the object in bytes
    pub size: u64,
}

/// Device able to hand out contexts for dumb buffer allocation
pub trait DumbDevice: fmt::Debug {
    /// Context type created by this device
    type Context: DumbContext;

    /// Create a new allocation context
    fn open_context(&self) -> Result<Self::Context, AllocationError>;
}

/// Allocation context of a [`DumbDevice`]
///
/// Objects keep their context alive, so they can be destroyed after the
/// allocator has been stopped.
pub trait DumbContext: fmt::Debug + Send + Sync + 'static {
    /// Create a new dumb buffer object
    fn create(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbObject>;
    /// Convert the object handle into a dma-buf descriptor
    fn export(&self, object: &DumbObject) -> io::Result<OwnedFd>;
    /// Map the object for CPU access
    fn map(&self, object: &DumbObject) -> io::Result<Mapping>;
    /// Destroy the object
    fn destroy(&self, object: &DumbObject) -> io::Result<()>;
}

/// Whether planes are mapped for CPU access when they are allocated
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Planes are mapped right away, the pipeline fills them through the mapping
    #[default]
    Mapped,
    /// Planes are only exported, downstream consumes them as dma-bufs
    DmabufOnly,
}

/// A plane stored in a dumb buffer object.
///
/// The mapping (if any) is removed and the object destroyed once this is dropped.
pub struct DumbPlane {
    context: Arc<dyn DumbContext>,
    object: DumbObject,
    fd: OwnedFd,
    mapping: Option<Mapping>,
}

impl fmt::Debug for DumbPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbPlane")
            .field("object", &self.object)
            .field("fd", &self.fd)
            .field("mapped", &self.mapping.is_some())
            .finish()
    }
}

impl DumbPlane {
    fn allocate(
        context: &Arc<dyn DumbContext>,
        descriptor: &VideoFrameDescriptor,
        plane: usize,
        mode: ExportMode,
    ) -> Result<DumbPlane, AllocationError> {
        let stride = descriptor.stride(plane).unwrap_or_default();
        let width = dumb_width(stride);
        let height = descriptor.plane_height(plane);

        let object = context
            .create(width, height, DUMB_BPP)
            .map_err(|source| AllocationError::Create { plane, source })?;
        let object = scopeguard::guard(object, |object| {
            if let Err(err) = context.destroy(&object) {
                warn!(?err, handle = object.handle, "failed to destroy dumb buffer");
            }
        });
        trace!(plane, width, height, pitch = object.pitch, "created dumb buffer");

        let fd = context
            .export(&object)
            .map_err(|source| AllocationError::Export { plane, source })?;
        let mapping = match mode {
            ExportMode::Mapped => Some(
                context
                    .map(&object)
                    .map_err(|source| AllocationError::Map { plane, source })?,
            ),
            ExportMode::DmabufOnly => None,
        };

        Ok(DumbPlane {
            context: context.clone(),
            object: scopeguard::ScopeGuard::into_inner(object),
            fd,
            mapping,
        })
    }

    /// Device local handle of the object
    pub fn handle(&self) -> u32 {
        self.object.handle
    }

    /// Pitch reported by the device
    pub fn pitch(&self) -> u32 {
        self.object.pitch
    }

    /// Size of the object in bytes
    pub fn size(&self) -> u64 {
        self.object.size
    }

    /// The exported dma-buf descriptor
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// The allocation time mapping, absent in [`ExportMode::DmabufOnly`]
    pub fn mapping(&self) -> Option<&Mapping> {
        self.mapping.as_ref()
    }
}

impl Drop for DumbPlane {
    fn drop(&mut self) {
        // unmap before the object goes away
        self.mapping.take();
        if let Err(err) = self.context.destroy(&self.object) {
            warn!(?err, handle = self.object.handle, "failed to destroy dumb buffer");
        }
    }
}

/// Allocator storing every plane in its own dumb buffer of a [`DumbDevice`]
#[derive(Debug)]
pub struct KmsAllocator<D: DumbDevice> {
    device: D,
    mode: ExportMode,
    context: Option<Arc<dyn DumbContext>>,
    span: tracing::Span,
}

impl<D: DumbDevice> KmsAllocator<D> {
    /// Create a new allocator for the given device.
    ///
    /// No device context is opened before [`start`](PlaneAllocator::start).
    pub fn new(device: D, mode: ExportMode) -> KmsAllocator<D> {
        KmsAllocator {
            device,
            mode,
            context: None,
            span: debug_span!("kms_allocator", ?mode),
        }
    }

    /// The export mode planes are created with
    pub fn mode(&self) -> ExportMode {
        self.mode
    }

    /// The underlying device
    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: DumbDevice> PlaneAllocator for KmsAllocator<D> {
    fn start(&mut self) -> Result<(), AllocationError> {
        let _guard = self.span.enter();
        if self.context.is_none() {
            let context = self.device.open_context()?;
            debug!("opened dumb buffer context");
            self.context = Some(Arc::new(context));
        }
        Ok(())
    }

    fn stop(&mut self) {
        let _guard = self.span.enter();
        if self.context.take().is_some() {
            debug!("released dumb buffer context");
        }
    }

    fn is_started(&self) -> bool {
        self.context.is_some()
    }

    #[profiling::function]
    fn allocate(&mut self, descriptor: &VideoFrameDescriptor) -> Result<Planes, AllocationError> {
        let _guard = self.span.enter();
        let context = self.context.as_ref().ok_or(AllocationError::NotStarted)?;

        let mut planes = Planes::new();
        for plane in 0..descriptor.plane_count() {
            match DumbPlane::allocate(context, descriptor, plane, self.mode) {
                Ok(memory) => planes.push(PlaneMemory::Device(memory)),
                Err(err) => {
                    debug!(plane, released = planes.len(), "plane allocation failed, rolling back");
                    return Err(err);
                }
            }
        }

        debug!(
            format = ?descriptor.fourcc(),
            width = descriptor.width(),
            height = descriptor.height(),
            planes = planes.len(),
            "allocated frame planes"
        );
        Ok(planes)
    }
}

#[cfg(feature = "backend_drm")]
pub use self::drm::{DrmDumbContext, DrmDumbDevice};

#[cfg(feature = "backend_drm")]
mod drm {
    use std::io;
    use std::os::unix::io::{AsFd, FromRawFd, OwnedFd};
    use std::path::Path;

    use super::{DumbContext, DumbDevice, DumbObject};
    use crate::backend::allocator::AllocationError;
    use crate::utils::{DeviceFd, Mapping};

    const DRM_CAP_DUMB_BUFFER: u64 = 0x1;

    /// A DRM device node creating dumb buffers
    #[derive(Debug, Clone)]
    pub struct DrmDumbDevice {
        fd: DeviceFd,
    }

    impl DrmDumbDevice {
        /// Wrap an already opened device node
        pub fn new(fd: DeviceFd) -> DrmDumbDevice {
            DrmDumbDevice { fd }
        }

        /// Open the device node at `path`, e.g. `/dev/dri/card0`
        pub fn open(path: impl AsRef<Path>) -> io::Result<DrmDumbDevice> {
            DeviceFd::open(path).map(DrmDumbDevice::new)
        }
    }

    impl DumbDevice for DrmDumbDevice {
        type Context = DrmDumbContext;

        fn open_context(&self) -> Result<DrmDumbContext, AllocationError> {
            let cap = drm_ffi::get_capability(self.fd.as_fd(), DRM_CAP_DUMB_BUFFER)
                .map_err(AllocationError::Open)?;
            if cap.value == 0 {
                return Err(AllocationError::Unsupported);
            }
            Ok(DrmDumbContext { fd: self.fd.clone() })
        }
    }

    /// Dumb buffer context of a [`DrmDumbDevice`]
    #[derive(Debug)]
    pub struct DrmDumbContext {
        fd: DeviceFd,
    }

    impl DumbContext for DrmDumbContext {
        fn create(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbObject> {
            let created = drm_ffi::mode::dumbbuffer::create(self.fd.as_fd(), width, height, bpp, 0)?;
            Ok(DumbObject {
                handle: created.handle,
                width,
                height,
                pitch: created.pitch,
                size: created.size,
            })
        }

        fn export(&self, object: &DumbObject) -> io::Result<OwnedFd> {
            let flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;
            let prime = drm_ffi::gem::handle_to_fd(self.fd.as_fd(), object.handle, flags)?;
            // SAFETY: the kernel returned a new descriptor owned by us
            Ok(unsafe { OwnedFd::from_raw_fd(prime.fd) })
        }

        fn map(&self, object: &DumbObject) -> io::Result<Mapping> {
            let map = drm_ffi::mode::dumbbuffer::map(self.fd.as_fd(), object.handle, 0, 0)?;
            let size = usize::try_from(object.size)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "dumb buffer too large"))?;
            Mapping::new(self.fd.as_fd(), map.offset, size, true)
        }

        fn destroy(&self, object: &DumbObject) -> io::Result<()> {
            drm_ffi::mode::dumbbuffer::destroy(self.fd.as_fd(), object.handle)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::{format::VideoFrameDescriptor, Fourcc};
    use crate::backend::test::MemfdDevice;

    #[test]
    fn width_rounding() {
        assert_eq!(dumb_width(1), 32);
        assert_eq!(dumb_width(128), 32);
        assert_eq!(dumb_width(129), 64);
        assert_eq!(dumb_width(7680), 1920);
        assert_eq!(dumb_width(960), 256);
    }

    #[test]
    fn requires_start() {
        let mut allocator = KmsAllocator::new(MemfdDevice::new(), ExportMode::Mapped);
        let desc = VideoFrameDescriptor::new(64, 64, Fourcc::Xrgb8888).unwrap();
        assert!(matches!(allocator.allocate(&desc), Err(AllocationError::NotStarted)));
        allocator.start().unwrap();
        assert!(allocator.is_started());
        assert!(allocator.allocate(&desc).is_ok());
        allocator.stop();
        assert!(!allocator.is_started());
        assert!(matches!(allocator.allocate(&desc), Err(AllocationError::NotStarted)));
    }

    #[test]
    fn planar_frame_gets_one_object_per_plane() {
        let device = MemfdDevice::new();
        let mut allocator = KmsAllocator::new(device.clone(), ExportMode::Mapped);
        allocator.start().unwrap();

        let desc = VideoFrameDescriptor::new(1920, 1080, Fourcc::Yuv420).unwrap();
        let planes = allocator.allocate(&desc).unwrap();
        assert_eq!(planes.len(), 3);
        assert_eq!(device.created_objects(), 3);

        let requests = device.requests();
        assert_eq!(requests[0], (dumb_width(1920), 1080, DUMB_BPP));
        assert_eq!(requests[1], (dumb_width(960), 540, DUMB_BPP));
        for plane in planes.iter() {
            let layout = plane.layout();
            assert_eq!(layout.offset, 0);
            assert!(plane.mapping().is_some());
            assert_eq!(plane.modifier(), crate::backend::allocator::Modifier::Linear);
        }
        assert_eq!(planes[0].layout().stride, dumb_width(1920) * 4);

        drop(planes);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn dmabuf_only_skips_mapping() {
        let device = MemfdDevice::new();
        let mut allocator = KmsAllocator::new(device.clone(), ExportMode::DmabufOnly);
        allocator.start().unwrap();

        let desc = VideoFrameDescriptor::new(320, 240, Fourcc::Nv12).unwrap();
        let planes = allocator.allocate(&desc).unwrap();
        assert_eq!(planes.len(), 2);
        assert!(planes.iter().all(|plane| plane.mapping().is_none()));
        assert_eq!(device.map_calls(), 0);
    }

    #[test]
    fn failing_plane_releases_earlier_planes() {
        let device = MemfdDevice::new();
        device.fail_on_object(3);
        let mut allocator = KmsAllocator::new(device.clone(), ExportMode::Mapped);
        allocator.start().unwrap();

        let desc = VideoFrameDescriptor::new(640, 480, Fourcc::Yuv420).unwrap();
        let err = allocator.allocate(&desc).unwrap_err();
        assert!(matches!(err, AllocationError::Create { plane: 2, .. }));
        assert_eq!(device.created_objects(), 2);
        assert_eq!(device.destroyed_objects(), 2);
        assert_eq!(device.live_objects(), 0);
        assert_eq!(device.map_calls(), 2);

        // the allocator itself stays usable
        let planes = allocator.allocate(&desc).unwrap();
        assert_eq!(planes.len(), 3);
    }

    #[test]
    fn failing_export_releases_the_object() {
        let device = MemfdDevice::new();
        device.fail_on_export(2);
        let mut allocator = KmsAllocator::new(device.clone(), ExportMode::Mapped);
        allocator.start().unwrap();

        let desc = VideoFrameDescriptor::new(640, 480, Fourcc::Nv12).unwrap();
        let err = allocator.allocate(&desc).unwrap_err();
        assert!(matches!(err, AllocationError::Export { plane: 1, .. }));
        assert_eq!(device.created_objects(), 2);
        assert_eq!(device.live_objects(), 0);
        assert_eq!(device.map_calls(), 1);
    }

    #[test]
    fn failing_map_releases_the_object() {
        let device = MemfdDevice::new();
        device.fail_on_map(3);
        let mut allocator = KmsAllocator::new(device.clone(), ExportMode::Mapped);
        allocator.start().unwrap();

        let desc = VideoFrameDescriptor::new(640, 480, Fourcc::Yuv420).unwrap();
        let err = allocator.allocate(&desc).unwrap_err();
        assert!(matches!(err, AllocationError::Map { plane: 2, .. }));
        assert_eq!(device.created_objects(), 3);
        assert_eq!(device.live_objects(), 0);

        let planes = allocator.allocate(&desc).unwrap();
        assert_eq!(device.live_objects(), 3);
        drop(planes);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn memory_outlives_stop() {
        let device = MemfdDevice::new();
        let mut allocator = KmsAllocator::new(device.clone(), ExportMode::Mapped);
        allocator.start().unwrap();
        let desc = VideoFrameDescriptor::new(64, 64, Fourcc::Argb8888).unwrap();
        let planes = allocator.allocate(&desc).unwrap();
        allocator.stop();

        assert_eq!(device.live_objects(), 1);
        drop(planes);
        assert_eq!(device.live_objects(), 0);
    }
}
