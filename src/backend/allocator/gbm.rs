//! Dma-bufs created using [libgbm](gbm).
//!
//! [`GbmDmabufSource`] allocates one GBM buffer object per frame and exports it as a
//! single descriptor [`Dmabuf`], to be adopted by a [`DmabufAllocator`](super::shared::DmabufAllocator).

use std::io;

pub use gbm::{BufferObjectFlags as GbmBufferFlags, Device as GbmDevice};
use tracing::{debug, instrument};

use super::{
    dmabuf::{Dmabuf, DmabufFlags},
    format::VideoFrameDescriptor,
    shared::DmabufSource,
    AllocationError, Modifier,
};
use crate::utils::DeviceFd;

/// Source of GBM allocated dma-bufs
#[derive(Debug)]
pub struct GbmDmabufSource {
    fd: DeviceFd,
    device: Option<GbmDevice<DeviceFd>>,
    flags: GbmBufferFlags,
}

impl GbmDmabufSource {
    /// Create a new source allocating linear buffers on the device behind `fd`
    pub fn new(fd: DeviceFd) -> GbmDmabufSource {
        GbmDmabufSource::with_flags(fd, GbmBufferFlags::LINEAR)
    }

    /// Create a new source allocating buffers with the given usage flags
    pub fn with_flags(fd: DeviceFd, flags: GbmBufferFlags) -> GbmDmabufSource {
        GbmDmabufSource {
            fd,
            device: None,
            flags,
        }
    }

    /// The GBM device, while started
    pub fn device(&self) -> Option<&GbmDevice<DeviceFd>> {
        self.device.as_ref()
    }
}

impl DmabufSource for GbmDmabufSource {
    fn start(&mut self) -> Result<(), AllocationError> {
        if self.device.is_none() {
            let device = GbmDevice::new(self.fd.clone()).map_err(AllocationError::Open)?;
            debug!(backend = device.backend_name(), "opened gbm device");
            self.device = Some(device);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.device = None;
    }

    #[instrument(level = "trace", skip(self), err)]
    #[profiling::function]
    fn create_dmabuf(&mut self, descriptor: &VideoFrameDescriptor) -> Result<Dmabuf, AllocationError> {
        let device = self.device.as_ref().ok_or(AllocationError::NotStarted)?;
        let bo = device
            .create_buffer_object::<()>(
                descriptor.width(),
                descriptor.height(),
                descriptor.fourcc(),
                self.flags,
            )
            .map_err(|source| AllocationError::Create { plane: 0, source })?;

        let planes = bo.plane_count() as i32;
        if planes as usize != descriptor.plane_count() {
            return Err(AllocationError::Unsupported);
        }
        let modifier = if self.flags.contains(GbmBufferFlags::LINEAR) {
            Modifier::Linear
        } else {
            Modifier::Invalid
        };

        // a single descriptor covers all planes, the others are filled in on import
        let fd = bo
            .fd()
            .map_err(|err| AllocationError::Export {
                plane: 0,
                source: io::Error::new(io::ErrorKind::Other, err),
            })?;
        let mut fd = Some(fd);
        let mut builder = Dmabuf::builder(
            descriptor.width(),
            descriptor.height(),
            descriptor.fourcc(),
            DmabufFlags::empty(),
        );
        for idx in 0..planes {
            builder.add_plane(
                fd.take(),
                idx as u32,
                bo.offset(idx),
                bo.stride_for_plane(idx),
                modifier,
            );
        }
        builder.build().ok_or(AllocationError::MissingHandle { plane: 0 })
    }
}
