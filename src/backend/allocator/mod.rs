//! Plane memory allocation.
//!
//! Collection of common traits and implementations around
//! obtaining the memory backing the planes of a video frame.
//!
//! Allocators provided:
//! - [`KmsAllocator`](dumb::KmsAllocator) creating dumb buffer objects through a [`DumbDevice`](dumb::DumbDevice),
//!   e.g. a DRM device node with the `backend_drm` feature
//! - [`DmabufAllocator`](shared::DmabufAllocator) adopting dma-bufs from a [`DmabufSource`](shared::DmabufSource),
//!   e.g. GBM with the `backend_gbm` feature
//!
//! Memory types:
//! - [DumbPlanes](dumb::DumbPlane), device backed objects
//! - [SharedPlanes](shared::SharedPlane), regions of already shareable memory
//! - [DmaBufs](dmabuf::Dmabuf)

use std::{fmt, io, os::unix::io::BorrowedFd};

use smallvec::SmallVec;

pub mod dmabuf;
pub mod dumb;
pub mod format;
#[cfg(feature = "backend_gbm")]
pub mod gbm;
pub mod shared;

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

use self::{
    dmabuf::MAX_PLANES,
    dumb::DumbPlane,
    format::{FormatError, PlaneLayout, VideoFrameDescriptor},
    shared::SharedPlane,
};
use crate::utils::Mapping;

/// Memory backing a single plane of a frame
#[derive(Debug)]
pub enum PlaneMemory {
    /// A buffer object of a device, exported as a dma-buf
    Device(DumbPlane),
    /// A duplicated descriptor of memory shared by someone else
    Shared(SharedPlane),
}

/// The planes of one frame, in plane order
pub type Planes = SmallVec<[PlaneMemory; MAX_PLANES]>;

impl PlaneMemory {
    /// Shareable descriptor referencing the plane's memory
    pub fn fd(&self) -> BorrowedFd<'_> {
        match self {
            PlaneMemory::Device(plane) => plane.fd(),
            PlaneMemory::Shared(plane) => plane.fd(),
        }
    }

    /// Actual stride and offset of the plane
    pub fn layout(&self) -> PlaneLayout {
        match self {
            PlaneMemory::Device(plane) => PlaneLayout {
                stride: plane.pitch(),
                offset: 0,
            },
            PlaneMemory::Shared(plane) => plane.layout(),
        }
    }

    /// Layout modifier of the plane's memory
    pub fn modifier(&self) -> Modifier {
        match self {
            PlaneMemory::Device(_) => Modifier::Linear,
            PlaneMemory::Shared(plane) => plane.modifier(),
        }
    }

    /// CPU mapping created together with the plane, if any
    pub fn mapping(&self) -> Option<&Mapping> {
        match self {
            PlaneMemory::Device(plane) => plane.mapping(),
            PlaneMemory::Shared(_) => None,
        }
    }
}

/// Errors thrown while obtaining plane memory
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// The allocator has no device context, it needs to be started first
    #[error("the allocator is not started")]
    NotStarted,
    /// The frame cannot be described
    #[error(transparent)]
    Format(#[from] FormatError),
    /// The device cannot create dumb buffers
    #[error("the device does not support dumb buffers")]
    Unsupported,
    /// Opening the device context failed
    #[error("failed to open the device context")]
    Open(#[source] io::Error),
    /// Creating the buffer object of a plane failed
    #[error("failed to create the buffer object for plane {plane}")]
    Create {
        /// Plane index
        plane: usize,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// Converting the handle of a plane into a shareable descriptor failed
    #[error("failed to export plane {plane} as dma-buf")]
    Export {
        /// Plane index
        plane: usize,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// Mapping the memory of a plane failed
    #[error("failed to map plane {plane}")]
    Map {
        /// Plane index
        plane: usize,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// No valid descriptor exists for a plane or any of its siblings
    #[error("no shareable handle for plane {plane}")]
    MissingHandle {
        /// Plane index
        plane: usize,
    },
    /// A dma-buf does not hold the described frame
    #[error("dma-buf of {width}x{height} {format:?} cannot hold the frame")]
    Incompatible {
        /// Format of the dma-buf
        format: Fourcc,
        /// Width of the dma-buf
        width: u32,
        /// Height of the dma-buf
        height: u32,
    },
    /// The dma-buf source failed to provide memory
    #[error("the dma-buf source failed")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Source of plane memory for frames
///
/// An allocator owns a device context between [`start`](PlaneAllocator::start) and
/// [`stop`](PlaneAllocator::stop). Memory handed out stays valid after `stop`.
pub trait PlaneAllocator: fmt::Debug {
    /// Acquire the device context
    fn start(&mut self) -> Result<(), AllocationError>;
    /// Release the device context
    fn stop(&mut self);
    /// Returns true between `start` and `stop`
    fn is_started(&self) -> bool;
    /// Obtain memory for every plane of the described frame.
    ///
    /// Either all planes are returned or none. Everything acquired for the frame
    /// before a failing step is released before the error is returned.
    fn allocate(&mut self, descriptor: &VideoFrameDescriptor) -> Result<Planes, AllocationError>;
}
