//! Module for [dmabuf](https://01.org/linuxgraphics/gfx-docs/drm/driver-api/dma-buf.html) buffers.
//!
//! `Dmabuf`s act alike to smart pointers and can be freely cloned and passed around.
//! Once the last `Dmabuf` reference is dropped, its file descriptors are closed.
//! The memory itself stays alive as long as any other descriptor (e.g. a duplicate
//! owned by a pool buffer, or the compositor's copy) references it.
//!
//! A plane of a `Dmabuf` may come without a file descriptor of its own. Such a plane
//! lives in the memory of one of its siblings, which is common for buffers exported
//! from a single buffer object (e.g. NV12 from GBM).

use super::{Fourcc, Modifier};
use smallvec::SmallVec;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

/// Maximum amount of planes this implementation supports
pub const MAX_PLANES: usize = 4;

#[derive(Debug)]
pub(crate) struct DmabufInternal {
    /// The submitted planes
    pub planes: SmallVec<[Plane; MAX_PLANES]>,
    /// Width of the buffer in pixels
    pub width: u32,
    /// Height of the buffer in pixels
    pub height: u32,
    /// The format in use
    pub format: Fourcc,
    /// The flags applied to it
    pub flags: DmabufFlags,
}

#[derive(Debug)]
pub(crate) struct Plane {
    /// Descriptor of the plane's memory, `None` if it shares a sibling's
    pub fd: Option<OwnedFd>,
    /// The plane index
    pub plane_idx: u32,
    /// Offset from the start of the Fd
    pub offset: u32,
    /// Stride for this plane
    pub stride: u32,
    /// Modifier for this plane
    pub modifier: Modifier,
}

bitflags::bitflags! {
    /// Possible flags for a DMA buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmabufFlags: u32 {
        /// The buffer content is Y-inverted
        const Y_INVERT = 1;
        /// The buffer content is interlaced
        const INTERLACED = 2;
        /// The buffer content if interlaced is bottom-field first
        const BOTTOM_FIRST = 4;
    }
}

#[derive(Debug, Clone)]
/// Strong reference to a dmabuf handle
pub struct Dmabuf(pub(crate) Arc<DmabufInternal>);

/// Builder for Dmabufs
#[derive(Debug)]
pub struct DmabufBuilder {
    internal: DmabufInternal,
}

impl DmabufBuilder {
    /// Add a plane to the constructed Dmabuf
    ///
    /// Pass `None` as `fd` for planes stored in the memory of another plane.
    ///
    /// *Note*: Each Dmabuf needs at least one plane with a file descriptor.
    /// MAX_PLANES notes the maximum amount of planes any format may use with this implementation.
    pub fn add_plane(
        &mut self,
        fd: Option<OwnedFd>,
        idx: u32,
        offset: u32,
        stride: u32,
        modifier: Modifier,
    ) -> bool {
        if self.internal.planes.len() == MAX_PLANES {
            return false;
        }
        self.internal.planes.push(Plane {
            fd,
            plane_idx: idx,
            offset,
            stride,
            modifier,
        });

        true
    }

    /// Build a `Dmabuf` out of the provided parameters and planes
    ///
    /// Returns `None` if the builder has no planes attached or none of them carries a file descriptor.
    pub fn build(mut self) -> Option<Dmabuf> {
        if self.internal.planes.iter().all(|plane| plane.fd.is_none()) {
            return None;
        }

        self.internal.planes.sort_by_key(|plane| plane.plane_idx);
        Some(Dmabuf(Arc::new(self.internal)))
    }
}

impl Dmabuf {
    /// Create a new Dmabuf builder
    pub fn builder(width: u32, height: u32, format: Fourcc, flags: DmabufFlags) -> DmabufBuilder {
        DmabufBuilder {
            internal: DmabufInternal {
                planes: SmallVec::new(),
                width,
                height,
                format,
                flags,
            },
        }
    }

    /// Width of the buffer in pixels
    pub fn width(&self) -> u32 {
        self.0.width
    }

    /// Height of the buffer in pixels
    pub fn height(&self) -> u32 {
        self.0.height
    }

    /// Pixel format of the buffer
    pub fn format(&self) -> Fourcc {
        self.0.format
    }

    /// Flags the buffer was created with
    pub fn flags(&self) -> DmabufFlags {
        self.0.flags
    }

    /// The amount of planes this Dmabuf has
    pub fn num_planes(&self) -> usize {
        self.0.planes.len()
    }

    /// Returns the handles of the planes of this buffer, `None` for planes sharing a sibling's memory
    pub fn handles(&self) -> impl Iterator<Item = Option<BorrowedFd<'_>>> + '_ {
        self.0.planes.iter().map(|p| p.fd.as_ref().map(AsFd::as_fd))
    }

    /// Returns offsets for the planes of this buffer
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.offset)
    }

    /// Returns strides for the planes of this buffer
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.stride)
    }

    /// Modifier of the buffer's memory layout
    pub fn modifier(&self) -> Modifier {
        self.0.planes[0].modifier
    }
}
