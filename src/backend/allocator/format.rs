//! Plane layout tables for the video formats handled by the pool.
//!
//! This module provides three lookup functions, [`plane_count`], [`plane_cpp`] and [`subsampling`],
//! and the [`VideoFrameDescriptor`] built on top of them.
//!
//! [`plane_count`] returns the number of memory planes a format is made of.
//!
//! ```
//! # use kmspool::backend::allocator::Fourcc;
//! # use kmspool::backend::allocator::format::plane_count;
//! assert_eq!(plane_count(Fourcc::Xrgb8888), Some(1));
//! assert_eq!(plane_count(Fourcc::Nv12), Some(2));
//! assert_eq!(plane_count(Fourcc::Yuv420), Some(3));
//! ```
//!
//! [`plane_cpp`] returns the number of bytes a single sample of a plane occupies.
//!
//! ```
//! # use kmspool::backend::allocator::Fourcc;
//! # use kmspool::backend::allocator::format::plane_cpp;
//! assert_eq!(plane_cpp(Fourcc::Yuyv, 0), Some(2));
//! assert_eq!(plane_cpp(Fourcc::Nv12, 1), Some(2));
//! ```
//!
//! [`subsampling`] returns the horizontal and vertical chroma subsampling factors,
//! which apply to every plane but the first.
//!
//! ```
//! # use kmspool::backend::allocator::Fourcc;
//! # use kmspool::backend::allocator::format::subsampling;
//! assert_eq!(subsampling(Fourcc::Nv12), Some((2, 2)));
//! assert_eq!(subsampling(Fourcc::Yuv422), Some((2, 1)));
//! ```

use smallvec::SmallVec;

use super::{dmabuf::MAX_PLANES, Fourcc};

/// Macro to generate table lookup functions for formats.
///
/// See the module documentation for usage details.
macro_rules! format_tables {
    (
        $($fourcc: ident {
            planes: $planes: expr,
            cpp: [$($cpp: expr),+],
            sub: ($hsub: expr, $vsub: expr) $(,)?
        }),* $(,)?
    ) => {
        /// Returns the number of memory planes of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn plane_count(fourcc: $crate::backend::allocator::Fourcc) -> Option<usize> {
            match fourcc {
                $(
                    $crate::backend::allocator::Fourcc::$fourcc => Some($planes),
                )*
                _ => None,
            }
        }

        /// Returns the number of bytes per sample of the given plane of the specified format.
        ///
        /// Unknown formats and out of range planes will return [`None`].
        pub fn plane_cpp(fourcc: $crate::backend::allocator::Fourcc, plane: usize) -> Option<u32> {
            match fourcc {
                $(
                    $crate::backend::allocator::Fourcc::$fourcc => [$($cpp),+].get(plane).copied(),
                )*
                _ => None,
            }
        }

        /// Returns the horizontal and vertical subsampling of the chroma planes of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn subsampling(fourcc: $crate::backend::allocator::Fourcc) -> Option<(u32, u32)> {
            match fourcc {
                $(
                    $crate::backend::allocator::Fourcc::$fourcc => Some(($hsub, $vsub)),
                )*
                _ => None,
            }
        }

        #[cfg(test)]
        fn _impl_formats() -> &'static [$crate::backend::allocator::Fourcc] {
            &[
                $(
                    $crate::backend::allocator::Fourcc::$fourcc,
                )*
            ]
        }
    };
}

format_tables! {
    // packed rgb
    Xrgb8888 { planes: 1, cpp: [4], sub: (1, 1) },
    Argb8888 { planes: 1, cpp: [4], sub: (1, 1) },
    Xbgr8888 { planes: 1, cpp: [4], sub: (1, 1) },
    Abgr8888 { planes: 1, cpp: [4], sub: (1, 1) },
    Rgb565 { planes: 1, cpp: [2], sub: (1, 1) },
    Rgb888 { planes: 1, cpp: [3], sub: (1, 1) },
    Bgr888 { planes: 1, cpp: [3], sub: (1, 1) },

    // packed yuv, one sample covers a luma and half a chroma pair
    Yuyv { planes: 1, cpp: [2], sub: (1, 1) },
    Uyvy { planes: 1, cpp: [2], sub: (1, 1) },

    // semi-planar yuv
    Nv12 { planes: 2, cpp: [1, 2], sub: (2, 2) },
    Nv21 { planes: 2, cpp: [1, 2], sub: (2, 2) },
    Nv16 { planes: 2, cpp: [1, 2], sub: (2, 1) },
    Nv61 { planes: 2, cpp: [1, 2], sub: (2, 1) },

    // planar yuv
    Yuv420 { planes: 3, cpp: [1, 1, 1], sub: (2, 2) },
    Yvu420 { planes: 3, cpp: [1, 1, 1], sub: (2, 2) },
    Yuv422 { planes: 3, cpp: [1, 1, 1], sub: (2, 1) },
    Yuv444 { planes: 3, cpp: [1, 1, 1], sub: (1, 1) },
}

/// Errors describing an unusable frame description
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// The pixel format is not part of the format tables
    #[error("unsupported pixel format {0:?}")]
    Unsupported(Fourcc),
    /// The frame has no pixels or is too large to describe
    #[error("invalid frame size {0}x{1}")]
    InvalidSize(u32, u32),
    /// The layout does not match the plane count of the format
    #[error("format expects {expected} planes, but {got} were given")]
    PlaneCount {
        /// Planes required by the format
        expected: usize,
        /// Planes given
        got: usize,
    },
    /// A stride does not cover a full row of its plane
    #[error("stride {stride} of plane {plane} is smaller than its row of {min} bytes")]
    Stride {
        /// Offending plane
        plane: usize,
        /// Given stride
        stride: u32,
        /// Bytes required for a single row
        min: u32,
    },
}

/// Memory layout of a single plane
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaneLayout {
    /// Byte distance between the starts of two consecutive rows
    pub stride: u32,
    /// Byte offset of the first row from the start of the plane's memory
    pub offset: u32,
}

/// Description of a video frame: dimensions, pixel format and plane layout.
///
/// Descriptors are immutable. The pool derives a new descriptor carrying the
/// pitches reported by the allocator once the memory of a frame exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoFrameDescriptor {
    width: u32,
    height: u32,
    fourcc: Fourcc,
    planes: SmallVec<[PlaneLayout; MAX_PLANES]>,
}

fn align4(value: u32) -> Option<u32> {
    value.checked_add(3).map(|value| value & !3)
}

fn checked_size(width: u32, height: u32, fourcc: Fourcc) -> Result<usize, FormatError> {
    if width == 0 || height == 0 || width > i32::MAX as u32 || height > i32::MAX as u32 {
        return Err(FormatError::InvalidSize(width, height));
    }
    plane_count(fourcc).ok_or(FormatError::Unsupported(fourcc))
}

impl VideoFrameDescriptor {
    /// Describe a frame using the default layout for its format.
    ///
    /// Strides are rounded up to a multiple of four bytes and planes are placed
    /// directly after each other.
    pub fn new(width: u32, height: u32, fourcc: Fourcc) -> Result<VideoFrameDescriptor, FormatError> {
        let count = checked_size(width, height, fourcc)?;

        let mut descriptor = VideoFrameDescriptor {
            width,
            height,
            fourcc,
            planes: SmallVec::new(),
        };
        let mut offset = 0u32;
        for idx in 0..count {
            let stride = descriptor
                .row_bytes(idx)
                .and_then(align4)
                .ok_or(FormatError::InvalidSize(width, height))?;
            descriptor.planes.push(PlaneLayout { stride, offset });
            offset = stride
                .checked_mul(descriptor.plane_height(idx))
                .and_then(|size| size.checked_add(offset))
                .ok_or(FormatError::InvalidSize(width, height))?;
        }

        Ok(descriptor)
    }

    /// Describe a frame with an explicit plane layout.
    pub fn with_layout(
        width: u32,
        height: u32,
        fourcc: Fourcc,
        planes: &[PlaneLayout],
    ) -> Result<VideoFrameDescriptor, FormatError> {
        let count = checked_size(width, height, fourcc)?;
        if planes.len() != count {
            return Err(FormatError::PlaneCount {
                expected: count,
                got: planes.len(),
            });
        }

        let descriptor = VideoFrameDescriptor {
            width,
            height,
            fourcc,
            planes: planes.iter().copied().collect(),
        };
        for (plane, layout) in descriptor.planes.iter().enumerate() {
            let min = descriptor
                .row_bytes(plane)
                .ok_or(FormatError::InvalidSize(width, height))?;
            if layout.stride < min {
                return Err(FormatError::Stride {
                    plane,
                    stride: layout.stride,
                    min,
                });
            }
        }

        Ok(descriptor)
    }

    /// Same frame geometry with the layout of actually allocated memory
    pub(crate) fn with_planes(&self, planes: impl IntoIterator<Item = PlaneLayout>) -> VideoFrameDescriptor {
        VideoFrameDescriptor {
            width: self.width,
            height: self.height,
            fourcc: self.fourcc,
            planes: planes.into_iter().collect(),
        }
    }

    /// Width of the frame in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height of the frame in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format of the frame
    pub fn fourcc(&self) -> Fourcc {
        self.fourcc
    }

    /// Number of planes of the frame
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Layout of all planes
    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes
    }

    /// Stride of the given plane
    pub fn stride(&self, plane: usize) -> Option<u32> {
        self.planes.get(plane).map(|layout| layout.stride)
    }

    /// Offset of the given plane
    pub fn offset(&self, plane: usize) -> Option<u32> {
        self.planes.get(plane).map(|layout| layout.offset)
    }

    fn plane_subsampling(&self, plane: usize) -> (u32, u32) {
        match (plane, subsampling(self.fourcc)) {
            (0, _) | (_, None) => (1, 1),
            (_, Some(sub)) => sub,
        }
    }

    /// Number of rows of the given plane (its component height)
    pub fn plane_height(&self, plane: usize) -> u32 {
        let (_, vsub) = self.plane_subsampling(plane);
        self.height.div_ceil(vsub)
    }

    fn row_bytes(&self, plane: usize) -> Option<u32> {
        let (hsub, _) = self.plane_subsampling(plane);
        let cpp = plane_cpp(self.fourcc, plane).unwrap_or(0);
        self.width.div_ceil(hsub).checked_mul(cpp)
    }

    /// Number of bytes covered by a single row of the given plane, without padding
    pub fn plane_width_bytes(&self, plane: usize) -> u32 {
        // constructors reject frames whose rows do not fit
        self.row_bytes(plane).unwrap_or(u32::MAX)
    }

    /// Number of bytes spanned by the given plane
    pub fn plane_size(&self, plane: usize) -> usize {
        self.stride(plane)
            .map(|stride| stride as usize * self.plane_height(plane) as usize)
            .unwrap_or(0)
    }

    /// Number of bytes needed to store the whole frame in a single memory block
    pub fn size(&self) -> usize {
        (0..self.plane_count())
            .map(|plane| self.planes[plane].offset as usize + self.plane_size(plane))
            .max()
            .unwrap_or(0)
    }
}
