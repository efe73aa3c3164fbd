//! Buffer allocation and compositor hand-off
//!
//! - [`allocator`] obtains the memory of video frames, per plane.
//! - [`remote`] abstracts the compositor connection and wraps plane memory into compositor buffers.
//! - [`pool`] is the fixed capacity pool tying both together.
//!
//! Supported compositor transports:
//!
//! - `zwp_linux_dmabuf_v1` (feature `backend_wayland`)
//! - an in-process fake for tests (feature `backend_test`)

pub mod allocator;
pub mod pool;
pub mod remote;

#[cfg(any(test, feature = "backend_test"))]
pub mod test;

#[cfg(feature = "backend_wayland")]
pub mod wayland;
