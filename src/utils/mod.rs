//! Various utilities functions and types

mod fd;
mod mapping;

pub use self::fd::{dmabuf_size, dup_fd, DeviceFd};
pub use self::mapping::Mapping;
