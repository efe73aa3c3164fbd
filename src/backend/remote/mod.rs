//! Compositor side buffer objects.
//!
//! The compositor protocol is abstracted into a small [`Transport`] trait: a transport
//! creates request scoped [`BufferParams`] objects, delivers their terminal event through
//! [`ParamsEvents`] from its dispatch thread, and routes release notifications of the
//! buffers it created to a [`ReleaseListener`].
//!
//! [`construct_buffer`] implements the blocking handshake on top of it.

use std::{fmt, hash::Hash, io, os::unix::io::BorrowedFd, sync::Arc, time::Duration};

use crate::backend::allocator::{dmabuf::DmabufFlags, Fourcc, Modifier};

mod handshake;

pub use self::handshake::{construct_buffer, HandshakeError, ParamsEvents};

/// Time the buffer construction handshake waits for the compositor's answer
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// A buffer object created by the compositor
pub trait RemoteBuffer: fmt::Debug + Send + Sync + 'static {
    /// Identifier of the buffer, stable for its lifetime
    type Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Identifier of this buffer
    fn id(&self) -> Self::Id;
}

/// Identifier type of the buffers of a transport
pub type BufferId<T> = <<T as Transport>::Buffer as RemoteBuffer>::Id;

/// Receiver of release notifications
pub trait ReleaseListener<Id>: Send + Sync {
    /// The compositor does not access the buffer anymore
    fn released(&self, id: &Id);
}

/// Request scope of a buffer construction
pub trait BufferParams: Send + 'static {
    /// Register the memory of one plane
    fn add(
        &self,
        fd: BorrowedFd<'_>,
        plane_idx: u32,
        offset: u32,
        stride: u32,
        modifier: Modifier,
    ) -> Result<(), TransportError>;

    /// Finalize the request, the answer arrives as an event
    fn create(&self, width: i32, height: i32, format: Fourcc, flags: DmabufFlags) -> Result<(), TransportError>;

    /// Destroy the request scope
    fn destroy(self);
}

/// Connection to a compositor able to create buffers from dma-bufs
pub trait Transport: fmt::Debug + Send + Sync + Sized + 'static {
    /// Buffer objects created by this transport
    type Buffer: RemoteBuffer;
    /// Request scope type
    type Params: BufferParams;

    /// Open a new request scope.
    ///
    /// The terminal event of the scope has to be reported through `events`.
    /// Buffers created for it have to report their release to `events.release_listener()`.
    fn create_params(&self, events: ParamsEvents<Self>) -> Result<Self::Params, TransportError>;

    /// Destroy a buffer created by this transport
    fn destroy_buffer(&self, buffer: Self::Buffer) -> Result<(), TransportError>;

    /// Send all queued requests
    fn flush(&self) -> Result<(), TransportError>;

    /// Block until the compositor processed all requests sent so far
    fn roundtrip(&self) -> Result<(), TransportError>;

    /// Number of plane slots every request has to fill, if the transport has a fixed layout.
    ///
    /// Slots past the planes of a frame are filled with a valid sibling descriptor.
    fn plane_slots(&self) -> Option<usize> {
        None
    }

    /// Returns true if called from the thread dispatching this transport's events
    fn is_dispatch_thread(&self) -> bool {
        false
    }
}

/// Shared handle to a release listener
pub type SharedReleaseListener<T> = Arc<dyn ReleaseListener<BufferId<T>>>;

/// Errors of the compositor connection
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A required global is not advertised by the compositor
    #[error("the compositor does not support {0}")]
    MissingGlobal(&'static str),
    /// The connection is gone
    #[error("the compositor connection is closed")]
    Closed,
    /// Reading or writing the connection failed
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Connecting to the compositor failed
    #[cfg(feature = "backend_wayland")]
    #[error(transparent)]
    Connect(#[from] wayland_client::ConnectError),
    /// A protocol object was already destroyed
    #[cfg(feature = "backend_wayland")]
    #[error(transparent)]
    InvalidId(#[from] wayland_client::backend::InvalidId),
    /// The connection reported an error
    #[cfg(feature = "backend_wayland")]
    #[error(transparent)]
    Wayland(#[from] wayland_client::backend::WaylandError),
    /// Dispatching events failed
    #[cfg(feature = "backend_wayland")]
    #[error(transparent)]
    Dispatch(#[from] wayland_client::DispatchError),
    /// Retrieving the initial list of globals failed
    #[cfg(feature = "backend_wayland")]
    #[error(transparent)]
    Globals(#[from] wayland_client::globals::GlobalError),
}
