//! Fixed capacity pool of compositor shared frame buffers.
//!
//! ## How am I supposed to use this?
//!
//! A [`BufferPool`] combines a [`PlaneAllocator`] providing the memory of every
//! frame with a [`Transport`] turning that memory into compositor side buffers.
//!
//! ```no_run
//! # #[cfg(all(feature = "backend_drm", feature = "backend_wayland"))]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use kmspool::backend::{
//!     allocator::{dumb::{DrmDumbDevice, ExportMode, KmsAllocator}, format::VideoFrameDescriptor, Fourcc},
//!     pool::{BufferPool, MapFlags, PoolConfig},
//!     wayland::WaylandTransport,
//! };
//!
//! let transport = WaylandTransport::connect()?;
//! let device = DrmDumbDevice::open("/dev/dri/card0")?;
//! let mut pool = BufferPool::new(KmsAllocator::new(device, ExportMode::Mapped), transport);
//!
//! let descriptor = VideoFrameDescriptor::new(1920, 1080, Fourcc::Nv12)?;
//! pool.set_config(PoolConfig::new(descriptor))?;
//! pool.start()?;
//!
//! if let Some(buffer) = pool.acquire()? {
//!     let mut luma = buffer.map_plane(0, MapFlags::WRITE)?;
//!     // fill the plane ...
//!     # let _ = luma.as_mut_slice();
//!     luma.unmap();
//!     // attach `buffer.remote()` to a surface, then
//!     buffer.mark_in_use()?;
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(all(feature = "backend_drm", feature = "backend_wayland")))]
//! # fn main() {}
//! ```
//!
//! The pool never grows past [`POOL_CAPACITY`] buffers. A buffer handed out by
//! [`acquire`](BufferPool::acquire) becomes available again once every clone of it
//! is dropped and the compositor released it.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, info_span, warn};

use crate::backend::{
    allocator::{
        dmabuf::{Dmabuf, DmabufFlags},
        dumb::KmsAllocator,
        format::VideoFrameDescriptor,
        shared::{import_dmabuf, DmabufAllocator},
        AllocationError, PlaneAllocator, PlaneMemory, Planes,
    },
    remote::{construct_buffer, HandshakeError, SharedReleaseListener, Transport, HANDSHAKE_TIMEOUT},
};

mod buffer;
mod registry;

pub use self::buffer::{BufferState, CommitError, LocalBuffer, MapError, MapFlags, PlaneMapping};
pub use self::registry::BufferRegistry;

/// Number of buffers every pool holds
pub const POOL_CAPACITY: usize = 3;

/// Configuration of a [`BufferPool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Frames the pool allocates
    pub descriptor: VideoFrameDescriptor,
    /// Size of a single frame in bytes
    pub size: usize,
    /// Buffers allocated when the pool starts
    pub min_buffers: usize,
    /// Upper bound of buffers the pool hands out
    pub max_buffers: usize,
}

impl PoolConfig {
    /// Configuration for frames of the given description
    pub fn new(descriptor: VideoFrameDescriptor) -> PoolConfig {
        PoolConfig {
            size: descriptor.size(),
            descriptor,
            min_buffers: 0,
            max_buffers: 0,
        }
    }

    /// Apply the pool's fixed policy: exactly [`POOL_CAPACITY`] buffers, each large enough for a frame
    pub fn normalized(mut self) -> PoolConfig {
        self.min_buffers = POOL_CAPACITY;
        self.max_buffers = POOL_CAPACITY;
        self.size = self.size.max(self.descriptor.size());
        self
    }
}

/// Errors of [`BufferPool`] operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Obtaining plane memory failed
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// Creating the compositor side buffer failed
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// The pool has no configuration yet
    #[error("the pool is not configured")]
    NotConfigured,
    /// The pool needs to be started first
    #[error("the pool is not started")]
    NotStarted,
    /// A started pool cannot be reconfigured
    #[error("the pool cannot be reconfigured while started")]
    Active,
}

impl PoolError {
    /// Returns true if the error aborted the construction of a buffer.
    ///
    /// Everything acquired for that buffer was released, the pool itself stays usable.
    /// Other errors indicate a misuse of the pool.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PoolError::Allocation(_) | PoolError::Handshake(_))
    }
}

/// Memory of a frame produced outside of the pool
#[derive(Debug, Clone, Copy)]
pub enum FrameMemory<'a> {
    /// The frame lives in a dma-buf
    Dmabuf(&'a Dmabuf),
    /// The frame lives in ordinary process memory
    System(&'a [u8]),
}

/// Result of [`BufferPool::import`]
#[derive(Debug)]
pub enum ImportOutcome<T: Transport> {
    /// The frame was wrapped into a buffer
    Imported(LocalBuffer<T>),
    /// The memory is not shareable, the producer has to renegotiate for dma-buf memory
    NotNegotiated,
}

/// Fixed capacity pool of [`LocalBuffer`]s
#[derive(Debug)]
pub struct BufferPool<A: PlaneAllocator, T: Transport> {
    allocator: A,
    transport: Arc<T>,
    registry: Arc<BufferRegistry<T>>,
    config: Option<PoolConfig>,
    flags: DmabufFlags,
    timeout: Duration,
    started: bool,
    slots: Vec<Option<LocalBuffer<T>>>,
    span: tracing::Span,
}

/// Pool storing frames in dumb buffers
pub type KmsBufferPool<D, T> = BufferPool<KmsAllocator<D>, T>;
/// Pool adopting frames from a dma-buf source
pub type DmabufBufferPool<S, T> = BufferPool<DmabufAllocator<S>, T>;

impl<A: PlaneAllocator, T: Transport> BufferPool<A, T> {
    /// Create a stopped, unconfigured pool
    pub fn new(allocator: A, transport: impl Into<Arc<T>>) -> BufferPool<A, T> {
        let span = info_span!("buffer_pool");
        let transport = transport.into();
        BufferPool {
            registry: Arc::new(BufferRegistry::new(Arc::clone(&transport), &span)),
            allocator,
            transport,
            config: None,
            flags: DmabufFlags::Y_INVERT,
            timeout: HANDSHAKE_TIMEOUT,
            started: false,
            slots: Vec::new(),
            span,
        }
    }

    /// Set the configuration, normalized to the pool's fixed capacity.
    ///
    /// Returns the configuration in effect.
    pub fn set_config(&mut self, config: PoolConfig) -> Result<&PoolConfig, PoolError> {
        let _guard = self.span.enter();
        if self.started {
            return Err(PoolError::Active);
        }

        let requested = (config.min_buffers, config.max_buffers);
        let config = config.normalized();
        if requested != (config.min_buffers, config.max_buffers) {
            debug!(
                requested_min = requested.0,
                requested_max = requested.1,
                capacity = POOL_CAPACITY,
                "buffer count normalized"
            );
        }
        Ok(self.config.insert(config))
    }

    /// The configuration in effect
    pub fn config(&self) -> Option<&PoolConfig> {
        self.config.as_ref()
    }

    /// Set the flags new compositor buffers are created with
    pub fn set_flags(&mut self, flags: DmabufFlags) {
        self.flags = flags;
    }

    /// Flags new compositor buffers are created with, [`DmabufFlags::Y_INVERT`] by default
    pub fn flags(&self) -> DmabufFlags {
        self.flags
    }

    #[cfg(test)]
    pub(crate) fn set_handshake_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The registry resolving release notifications of this pool's buffers
    pub fn registry(&self) -> &Arc<BufferRegistry<T>> {
        &self.registry
    }

    /// The transport of this pool
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The allocator of this pool
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Returns true between `start` and `stop`
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Acquire the allocator's device context and allocate the minimum number of buffers
    pub fn start(&mut self) -> Result<(), PoolError> {
        let span = self.span.clone();
        let _guard = span.enter();
        if self.started {
            return Ok(());
        }
        let config = self.config.clone().ok_or(PoolError::NotConfigured)?;

        self.allocator.start()?;
        self.started = true;
        self.slots = (0..config.max_buffers).map(|_| None).collect();
        for idx in 0..config.min_buffers {
            match self.alloc() {
                Ok(buffer) => self.slots[idx] = Some(buffer),
                Err(err) => {
                    warn!(?err, "failed to preallocate buffers");
                    self.slots.clear();
                    self.allocator.stop();
                    self.started = false;
                    return Err(err);
                }
            }
        }

        info!(
            format = ?config.descriptor.fourcc(),
            width = config.descriptor.width(),
            height = config.descriptor.height(),
            buffers = config.max_buffers,
            "pool started"
        );
        Ok(())
    }

    /// Release the device context.
    ///
    /// Buffers still held by the pipeline or the compositor stay valid until released.
    /// Releases dispatched afterwards are reaped by the next pool operation or when the
    /// pool is dropped.
    pub fn stop(&mut self) -> Result<(), PoolError> {
        let _guard = self.span.enter();
        if !self.started {
            return Ok(());
        }

        self.slots.clear();
        self.registry.reap();
        self.allocator.stop();
        self.started = false;
        info!("pool stopped");
        Ok(())
    }

    /// Create a new buffer for the configured frame format.
    ///
    /// The buffer is not part of the pool's slots, it is torn down once released.
    #[profiling::function]
    pub fn alloc(&mut self) -> Result<LocalBuffer<T>, PoolError> {
        let _guard = self.span.enter();
        if !self.started {
            return Err(PoolError::NotStarted);
        }
        self.registry.reap();
        let descriptor = self
            .config
            .as_ref()
            .map(|config| config.descriptor.clone())
            .ok_or(PoolError::NotConfigured)?;

        let planes = self.allocator.allocate(&descriptor)?;
        self.wrap(planes, &descriptor, self.flags)
    }

    /// Hand out a free buffer of the pool.
    ///
    /// Empty slots are filled lazily. Returns `None` if all buffers are in use.
    pub fn acquire(&mut self) -> Result<Option<LocalBuffer<T>>, PoolError> {
        if !self.started {
            return Err(PoolError::NotStarted);
        }
        self.registry.reap();

        let free = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().map_or(false, LocalBuffer::is_unique))
            .or_else(|| self.slots.iter().position(Option::is_none));
        let Some(idx) = free else {
            return Ok(None);
        };

        if self.slots[idx].is_none() {
            let buffer = self.alloc()?;
            self.slots[idx] = Some(buffer);
        }
        Ok(self.slots[idx].clone())
    }

    /// Wrap a frame produced elsewhere into a buffer.
    ///
    /// Dma-buf memory is adopted without copying, the buffer owns duplicates of
    /// its descriptors and is created with the dma-buf's flags on top of the pool's.
    /// Any other memory requires renegotiation.
    #[profiling::function]
    pub fn import(
        &self,
        memory: FrameMemory<'_>,
        descriptor: &VideoFrameDescriptor,
    ) -> Result<ImportOutcome<T>, PoolError> {
        let _guard = self.span.enter();
        self.registry.reap();
        let dmabuf = match memory {
            FrameMemory::Dmabuf(dmabuf) => dmabuf,
            FrameMemory::System(_) => {
                warn!("frame memory is not a dma-buf, renegotiation required");
                return Ok(ImportOutcome::NotNegotiated);
            }
        };

        let planes = import_dmabuf(dmabuf, descriptor)?;
        self.wrap(planes, descriptor, self.flags | dmabuf.flags())
            .map(ImportOutcome::Imported)
    }

    fn wrap(
        &self,
        planes: Planes,
        descriptor: &VideoFrameDescriptor,
        flags: DmabufFlags,
    ) -> Result<LocalBuffer<T>, PoolError> {
        let release: SharedReleaseListener<T> = self.registry.clone();
        let remote = match construct_buffer(
            &*self.transport,
            &planes,
            descriptor,
            flags,
            release,
            self.timeout,
        ) {
            Ok(remote) => remote,
            Err(err) => {
                debug!(?err, planes = planes.len(), "releasing planes of failed buffer");
                return Err(err.into());
            }
        };

        let descriptor = descriptor.with_planes(planes.iter().map(PlaneMemory::layout));
        let buffer = LocalBuffer::new(
            remote,
            planes,
            descriptor,
            self.transport.clone(),
            self.registry.clone(),
            &self.span,
        );
        self.registry.insert(&buffer);
        debug!(buffer = ?buffer.id(), "buffer ready");
        Ok(buffer)
    }
}

impl<A: PlaneAllocator, T: Transport> Drop for BufferPool<A, T> {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        self.slots.clear();
        self.registry.reap();
        self.registry.detach();
    }
}
