use std::{
    fmt, io, slice,
    sync::{
        atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering},
        Arc,
    },
};

use smallvec::SmallVec;
use tracing::{debug, debug_span, trace, warn};

use super::registry::BufferRegistry;
use crate::backend::{
    allocator::{dmabuf::MAX_PLANES, format::VideoFrameDescriptor, PlaneMemory, Planes},
    remote::{BufferId, RemoteBuffer, Transport},
};
use crate::utils::{dmabuf_size, Mapping};

bitflags::bitflags! {
    /// Access requested when mapping a plane
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Read the plane's pixels
        const READ = 1;
        /// Write the plane's pixels
        const WRITE = 2;
    }
}

/// Display state of a [`LocalBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Never handed to the compositor
    Ready,
    /// Handed to the compositor and not released yet
    InFlight,
    /// Released by the compositor after being displayed
    Released,
}

/// Errors of [`LocalBuffer::mark_in_use`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    /// The buffer is not part of its pool's registry anymore
    #[error("the buffer is not registered")]
    NotRegistered,
    /// The compositor still holds the buffer
    #[error("the buffer is already in use by the compositor")]
    InFlight,
    /// A plane of the buffer is mapped for writing
    #[error("a plane of the buffer is mapped for writing")]
    Mapped,
}

/// Errors of [`LocalBuffer::map_plane`]
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// The buffer has no such plane
    #[error("plane {0} does not exist")]
    NoSuchPlane(usize),
    /// Writing is not possible while the compositor holds the buffer
    #[error("the buffer is in use by the compositor")]
    InUse,
    /// The plane is already mapped in an incompatible way
    #[error("the plane is already mapped for writing, or for reading when writing was requested")]
    Busy,
    /// The plane lies outside its memory
    #[error("the plane lies outside of its memory")]
    OutOfBounds,
    /// Mapping the memory failed
    #[error("failed to map the plane")]
    Map(#[from] io::Error),
}

/// Readers/writer state of a single plane, -1 for a writer, otherwise the number of readers
#[derive(Debug, Default)]
struct PlaneLock(AtomicIsize);

impl PlaneLock {
    fn lock(&self, write: bool) -> bool {
        if write {
            self.0.compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst).is_ok()
        } else {
            self.0
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |readers| {
                    (readers >= 0).then_some(readers + 1)
                })
                .is_ok()
        }
    }

    fn unlock(&self, write: bool) {
        if write {
            self.0.store(0, Ordering::SeqCst);
        } else {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_write_locked(&self) -> bool {
        self.0.load(Ordering::SeqCst) < 0
    }
}

pub(crate) struct BufferInner<T: Transport> {
    id: BufferId<T>,
    remote: Option<T::Buffer>,
    planes: Planes,
    locks: SmallVec<[PlaneLock; MAX_PLANES]>,
    descriptor: VideoFrameDescriptor,
    transport: Arc<T>,
    registry: Arc<BufferRegistry<T>>,
    pub(crate) in_use: AtomicBool,
    pub(crate) releases: AtomicUsize,
    span: tracing::Span,
}

impl<T: Transport> BufferInner<T> {
    pub(crate) fn write_mapped(&self) -> bool {
        self.locks.iter().any(PlaneLock::is_write_locked)
    }
}

impl<T: Transport> Drop for BufferInner<T> {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        self.registry.remove(&self.id, self as *const BufferInner<T>);

        if let Some(remote) = self.remote.take() {
            if let Err(err) = self.transport.destroy_buffer(remote) {
                warn!(?err, "failed to destroy compositor buffer");
            }
            if let Err(err) = self.transport.flush() {
                warn!(?err, "failed to flush buffer destruction");
            }
            if self.transport.is_dispatch_thread() {
                // a roundtrip would wait for ourselves
                warn!("teardown on the dispatch thread, skipping roundtrip");
            } else if let Err(err) = self.transport.roundtrip() {
                warn!(?err, "roundtrip after buffer destruction failed");
            }
        }

        trace!(planes = self.planes.len(), "releasing plane memory");
        self.planes.clear();
        debug!("buffer destroyed");
    }
}

/// A frame buffer shared with the compositor.
///
/// `LocalBuffer`s act like smart pointers: clones refer to the same buffer.
/// The buffer is torn down once the last clone held by the pipeline is dropped
/// and the compositor released it, in whatever order those happen. Teardown
/// unregisters the buffer, destroys the compositor object, waits for the
/// compositor to process that, and finally frees the plane memory.
pub struct LocalBuffer<T: Transport>(pub(crate) Arc<BufferInner<T>>);

impl<T: Transport> Clone for LocalBuffer<T> {
    fn clone(&self) -> Self {
        LocalBuffer(self.0.clone())
    }
}

impl<T: Transport> PartialEq for LocalBuffer<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl<T: Transport> Eq for LocalBuffer<T> {}

impl<T: Transport> fmt::Debug for LocalBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBuffer")
            .field("id", &self.0.id)
            .field("descriptor", &self.0.descriptor)
            .field("planes", &self.0.planes)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Transport> LocalBuffer<T> {
    pub(crate) fn new(
        remote: T::Buffer,
        planes: Planes,
        descriptor: VideoFrameDescriptor,
        transport: Arc<T>,
        registry: Arc<BufferRegistry<T>>,
        parent: &tracing::Span,
    ) -> LocalBuffer<T> {
        let id = remote.id();
        let locks = planes.iter().map(|_| PlaneLock::default()).collect();
        LocalBuffer(Arc::new(BufferInner {
            span: debug_span!(parent: parent, "buffer", id = ?id),
            id,
            remote: Some(remote),
            planes,
            locks,
            descriptor,
            transport,
            registry,
            in_use: AtomicBool::new(false),
            releases: AtomicUsize::new(0),
        }))
    }

    /// Returns true if no other clone of this buffer exists
    pub(crate) fn is_unique(&self) -> bool {
        Arc::strong_count(&self.0) == 1
    }

    /// Identifier of the compositor side buffer
    pub fn id(&self) -> BufferId<T> {
        self.0.id.clone()
    }

    /// The compositor side buffer
    pub fn remote(&self) -> &T::Buffer {
        // only taken during teardown
        self.0.remote.as_ref().expect("buffer used during teardown")
    }

    /// Frame description with the layout of the actually allocated planes
    pub fn descriptor(&self) -> &VideoFrameDescriptor {
        &self.0.descriptor
    }

    /// The memory of all planes
    pub fn planes(&self) -> &[PlaneMemory] {
        &self.0.planes
    }

    /// Returns true while the compositor holds the buffer
    pub fn is_in_use(&self) -> bool {
        self.0.in_use.load(Ordering::SeqCst)
    }

    /// Current display state
    pub fn state(&self) -> BufferState {
        if self.is_in_use() {
            BufferState::InFlight
        } else if self.0.releases.load(Ordering::SeqCst) > 0 {
            BufferState::Released
        } else {
            BufferState::Ready
        }
    }

    /// Mark the buffer as committed for display.
    ///
    /// The compositor holds a reference to the buffer until it releases it,
    /// so dropping every clone of the pipeline does not tear it down before.
    /// Fails if the buffer is already in flight or a plane is mapped for writing.
    pub fn mark_in_use(&self) -> Result<(), CommitError> {
        let _guard = self.0.span.enter();
        self.0.registry.mark_in_use(self)
    }

    /// Map a plane for CPU access.
    ///
    /// Planes mapped at allocation time reuse that mapping, all others are mapped
    /// from their dma-buf descriptor. A plane can be mapped by a single writer or
    /// any number of readers at a time. Writing is refused while the compositor
    /// holds the buffer.
    pub fn map_plane(&self, plane: usize, flags: MapFlags) -> Result<PlaneMapping<'_>, MapError> {
        let _guard = self.0.span.enter();
        let memory = self.0.planes.get(plane).ok_or(MapError::NoSuchPlane(plane))?;
        let lock = &self.0.locks[plane];
        let write = flags.contains(MapFlags::WRITE);

        if !lock.lock(write) {
            return Err(MapError::Busy);
        }
        let lock = scopeguard::guard(lock, |lock| lock.unlock(write));
        if write && self.is_in_use() {
            return Err(MapError::InUse);
        }

        let layout = memory.layout();
        let wanted = self.0.descriptor.plane_size(plane);
        let (ptr, len, owned) = match memory.mapping() {
            Some(mapping) => (mapping.as_ptr(), wanted.min(mapping.len()), None),
            None => {
                // TODO: bracket CPU access with DMA_BUF_IOCTL_SYNC for non-coherent devices
                let size = dmabuf_size(memory.fd())?;
                let offset = layout.offset as usize;
                if offset >= size {
                    return Err(MapError::OutOfBounds);
                }
                let mapping = Mapping::new(memory.fd(), 0, size, write)?;
                // SAFETY: offset lies within the mapping
                let ptr = unsafe { mapping.as_ptr().add(offset) };
                (ptr, wanted.min(size - offset), Some(mapping))
            }
        };
        trace!(plane, ?flags, len, "mapped plane");

        Ok(PlaneMapping {
            lock: scopeguard::ScopeGuard::into_inner(lock),
            write,
            ptr,
            len,
            stride: layout.stride,
            _mapping: owned,
        })
    }
}

/// CPU access to a single plane, see [`LocalBuffer::map_plane`].
///
/// Unmapped once dropped or [`unmap`](PlaneMapping::unmap)ped.
pub struct PlaneMapping<'a> {
    lock: &'a PlaneLock,
    write: bool,
    ptr: *mut u8,
    len: usize,
    stride: u32,
    _mapping: Option<Mapping>,
}

impl fmt::Debug for PlaneMapping<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaneMapping")
            .field("write", &self.write)
            .field("len", &self.len)
            .field("stride", &self.stride)
            .finish()
    }
}

impl PlaneMapping<'_> {
    /// Stride of the plane
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Number of mapped bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if the mapping allows writing
    pub fn is_writable(&self) -> bool {
        self.write
    }

    /// Start of the plane's first row
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// The plane's bytes
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr and len lie within a live mapping, no writer exists besides us
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    /// The plane's bytes for writing, `None` for read-only mappings
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if !self.write {
            return None;
        }
        // SAFETY: we are the only mapping of this plane
        Some(unsafe { slice::from_raw_parts_mut(self.ptr, self.len) })
    }

    /// Release the mapping
    pub fn unmap(self) {
        drop(self);
    }
}

impl Drop for PlaneMapping<'_> {
    fn drop(&mut self) {
        self.lock.unlock(self.write);
    }
}
