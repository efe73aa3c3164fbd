//! In-process stand-ins for the compositor and the DRM device.
//!
//! [`TestTransport`] answers buffer creation requests from its own thread, like a
//! compositor connection dispatched on a separate thread would, and records every
//! request it receives. [`MemfdDevice`] hands out dumb buffer objects backed by
//! memfds, so exporting and mapping operate on real file descriptors.

use std::{
    collections::HashMap,
    fmt, io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use rustix::fs::MemfdFlags;

use crate::backend::{
    allocator::{
        dmabuf::{Dmabuf, DmabufFlags},
        dumb::{DumbContext, DumbDevice, DumbObject},
        format::VideoFrameDescriptor,
        shared::DmabufSource,
        AllocationError, Fourcc, Modifier,
    },
    remote::{BufferParams, ParamsEvents, RemoteBuffer, SharedReleaseListener, Transport, TransportError},
};
use crate::utils::{dup_fd, Mapping};

/// How the test compositor answers buffer creation requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Create the buffer right away
    Acknowledge,
    /// Create the buffer after the given delay
    AcknowledgeAfter(Duration),
    /// Report a failure
    Fail,
    /// Never answer
    Ignore,
}

/// Buffer created by the [`TestTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TestBuffer {
    id: u32,
}

impl RemoteBuffer for TestBuffer {
    type Id = u32;

    fn id(&self) -> u32 {
        self.id
    }
}

/// A plane registered with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedPlane {
    /// Whether the descriptor was valid when it was added
    pub valid_fd: bool,
    /// Plane index
    pub plane_idx: u32,
    /// Offset
    pub offset: u32,
    /// Stride
    pub stride: u32,
    /// Modifier
    pub modifier: Modifier,
}

/// A finalized buffer creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Planes in the order they were added
    pub planes: Vec<AddedPlane>,
    /// Width
    pub width: i32,
    /// Height
    pub height: i32,
    /// Pixel format
    pub format: Fourcc,
    /// Flags
    pub flags: DmabufFlags,
}

#[derive(Debug, Default)]
struct Counters {
    params_created: AtomicUsize,
    params_destroyed: AtomicUsize,
    buffers_created: AtomicUsize,
    buffers_destroyed: AtomicUsize,
    flushes: AtomicUsize,
    roundtrips: AtomicUsize,
}

struct TestState {
    behavior: Mutex<Behavior>,
    plane_slots: Mutex<Option<usize>>,
    counters: Counters,
    next_id: AtomicU32,
    requests: Mutex<Vec<CreateRequest>>,
    listeners: Mutex<HashMap<u32, SharedReleaseListener<TestTransport>>>,
    events: Mutex<Vec<JoinHandle<()>>>,
    dispatch_thread: Mutex<Option<ThreadId>>,
}

/// Fake compositor connection
#[derive(Clone)]
pub struct TestTransport {
    state: Arc<TestState>,
}

impl fmt::Debug for TestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestTransport")
            .field("behavior", &*self.state.behavior.lock().unwrap_or_else(PoisonError::into_inner))
            .field("counters", &self.state.counters)
            .finish()
    }
}

fn load(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

impl TestTransport {
    /// Create a new transport answering with `behavior`
    pub fn new(behavior: Behavior) -> TestTransport {
        TestTransport {
            state: Arc::new(TestState {
                behavior: Mutex::new(behavior),
                plane_slots: Mutex::new(None),
                counters: Counters::default(),
                next_id: AtomicU32::new(0),
                requests: Mutex::new(Vec::new()),
                listeners: Mutex::new(HashMap::new()),
                events: Mutex::new(Vec::new()),
                dispatch_thread: Mutex::new(None),
            }),
        }
    }

    /// Require every request to fill `slots` plane slots
    pub fn with_plane_slots(self, slots: usize) -> TestTransport {
        *self.state.plane_slots.lock().unwrap_or_else(PoisonError::into_inner) = Some(slots);
        self
    }

    /// Change how future requests are answered
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Request scopes created
    pub fn params_created(&self) -> usize {
        load(&self.state.counters.params_created)
    }

    /// Request scopes destroyed
    pub fn params_destroyed(&self) -> usize {
        load(&self.state.counters.params_destroyed)
    }

    /// Buffers created
    pub fn buffers_created(&self) -> usize {
        load(&self.state.counters.buffers_created)
    }

    /// Buffers destroyed
    pub fn buffers_destroyed(&self) -> usize {
        load(&self.state.counters.buffers_destroyed)
    }

    /// Buffers created and not destroyed yet
    pub fn live_buffers(&self) -> usize {
        self.buffers_created() - self.buffers_destroyed()
    }

    /// Number of flushes
    pub fn flushes(&self) -> usize {
        load(&self.state.counters.flushes)
    }

    /// Number of roundtrips
    pub fn roundtrips(&self) -> usize {
        load(&self.state.counters.roundtrips)
    }

    /// All finalized requests so far
    pub fn requests(&self) -> Vec<CreateRequest> {
        self.state
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Release the buffer with `id` like the compositor would.
    ///
    /// Returns false if no such buffer exists.
    pub fn release(&self, id: &u32) -> bool {
        let listener = self
            .state
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        match listener {
            Some(listener) => {
                listener.released(id);
                true
            }
            None => false,
        }
    }

    /// Run `f` with the current thread acting as the dispatch thread
    pub fn run_as_dispatch_thread<R>(&self, f: impl FnOnce() -> R) -> R {
        *self
            .state
            .dispatch_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        let _reset = scopeguard::guard((), |_| {
            *self
                .state
                .dispatch_thread
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = None;
        });
        f()
    }

    /// Wait until every pending answer was delivered
    pub fn wait_idle(&self) {
        loop {
            let pending =
                std::mem::take(&mut *self.state.events.lock().unwrap_or_else(PoisonError::into_inner));
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                let _ = handle.join();
            }
        }
    }

    fn deliver_created(&self, events: &ParamsEvents<TestTransport>) {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, events.release_listener());
        bump(&self.state.counters.buffers_created);

        if let Err(buffer) = events.created(TestBuffer { id }) {
            let _ = self.destroy_buffer(buffer);
        }
    }
}

impl Transport for TestTransport {
    type Buffer = TestBuffer;
    type Params = TestParams;

    fn create_params(&self, events: ParamsEvents<Self>) -> Result<TestParams, TransportError> {
        bump(&self.state.counters.params_created);
        Ok(TestParams {
            transport: self.clone(),
            events,
            planes: Mutex::new(Vec::new()),
        })
    }

    fn destroy_buffer(&self, buffer: TestBuffer) -> Result<(), TransportError> {
        self.state
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&buffer.id);
        bump(&self.state.counters.buffers_destroyed);
        Ok(())
    }

    fn flush(&self) -> Result<(), TransportError> {
        bump(&self.state.counters.flushes);
        Ok(())
    }

    fn roundtrip(&self) -> Result<(), TransportError> {
        bump(&self.state.counters.roundtrips);
        Ok(())
    }

    fn plane_slots(&self) -> Option<usize> {
        *self.state.plane_slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_dispatch_thread(&self) -> bool {
        *self
            .state
            .dispatch_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(thread::current().id())
    }
}

/// Request scope of the [`TestTransport`]
#[derive(Debug)]
pub struct TestParams {
    transport: TestTransport,
    events: ParamsEvents<TestTransport>,
    planes: Mutex<Vec<AddedPlane>>,
}

impl BufferParams for TestParams {
    fn add(
        &self,
        fd: BorrowedFd<'_>,
        plane_idx: u32,
        offset: u32,
        stride: u32,
        modifier: Modifier,
    ) -> Result<(), TransportError> {
        self.planes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AddedPlane {
                valid_fd: rustix::io::fcntl_getfd(fd).is_ok(),
                plane_idx,
                offset,
                stride,
                modifier,
            });
        Ok(())
    }

    fn create(&self, width: i32, height: i32, format: Fourcc, flags: DmabufFlags) -> Result<(), TransportError> {
        let planes = self.planes.lock().unwrap_or_else(PoisonError::into_inner).clone();
        self.transport
            .state
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CreateRequest {
                planes,
                width,
                height,
                format,
                flags,
            });

        let behavior = *self
            .transport
            .state
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let transport = self.transport.clone();
        let events = self.events.clone();
        let handle = match behavior {
            Behavior::Ignore => return Ok(()),
            Behavior::Fail => thread::spawn(move || events.failed()),
            Behavior::Acknowledge => thread::spawn(move || transport.deliver_created(&events)),
            Behavior::AcknowledgeAfter(delay) => thread::spawn(move || {
                thread::sleep(delay);
                transport.deliver_created(&events);
            }),
        };
        self.transport
            .state
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    fn destroy(self) {
        bump(&self.transport.state.counters.params_destroyed);
    }
}

#[derive(Debug, Default)]
struct DeviceCounters {
    attempts: AtomicUsize,
    exports: AtomicUsize,
    map_attempts: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    maps: AtomicUsize,
    fail_on: AtomicUsize,
    fail_export_on: AtomicUsize,
    fail_map_on: AtomicUsize,
    requests: Mutex<Vec<(u32, u32, u32)>>,
}

/// Dumb buffer device backed by memfds
#[derive(Debug, Clone, Default)]
pub struct MemfdDevice {
    counters: Arc<DeviceCounters>,
}

impl MemfdDevice {
    /// Create a new device
    pub fn new() -> MemfdDevice {
        MemfdDevice::default()
    }

    /// Make the `n`-th object creation (counting from 1) fail
    pub fn fail_on_object(&self, n: usize) {
        self.counters.fail_on.store(n, Ordering::SeqCst);
    }

    /// Make the `n`-th export (counting from 1) fail
    pub fn fail_on_export(&self, n: usize) {
        self.counters.fail_export_on.store(n, Ordering::SeqCst);
    }

    /// Make the `n`-th mapping (counting from 1) fail
    pub fn fail_on_map(&self, n: usize) {
        self.counters.fail_map_on.store(n, Ordering::SeqCst);
    }

    /// Objects created successfully
    pub fn created_objects(&self) -> usize {
        load(&self.counters.created)
    }

    /// Objects destroyed
    pub fn destroyed_objects(&self) -> usize {
        load(&self.counters.destroyed)
    }

    /// Objects created and not destroyed yet
    pub fn live_objects(&self) -> usize {
        self.created_objects() - self.destroyed_objects()
    }

    /// Number of objects mapped
    pub fn map_calls(&self) -> usize {
        load(&self.counters.maps)
    }

    /// `(width, height, bpp)` of every creation request
    pub fn requests(&self) -> Vec<(u32, u32, u32)> {
        self.counters
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DumbDevice for MemfdDevice {
    type Context = MemfdContext;

    fn open_context(&self) -> Result<MemfdContext, AllocationError> {
        Ok(MemfdContext {
            counters: self.counters.clone(),
            objects: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        })
    }
}

/// Context of a [`MemfdDevice`]
#[derive(Debug)]
pub struct MemfdContext {
    counters: Arc<DeviceCounters>,
    objects: Mutex<HashMap<u32, OwnedFd>>,
    next_handle: AtomicU32,
}

impl MemfdContext {
    fn with_object<R>(&self, object: &DumbObject, f: impl FnOnce(BorrowedFd<'_>) -> io::Result<R>) -> io::Result<R> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let fd = objects
            .get(&object.handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such object"))?;
        f(fd.as_fd())
    }
}

fn injected(attempts: &AtomicUsize, fail_on: &AtomicUsize) -> bool {
    attempts.fetch_add(1, Ordering::SeqCst) + 1 == fail_on.load(Ordering::SeqCst)
}

impl DumbContext for MemfdContext {
    fn create(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbObject> {
        if injected(&self.counters.attempts, &self.counters.fail_on) {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "injected allocation failure"));
        }

        let pitch = width * bpp / 8;
        let size = u64::from(pitch) * u64::from(height);
        let fd = rustix::fs::memfd_create("kmspool-dumb", MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size)?;

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, fd);
        self.counters
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((width, height, bpp));
        bump(&self.counters.created);

        Ok(DumbObject {
            handle,
            width,
            height,
            pitch,
            size,
        })
    }

    fn export(&self, object: &DumbObject) -> io::Result<OwnedFd> {
        if injected(&self.counters.exports, &self.counters.fail_export_on) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected export failure"));
        }
        self.with_object(object, dup_fd)
    }

    fn map(&self, object: &DumbObject) -> io::Result<Mapping> {
        if injected(&self.counters.map_attempts, &self.counters.fail_map_on) {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "injected mapping failure"));
        }
        let mapping = self.with_object(object, |fd| Mapping::new(fd, 0, object.size as usize, true))?;
        bump(&self.counters.maps);
        Ok(mapping)
    }

    fn destroy(&self, object: &DumbObject) -> io::Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&object.handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such object"))?;
        bump(&self.counters.destroyed);
        Ok(())
    }
}

/// Dma-buf source handing out a single memfd per frame.
///
/// Only the first plane carries a descriptor, the others live at their offsets
/// in the same memory.
#[derive(Debug, Default)]
pub struct MemfdDmabufSource {
    created: usize,
}

impl MemfdDmabufSource {
    /// Dma-bufs created so far
    pub fn created(&self) -> usize {
        self.created
    }
}

impl DmabufSource for MemfdDmabufSource {
    fn create_dmabuf(&mut self, descriptor: &VideoFrameDescriptor) -> Result<Dmabuf, AllocationError> {
        let source = |err: rustix::io::Errno| AllocationError::Source(Box::new(io::Error::from(err)));
        let fd = rustix::fs::memfd_create("kmspool-dmabuf", MemfdFlags::CLOEXEC).map_err(source)?;
        rustix::fs::ftruncate(&fd, descriptor.size() as u64).map_err(source)?;

        let mut fd = Some(fd);
        let mut builder = Dmabuf::builder(
            descriptor.width(),
            descriptor.height(),
            descriptor.fourcc(),
            DmabufFlags::empty(),
        );
        for (idx, layout) in descriptor.planes().iter().enumerate() {
            builder.add_plane(fd.take(), idx as u32, layout.offset, layout.stride, Modifier::Linear);
        }
        self.created += 1;
        builder.build().ok_or(AllocationError::MissingHandle { plane: 0 })
    }
}

/// Route log output of the crate's unit tests through the test harness
#[cfg(test)]
pub(crate) fn init_logging() {
    let builder = tracing_subscriber::fmt().with_test_writer();
    let _ = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(env_filter) => builder.with_env_filter(env_filter).try_init(),
        Err(_) => builder.try_init(),
    };
}
