//! Transport over the `zwp_linux_dmabuf_v1` Wayland protocol.
//!
//! [`WaylandTransport`] binds the dmabuf global of a compositor and turns plane memory into
//! `wl_buffer`s. The events of the buffer construction requests and the release notifications
//! of the created buffers are handled directly on the thread reading the connection, usually
//! the one driven by an [`EventDispatcher`].
//!
//! ```no_run
//! use kmspool::backend::wayland::WaylandTransport;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = WaylandTransport::connect()?;
//! let dispatcher = transport.spawn_dispatcher()?;
//! // ... create a pool on top of the transport
//! dispatcher.stop()?;
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod dmabuf;

use std::{
    fmt,
    os::unix::io::BorrowedFd,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, ThreadId},
};

use tracing::{debug, debug_span, info, warn};
use wayland_client::{
    backend::ObjectId,
    globals::{registry_queue_init, GlobalListContents},
    protocol::{wl_buffer::WlBuffer, wl_registry},
    Connection, Dispatch, Proxy, QueueHandle,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1::{self, ZwpLinuxBufferParamsV1},
    zwp_linux_dmabuf_v1::{self, ZwpLinuxDmabufV1},
};

pub use self::dispatch::EventDispatcher;
use self::dmabuf::ParamsData;
use crate::backend::{
    allocator::{dmabuf::DmabufFlags, Format, Fourcc, Modifier},
    remote::{BufferParams, ParamsEvents, RemoteBuffer, Transport, TransportError},
};

/// A `wl_buffer` created from plane memory
#[derive(Debug)]
pub struct WaylandBuffer {
    buffer: WlBuffer,
}

impl WaylandBuffer {
    /// The underlying protocol object, to be attached to a surface
    pub fn wl_buffer(&self) -> &WlBuffer {
        &self.buffer
    }
}

impl RemoteBuffer for WaylandBuffer {
    type Id = ObjectId;

    fn id(&self) -> ObjectId {
        self.buffer.id()
    }
}

/// A pending `zwp_linux_buffer_params_v1` request
#[derive(Debug)]
pub struct WaylandParams {
    params: ZwpLinuxBufferParamsV1,
}

impl BufferParams for WaylandParams {
    fn add(
        &self,
        fd: BorrowedFd<'_>,
        plane_idx: u32,
        offset: u32,
        stride: u32,
        modifier: Modifier,
    ) -> Result<(), TransportError> {
        let modifier: u64 = modifier.into();
        // Modifier is in the platform's endianness.
        let modifier_hi = (modifier >> 32) as u32;
        let modifier_lo = modifier as u32;
        self.params
            .add(fd, plane_idx, offset, stride, modifier_hi, modifier_lo);
        Ok(())
    }

    fn create(&self, width: i32, height: i32, format: Fourcc, flags: DmabufFlags) -> Result<(), TransportError> {
        let flags = {
            let mut wire = zwp_linux_buffer_params_v1::Flags::empty();
            if flags.contains(DmabufFlags::Y_INVERT) {
                wire.insert(zwp_linux_buffer_params_v1::Flags::YInvert);
            }
            if flags.contains(DmabufFlags::INTERLACED) {
                wire.insert(zwp_linux_buffer_params_v1::Flags::Interlaced);
            }
            if flags.contains(DmabufFlags::BOTTOM_FIRST) {
                wire.insert(zwp_linux_buffer_params_v1::Flags::BottomFirst);
            }
            wire
        };
        self.params.create(width, height, format as u32, flags);
        Ok(())
    }

    fn destroy(self) {
        self.params.destroy();
    }
}

#[derive(Debug, Default)]
struct DmabufGlobal {
    formats: Vec<Format>,
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for DmabufGlobal {
    fn event(
        _state: &mut Self,
        _registry: &wl_registry::WlRegistry,
        _event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<ZwpLinuxDmabufV1, ()> for DmabufGlobal {
    fn event(
        state: &mut Self,
        _proxy: &ZwpLinuxDmabufV1,
        event: zwp_linux_dmabuf_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let (code, modifier) = match event {
            zwp_linux_dmabuf_v1::Event::Format { format } => (format, Modifier::Invalid),
            zwp_linux_dmabuf_v1::Event::Modifier {
                format,
                modifier_hi,
                modifier_lo,
            } => (
                format,
                Modifier::from(((modifier_hi as u64) << 32) | modifier_lo as u64),
            ),
            _ => return,
        };
        match Fourcc::try_from(code) {
            Ok(code) => state.formats.push(Format { code, modifier }),
            Err(_) => debug!(code, "ignoring unknown format"),
        }
    }
}

/// Connection to a Wayland compositor supporting `zwp_linux_dmabuf_v1`
pub struct WaylandTransport {
    connection: Connection,
    dmabuf: ZwpLinuxDmabufV1,
    formats: Vec<Format>,
    dispatch_thread: Arc<Mutex<Option<ThreadId>>>,
    span: tracing::Span,
}

impl fmt::Debug for WaylandTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaylandTransport")
            .field("dmabuf", &self.dmabuf)
            .field("formats", &self.formats.len())
            .finish_non_exhaustive()
    }
}

impl WaylandTransport {
    /// Connect to the compositor named by the environment
    pub fn connect() -> Result<WaylandTransport, TransportError> {
        let connection = Connection::connect_to_env()?;
        WaylandTransport::from_connection(connection)
    }

    /// Use an existing connection
    pub fn from_connection(connection: Connection) -> Result<WaylandTransport, TransportError> {
        let span = debug_span!("backend_wayland");
        let guard = span.enter();

        let (globals, mut queue) = registry_queue_init::<DmabufGlobal>(&connection)?;
        let dmabuf = globals
            .bind::<ZwpLinuxDmabufV1, _, _>(&queue.handle(), 3..=4, ())
            .map_err(|err| {
                warn!(?err, "no usable dmabuf global");
                TransportError::MissingGlobal("zwp_linux_dmabuf_v1")
            })?;

        // version 3 announces its formats right after the bind
        let mut state = DmabufGlobal::default();
        queue.roundtrip(&mut state)?;
        info!(
            version = dmabuf.version(),
            formats = state.formats.len(),
            "bound zwp_linux_dmabuf_v1"
        );
        drop(guard);

        Ok(WaylandTransport {
            connection,
            dmabuf,
            formats: state.formats,
            dispatch_thread: Arc::new(Mutex::new(None)),
            span,
        })
    }

    /// The underlying connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Formats announced by the compositor.
    ///
    /// Empty if the compositor only announces formats through dmabuf feedback (version 4).
    pub fn formats(&self) -> &[Format] {
        &self.formats
    }

    /// Start a thread reading the connection and delivering its events
    pub fn spawn_dispatcher(&self) -> Result<EventDispatcher, TransportError> {
        EventDispatcher::spawn(
            self.connection.clone(),
            self.dispatch_thread.clone(),
            &self.span,
        )
    }
}

impl Transport for WaylandTransport {
    type Buffer = WaylandBuffer;
    type Params = WaylandParams;

    fn create_params(&self, events: ParamsEvents<Self>) -> Result<WaylandParams, TransportError> {
        let params = self.dmabuf.send_constructor::<ZwpLinuxBufferParamsV1>(
            zwp_linux_dmabuf_v1::Request::CreateParams {},
            Arc::new(ParamsData {
                events,
                span: self.span.clone(),
            }),
        )?;
        Ok(WaylandParams { params })
    }

    fn destroy_buffer(&self, buffer: WaylandBuffer) -> Result<(), TransportError> {
        buffer.buffer.destroy();
        Ok(())
    }

    fn flush(&self) -> Result<(), TransportError> {
        self.connection.flush()?;
        Ok(())
    }

    fn roundtrip(&self) -> Result<(), TransportError> {
        self.connection.roundtrip()?;
        Ok(())
    }

    fn is_dispatch_thread(&self) -> bool {
        dmabuf::in_handler()
            || *self
                .dispatch_thread
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                == Some(thread::current().id())
    }
}
