//! Per-object event handlers of the buffer construction requests.
//!
//! Buffer params and the buffers created from them are not assigned to an event queue,
//! their events are handled directly on the thread reading the connection.

use std::{
    cell::Cell,
    os::unix::io::OwnedFd,
    sync::Arc,
};

use tracing::{trace, warn};
use wayland_client::{
    backend::{protocol::Message, Backend, ObjectData, ObjectId},
    protocol::wl_buffer::WlBuffer,
    Connection, Proxy,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_buffer_params_v1::{
    self, ZwpLinuxBufferParamsV1,
};

use super::{WaylandBuffer, WaylandTransport};
use crate::backend::remote::{ParamsEvents, SharedReleaseListener};

thread_local!(static IN_HANDLER: Cell<bool> = Cell::new(false));

/// Returns true while an event handler of this module runs on the current thread
pub(super) fn in_handler() -> bool {
    IN_HANDLER.with(Cell::get)
}

fn handling<R>(f: impl FnOnce() -> R) -> R {
    let outer = IN_HANDLER.with(|flag| flag.replace(true));
    let _reset = scopeguard::guard(outer, |outer| IN_HANDLER.with(|flag| flag.set(outer)));
    f()
}

pub(super) struct ParamsData {
    pub(super) events: ParamsEvents<WaylandTransport>,
    pub(super) span: tracing::Span,
}

impl ObjectData for ParamsData {
    fn event(self: Arc<Self>, backend: &Backend, msg: Message<ObjectId, OwnedFd>) -> Option<Arc<dyn ObjectData>> {
        let _guard = self.span.enter();
        let connection = Connection::from_backend(backend.clone());

        handling(|| match ZwpLinuxBufferParamsV1::parse_event(&connection, msg) {
            Ok((_, zwp_linux_buffer_params_v1::Event::Created { buffer })) => {
                trace!(buffer = ?buffer.id(), "buffer created");
                // the new object needs its handler even if nobody waits for it anymore
                let data = Arc::new(BufferData {
                    listener: self.events.release_listener(),
                    span: self.span.clone(),
                });
                if let Err(buffer) = self.events.created(WaylandBuffer { buffer }) {
                    buffer.buffer.destroy();
                }
                Some(data as Arc<dyn ObjectData>)
            }
            Ok((_, zwp_linux_buffer_params_v1::Event::Failed)) => {
                self.events.failed();
                None
            }
            Ok((_, event)) => {
                warn!(?event, "unexpected buffer params event");
                None
            }
            Err(err) => {
                warn!(?err, "malformed buffer params event");
                None
            }
        })
    }

    fn destroyed(&self, _object_id: ObjectId) {}
}

struct BufferData {
    listener: SharedReleaseListener<WaylandTransport>,
    span: tracing::Span,
}

impl ObjectData for BufferData {
    fn event(self: Arc<Self>, _backend: &Backend, msg: Message<ObjectId, OwnedFd>) -> Option<Arc<dyn ObjectData>> {
        debug_assert!(wayland_client::backend::protocol::same_interface(
            msg.sender_id.interface(),
            WlBuffer::interface()
        ));
        // wl_buffer only has a single event: wl_buffer::release
        debug_assert!(msg.opcode == 0);

        let _guard = self.span.enter();
        handling(|| self.listener.released(&msg.sender_id));
        None
    }

    fn destroyed(&self, _object_id: ObjectId) {}
}
