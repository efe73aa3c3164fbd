use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use super::{BufferParams, SharedReleaseListener, Transport, TransportError};
use crate::backend::allocator::{dmabuf::DmabufFlags, format::VideoFrameDescriptor, PlaneMemory};

/// Errors of the buffer construction handshake
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The compositor refused to create the buffer
    #[error("the compositor failed to create the buffer")]
    Failed,
    /// The compositor did not answer in time
    #[error("the compositor did not answer within {0:?}")]
    Timeout(Duration),
    /// The planes cannot describe the frame
    #[error("malformed plane data: {0}")]
    MalformedPlanes(&'static str),
    /// Talking to the compositor failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct State<T: Transport> {
    done: bool,
    abandoned: bool,
    buffer: Option<T::Buffer>,
    params: Option<T::Params>,
}

struct Handshake<T: Transport> {
    state: Mutex<State<T>>,
    cond: Condvar,
    release: SharedReleaseListener<T>,
}

impl<T: Transport> Handshake<T> {
    fn new(release: SharedReleaseListener<T>) -> Arc<Handshake<T>> {
        Arc::new(Handshake {
            state: Mutex::new(State {
                done: false,
                abandoned: false,
                buffer: None,
                params: None,
            }),
            cond: Condvar::new(),
            release,
        })
    }

    /// Finish the handshake, hands `buffer` back if it was already finished or abandoned
    fn finish(&self, buffer: Option<T::Buffer>) -> Result<(), Option<T::Buffer>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.done || state.abandoned {
            return Err(buffer);
        }
        state.done = true;
        state.buffer = buffer;
        let params = state.params.take();
        self.cond.notify_all();
        drop(state);

        // both terminal events end the request scope
        if let Some(params) = params {
            params.destroy();
        }
        Ok(())
    }

    /// Block until the terminal event arrived or `timeout` elapsed.
    ///
    /// On timeout the handshake is abandoned under the same lock that observed the
    /// missing answer, so every later `created` hands its buffer back. Returns the
    /// still pending request scope in that case.
    fn wait(&self, timeout: Duration) -> Result<Option<T::Buffer>, Option<T::Params>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |state| !state.done)
            .unwrap_or_else(PoisonError::into_inner);
        if state.done {
            return Ok(state.buffer.take());
        }
        state.abandoned = true;
        Err(state.params.take())
    }

    /// Give up on the handshake and destroy the request scope if still pending.
    ///
    /// Returns a buffer the compositor created in the meantime.
    fn abandon(&self) -> Option<T::Buffer> {
        let (params, buffer) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.abandoned = true;
            (state.params.take(), state.buffer.take())
        };
        if let Some(params) = params {
            params.destroy();
        }
        buffer
    }
}

/// Event sink of a pending buffer construction.
///
/// Handed to [`Transport::create_params`], used from the dispatch thread to
/// report the single terminal event of the request.
pub struct ParamsEvents<T: Transport> {
    handshake: Arc<Handshake<T>>,
}

impl<T: Transport> Clone for ParamsEvents<T> {
    fn clone(&self) -> Self {
        ParamsEvents {
            handshake: self.handshake.clone(),
        }
    }
}

impl<T: Transport> fmt::Debug for ParamsEvents<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.handshake.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ParamsEvents")
            .field("done", &state.done)
            .field("abandoned", &state.abandoned)
            .finish()
    }
}

impl<T: Transport> ParamsEvents<T> {
    /// The compositor created `buffer`.
    ///
    /// Returns the buffer back if nobody is waiting for it anymore (the
    /// handshake timed out), in which case the caller has to destroy it.
    pub fn created(&self, buffer: T::Buffer) -> Result<(), T::Buffer> {
        match self.handshake.finish(Some(buffer)) {
            Ok(()) | Err(None) => Ok(()),
            Err(Some(buffer)) => {
                debug!(?buffer, "buffer created after the handshake was abandoned");
                Err(buffer)
            }
        }
    }

    /// The compositor failed to create the buffer
    pub fn failed(&self) {
        if self.handshake.finish(None).is_err() {
            debug!("failure reported after the handshake ended");
        }
    }

    /// Listener the release notifications of the created buffer have to be routed to
    pub fn release_listener(&self) -> SharedReleaseListener<T> {
        self.handshake.release.clone()
    }
}

/// Create a compositor side buffer from the memory of a frame.
///
/// Registers every plane with a new request scope, finalizes it and blocks until the
/// compositor answers or `timeout` elapses. The returned buffer is already acknowledged
/// by the compositor. Release notifications of the buffer are routed to `release`.
///
/// The request scope is destroyed exactly once on every path, including timeouts.
/// Must not be called from the transport's dispatch thread.
#[profiling::function]
pub fn construct_buffer<T: Transport>(
    transport: &T,
    planes: &[PlaneMemory],
    descriptor: &VideoFrameDescriptor,
    flags: DmabufFlags,
    release: SharedReleaseListener<T>,
    timeout: Duration,
) -> Result<T::Buffer, HandshakeError> {
    if planes.is_empty() {
        return Err(HandshakeError::MalformedPlanes("frame without planes"));
    }
    if planes.len() != descriptor.plane_count() {
        return Err(HandshakeError::MalformedPlanes("plane count does not match the format"));
    }
    let slots = transport.plane_slots().unwrap_or(planes.len());
    if slots < planes.len() {
        return Err(HandshakeError::MalformedPlanes("more planes than the transport supports"));
    }
    let width = i32::try_from(descriptor.width()).map_err(|_| HandshakeError::MalformedPlanes("width"))?;
    let height = i32::try_from(descriptor.height()).map_err(|_| HandshakeError::MalformedPlanes("height"))?;

    let handshake = Handshake::new(release);
    let params = transport.create_params(ParamsEvents {
        handshake: handshake.clone(),
    })?;
    let params = scopeguard::guard(params, BufferParams::destroy);

    for (idx, plane) in planes.iter().enumerate() {
        let layout = plane.layout();
        params.add(plane.fd(), idx as u32, layout.offset, layout.stride, plane.modifier())?;
    }
    // fixed slot layouts need a valid handle in every slot
    for idx in planes.len()..slots {
        params.add(planes[0].fd(), idx as u32, 0, 0, planes[0].modifier())?;
    }
    trace!(planes = planes.len(), slots, "registered planes");

    {
        let mut state = handshake.state.lock().unwrap_or_else(PoisonError::into_inner);
        let params = state.params.insert(scopeguard::ScopeGuard::into_inner(params));
        if let Err(err) = params.create(width, height, descriptor.fourcc(), flags) {
            if let Some(params) = state.params.take() {
                params.destroy();
            }
            return Err(err.into());
        }
    }

    if let Err(err) = transport.flush() {
        if let Some(buffer) = handshake.abandon() {
            if let Err(err) = transport.destroy_buffer(buffer) {
                warn!(?err, "failed to destroy buffer of abandoned request");
            }
        }
        return Err(err.into());
    }

    let start = Instant::now();
    match handshake.wait(timeout) {
        Ok(Some(buffer)) => {
            trace!(?buffer, elapsed = ?start.elapsed(), "compositor created buffer");
            Ok(buffer)
        }
        Ok(None) => {
            debug!("compositor failed to create buffer");
            Err(HandshakeError::Failed)
        }
        Err(params) => {
            if let Some(params) = params {
                params.destroy();
            }
            if let Err(err) = transport.flush() {
                warn!(?err, "failed to flush the destruction of the request");
            }
            warn!(elapsed = ?start.elapsed(), "compositor did not answer the buffer creation");
            Err(HandshakeError::Timeout(timeout))
        }
    }
}
