use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle, ThreadId},
};

use rustix::event::{PollFd, PollFlags};
use tracing::{debug, debug_span, error, trace};
use wayland_client::{backend::WaylandError, Connection};

use crate::backend::remote::TransportError;

/// Poll timeout of the dispatch loop, bounds the latency of [`EventDispatcher::stop`]
const POLL_TIMEOUT_MS: i32 = 100;

/// Thread reading the compositor connection.
///
/// Release notifications and the answers to buffer construction requests are
/// delivered on this thread. Stopped on drop.
#[derive(Debug)]
pub struct EventDispatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), TransportError>>>,
}

fn would_block(err: &WaylandError) -> bool {
    matches!(err, WaylandError::Io(err) if err.kind() == io::ErrorKind::WouldBlock)
}

fn dispatch_loop(connection: &Connection, stop: &AtomicBool) -> Result<(), TransportError> {
    while !stop.load(Ordering::Acquire) {
        match connection.flush() {
            Ok(()) => {}
            Err(err) if would_block(&err) => {}
            Err(err) => return Err(err.into()),
        }

        let Some(guard) = connection.prepare_read() else {
            thread::yield_now();
            continue;
        };

        let ready = {
            let fd = guard.connection_fd();
            let mut fds = [PollFd::new(&fd, PollFlags::IN | PollFlags::ERR)];
            match rustix::event::poll(&mut fds, POLL_TIMEOUT_MS) {
                Ok(ready) => ready > 0,
                Err(rustix::io::Errno::INTR) => false,
                Err(err) => return Err(io::Error::from(err).into()),
            }
        };
        if !ready {
            // dropping the guard cancels the read
            continue;
        }

        match guard.read() {
            Ok(count) => trace!(count, "dispatched events"),
            Err(err) if would_block(&err) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

impl EventDispatcher {
    pub(super) fn spawn(
        connection: Connection,
        dispatch_thread: Arc<Mutex<Option<ThreadId>>>,
        parent: &tracing::Span,
    ) -> Result<EventDispatcher, TransportError> {
        let stop = Arc::new(AtomicBool::new(false));
        let span = debug_span!(parent: parent, "dispatcher");
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("kmspool-dispatch".into())
            .spawn(move || {
                let _guard = span.enter();
                *dispatch_thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
                let _reset = scopeguard::guard((), |_| {
                    *dispatch_thread.lock().unwrap_or_else(PoisonError::into_inner) = None;
                });

                debug!("dispatch thread started");
                let result = dispatch_loop(&connection, &thread_stop);
                match &result {
                    Ok(()) => debug!("dispatch thread stopped"),
                    Err(err) => error!(?err, "dispatch thread failed"),
                }
                result
            })?;

        Ok(EventDispatcher {
            stop,
            handle: Some(handle),
        })
    }

    /// Returns true while the dispatch thread is running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |handle| !handle.is_finished())
    }

    /// Stop the dispatch thread and wait for it to exit.
    ///
    /// Returns the error that made the thread exit early, if any.
    pub fn stop(mut self) -> Result<(), TransportError> {
        self.join()
    }

    fn join(&mut self) -> Result<(), TransportError> {
        self.stop.store(true, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(TransportError::Closed)),
            None => Ok(()),
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            debug!(?err, "dispatch thread exited with an error");
        }
    }
}
