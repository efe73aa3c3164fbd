use std::{
    collections::HashMap,
    fmt,
    sync::{atomic::Ordering, Arc, Mutex, PoisonError, Weak},
};

use tracing::{debug, debug_span, trace};

use super::buffer::{BufferInner, CommitError, LocalBuffer};
use crate::backend::remote::{BufferId, ReleaseListener, Transport};

struct Entry<T: Transport> {
    buffer: Weak<BufferInner<T>>,
    /// Reference held on behalf of the compositor while the buffer is in flight
    hold: Option<LocalBuffer<T>>,
}

/// Mapping from compositor buffer ids to the local buffers of a pool.
///
/// Release notifications are resolved through the registry. All in-use flag
/// changes happen under its lock, and a buffer is removed from it before any of
/// its resources are released, so a notification never observes a buffer in
/// teardown.
///
/// Notifications arriving on the transport's dispatch thread never tear a buffer
/// down there: the references they drop are parked until the owning pool
/// [reaps](BufferRegistry::reap) them. Once the pool is gone, teardown happens in
/// place and cannot wait for the compositor.
pub struct BufferRegistry<T: Transport> {
    entries: Mutex<HashMap<BufferId<T>, Entry<T>>>,
    /// `None` once no pool reaps anymore
    parked: Mutex<Option<Vec<LocalBuffer<T>>>>,
    transport: Arc<T>,
    span: tracing::Span,
}

impl<T: Transport> fmt::Debug for BufferRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegistry").field("len", &self.len()).finish()
    }
}

impl<T: Transport> BufferRegistry<T> {
    pub(crate) fn new(transport: Arc<T>, parent: &tracing::Span) -> BufferRegistry<T> {
        BufferRegistry {
            entries: Mutex::new(HashMap::new()),
            parked: Mutex::new(Some(Vec::new())),
            transport,
            span: debug_span!(parent: parent, "registry"),
        }
    }

    /// Number of buffer references waiting to be reaped
    pub fn parked(&self) -> usize {
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Vec::len)
    }

    /// Drop the references parked by the dispatch thread, tearing down buffers nobody holds anymore.
    ///
    /// Must not be called from the dispatch thread.
    pub fn reap(&self) {
        let parked = match &mut *self.parked.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(parked) => std::mem::take(parked),
            None => Vec::new(),
        };
        if !parked.is_empty() {
            let _guard = self.span.enter();
            trace!(buffers = parked.len(), "reaping released buffers");
        }
    }

    /// Stop parking references, later notifications tear buffers down in place
    pub(crate) fn detach(&self) {
        let parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(parked);
    }

    /// Keep `buffers` alive until the next reap if running on the dispatch thread.
    ///
    /// Returns the buffers that have to be dropped in place.
    fn park(&self, buffers: Vec<LocalBuffer<T>>) -> Vec<LocalBuffer<T>> {
        if buffers.is_empty() || !self.transport.is_dispatch_thread() {
            return buffers;
        }
        match &mut *self.parked.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(parked) => {
                parked.extend(buffers);
                Vec::new()
            }
            None => {
                debug!("no pool reaps anymore, tearing down on the dispatch thread");
                buffers
            }
        }
    }

    /// Number of registered buffers
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no buffer is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if a buffer with the given id is registered
    pub fn contains(&self, id: &BufferId<T>) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub(crate) fn insert(&self, buffer: &LocalBuffer<T>) {
        let _guard = self.span.enter();
        let id = buffer.id();
        trace!(buffer = ?id, "registered buffer");
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).insert(
            id,
            Entry {
                buffer: Arc::downgrade(&buffer.0),
                hold: None,
            },
        );
    }

    /// Remove the entry of a buffer in teardown.
    ///
    /// Only removes the entry if it still belongs to `inner`.
    pub(crate) fn remove(&self, id: &BufferId<T>, inner: *const BufferInner<T>) -> bool {
        let _guard = self.span.enter();
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let owned = entries
                .get(id)
                .map_or(false, |entry| entry.buffer.as_ptr() == inner);
            if owned {
                entries.remove(id)
            } else {
                None
            }
        };
        trace!(buffer = ?id, removed = entry.is_some(), "unregistered buffer");
        entry.is_some()
    }

    pub(crate) fn mark_in_use(&self, buffer: &LocalBuffer<T>) -> Result<(), CommitError> {
        let _guard = self.span.enter();
        let id = buffer.id();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(&id).ok_or(CommitError::NotRegistered)?;
        if buffer.0.in_use.load(Ordering::SeqCst) {
            return Err(CommitError::InFlight);
        }

        buffer.0.in_use.store(true, Ordering::SeqCst);
        if buffer.0.write_mapped() {
            buffer.0.in_use.store(false, Ordering::SeqCst);
            return Err(CommitError::Mapped);
        }
        entry.hold = Some(buffer.clone());
        trace!(buffer = ?id, "buffer handed to the compositor");
        Ok(())
    }
}

impl<T: Transport> ReleaseListener<BufferId<T>> for BufferRegistry<T> {
    fn released(&self, id: &BufferId<T>) {
        let _guard = self.span.enter();
        // strong references are only ever dropped outside of the lock,
        // dropping the last one tears the buffer down
        let mut alive = None;
        let hold = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            match entries.get_mut(id) {
                None => {
                    trace!(buffer = ?id, "release of unknown buffer");
                    None
                }
                Some(entry) => match entry.buffer.upgrade() {
                    None => {
                        trace!(buffer = ?id, "release of buffer in teardown");
                        None
                    }
                    Some(buffer) => {
                        let was_in_use = buffer.in_use.swap(false, Ordering::SeqCst);
                        if was_in_use {
                            buffer.releases.fetch_add(1, Ordering::SeqCst);
                        }
                        alive = Some(buffer);
                        if was_in_use {
                            trace!(buffer = ?id, "buffer released by the compositor");
                            entry.hold.take()
                        } else {
                            trace!(buffer = ?id, "buffer was not in use");
                            None
                        }
                    }
                },
            }
        };
        let buffers = hold.into_iter().chain(alive.map(LocalBuffer)).collect();
        drop(self.park(buffers));
    }
}
