//! Per-Instance Publish/Subscribe
//!
//! Components that announce things (the transport's `open`/`close`/`event`,
//! the mirror's state changes) own an [`Emitter`]. There is no process-wide
//! bus; whoever holds the component registers on it directly.

use std::sync::{Arc, Mutex};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`Emitter::on`]; pass it to [`Emitter::off`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A list of listeners for events of type `E`.
pub struct Emitter<E> {
    inner: Mutex<EmitterInner<E>>,
}

struct EmitterInner<E> {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener<E>)>,
}

impl<E> Emitter<E> {
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EmitterInner {
                next_id: 0,
                listeners: Vec::new(),
            }),
        }
    }

    /// Register a listener.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Call every listener in registration order.
    ///
    /// Listeners are snapshotted first, so a listener may register or
    /// unregister others without deadlocking.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmitterInner<E>> {
        // A panicking listener never holds the lock, so poisoning only
        // happens on a bug elsewhere; keep serving the listener list.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}
