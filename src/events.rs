//! Named event channels
//!
//! A small thread-safe emitter keyed by event name. Listeners are identified
//! by a [`ListenerId`] so they can be detached individually. Dispatch works
//! on a snapshot of the listener list, so a listener may call `off` (or `on`)
//! while an `emit` is in flight without deadlocking.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifier returned by [`EventEmitter::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Listeners<A> {
    next_id: u64,
    by_name: HashMap<String, Vec<(ListenerId, Callback<A>)>>,
}

/// Cloneable handle to a shared set of named listeners
pub struct EventEmitter<A> {
    inner: Arc<Mutex<Listeners<A>>>,
}

impl<A> EventEmitter<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                by_name: HashMap::new(),
            })),
        }
    }

    /// Register `listener` for events named `name`
    pub fn on<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner
            .by_name
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Detach a listener. Returns `false` if it was not registered under `name`.
    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let Some(list) = inner.by_name.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.by_name.remove(name);
        }
        removed
    }

    /// Deliver `payload` to every listener of `name`, in registration order
    pub fn emit(&self, name: &str, payload: &A) {
        let snapshot: Vec<Callback<A>> = match self.inner.lock().by_name.get(name) {
            Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return,
        };
        for callback in snapshot {
            callback(payload);
        }
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .by_name
            .get(name)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Listeners across every event name
    pub fn total_listeners(&self) -> usize {
        self.inner.lock().by_name.values().map(|list| list.len()).sum()
    }

    /// True when both handles point at the same listener set
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// No listeners and no handle other than this one
    pub(crate) fn is_idle(&self) -> bool {
        Arc::strong_count(&self.inner) == 1 && self.total_listeners() == 0
    }
}

impl<A> Clone for EventEmitter<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> Default for EventEmitter<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for EventEmitter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.total_listeners())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_only_matching_listeners() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        emitter.on("a", move |v| {
            h.fetch_add(*v as usize, Ordering::SeqCst);
        });
        emitter.on("b", |_| panic!("wrong channel"));

        emitter.emit("a", &3);
        emitter.emit("c", &100);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn off_detaches_and_prunes_empty_names() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        let id = emitter.on("sync", |_| {});
        assert_eq!(emitter.listener_count("sync"), 1);

        assert!(emitter.off("sync", id));
        assert!(!emitter.off("sync", id));
        assert_eq!(emitter.listener_count("sync"), 0);
        assert_eq!(emitter.total_listeners(), 0);
    }

    #[test]
    fn listener_can_detach_itself_during_emit() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let e = emitter.clone();
        let s = slot.clone();
        let id = emitter.on("once", move |_| {
            if let Some(id) = s.lock().take() {
                e.off("once", id);
            }
        });
        *slot.lock() = Some(id);

        emitter.emit("once", &());
        assert_eq!(emitter.listener_count("once"), 0);
    }

    #[test]
    fn idle_requires_no_listeners_and_single_handle() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        assert!(emitter.is_idle());

        let other = emitter.clone();
        assert!(!emitter.is_idle());
        assert!(other.same_channel(&emitter));
        drop(other);

        let id = emitter.on("sync", |_| {});
        assert!(!emitter.is_idle());
        emitter.off("sync", id);
        assert!(emitter.is_idle());
    }
}
