//! Scripted in-process document.
//!
//! `MemoryDoc` has no CRDT content. It exists so hosts and tests can drive
//! sub-document notifications by hand and inspect how many observers are
//! registered at any moment.

use anyhow::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

use super::document::{DocEvents, ReplicatedDocument, SubdocsChange};

type SubdocsCallback = Arc<dyn Fn(&SubdocsChange<MemoryDoc>) + Send + Sync>;

struct Inner {
    guid: Arc<str>,
    events: DocEvents,
    observers: Mutex<Observers>,
}

#[derive(Default)]
struct Observers {
    next_id: u64,
    list: Vec<(u64, SubdocsCallback)>,
}

#[derive(Clone)]
pub struct MemoryDoc {
    inner: Arc<Inner>,
}

impl MemoryDoc {
    /// Document with a random guid
    pub fn new() -> Self {
        Self::with_guid(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_guid(guid: impl Into<String>) -> Self {
        let guid: String = guid.into();
        Self {
            inner: Arc::new(Inner {
                guid: Arc::from(guid),
                events: DocEvents::new(),
                observers: Mutex::new(Observers::default()),
            }),
        }
    }

    /// Deliver a sub-documents notification to every observer
    pub fn notify_subdocs(&self, change: SubdocsChange<MemoryDoc>) {
        let snapshot: Vec<SubdocsCallback> = self
            .inner
            .observers
            .lock()
            .list
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in snapshot {
            callback(&change);
        }
    }

    /// Shorthand for a notification with only a loaded set
    pub fn load(&self, subdocs: &[&MemoryDoc]) {
        let docs = subdocs.iter().map(|doc| (*doc).clone());
        self.notify_subdocs(SubdocsChange::default().with_loaded(docs));
    }

    /// Shorthand for a notification with only a removed set
    pub fn remove(&self, subdocs: &[&MemoryDoc]) {
        let docs = subdocs.iter().map(|doc| (*doc).clone());
        self.notify_subdocs(SubdocsChange::default().with_removed(docs));
    }

    pub fn subdoc_observer_count(&self) -> usize {
        self.inner.observers.lock().list.len()
    }

    /// Observers plus event listeners currently registered on this document
    pub fn active_listeners(&self) -> usize {
        self.subdoc_observer_count() + self.inner.events.total_listeners()
    }

    pub fn same_doc(&self, other: &MemoryDoc) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for MemoryDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDoc")
            .field("guid", &self.inner.guid)
            .field("subdoc_observers", &self.subdoc_observer_count())
            .finish()
    }
}

/// Unregisters its observer when dropped
pub struct MemorySubscription {
    doc: Weak<Inner>,
    id: u64,
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.doc.upgrade() {
            inner.observers.lock().list.retain(|(id, _)| *id != self.id);
        }
    }
}

impl ReplicatedDocument for MemoryDoc {
    type Subscription = MemorySubscription;

    fn doc_guid(&self) -> Arc<str> {
        self.inner.guid.clone()
    }

    fn on_subdocs<F>(&self, f: F) -> Result<Self::Subscription>
    where
        F: Fn(&SubdocsChange<Self>) + Send + Sync + 'static,
    {
        let mut observers = self.inner.observers.lock();
        observers.next_id += 1;
        let id = observers.next_id;
        observers.list.push((id, Arc::new(f)));
        Ok(MemorySubscription {
            doc: Arc::downgrade(&self.inner),
            id,
        })
    }

    fn events(&self) -> DocEvents {
        self.inner.events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dropping_subscription_unregisters_observer() {
        let doc = MemoryDoc::with_guid("root");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = doc
            .on_subdocs(move |change| {
                c.fetch_add(change.loaded.len(), Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(doc.subdoc_observer_count(), 1);

        doc.load(&[&MemoryDoc::new(), &MemoryDoc::new()]);
        drop(sub);
        doc.load(&[&MemoryDoc::new()]);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(doc.active_listeners(), 0);
    }

    #[test]
    fn clones_share_identity() {
        let doc = MemoryDoc::with_guid("g1");
        let copy = doc.clone();
        assert!(doc.same_doc(&copy));
        assert_eq!(copy.doc_guid().as_ref(), "g1");
        assert!(!doc.same_doc(&MemoryDoc::with_guid("g1")));
    }
}
