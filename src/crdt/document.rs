use anyhow::{anyhow, Result};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::sync::Arc;

use crate::events::{EventEmitter, ListenerId};

/// Name of the document-level event carrying the connectivity flag
pub const SYNC_EVENT: &str = "sync";

/// Generic named-event channel attached to a document
pub type DocEvents = EventEmitter<Value>;

/// A replicated document that can contain nested sub-documents.
///
/// Handles are cheap clones of the same underlying document. The connection
/// tree only ever borrows documents; it never creates or destroys them.
pub trait ReplicatedDocument: Clone + Send + Sync + 'static {
    /// Guard returned by [`ReplicatedDocument::on_subdocs`]; dropping it
    /// unregisters the observer.
    type Subscription: Send + 'static;

    /// Stable, globally unique identifier of this document
    fn doc_guid(&self) -> Arc<str>;

    /// Observe sub-documents being loaded, added or removed
    fn on_subdocs<F>(&self, f: F) -> Result<Self::Subscription>
    where
        F: Fn(&SubdocsChange<Self>) + Send + Sync + 'static;

    /// The document's generic event channel
    fn events(&self) -> DocEvents;
}

/// One sub-documents notification, partitioned the way the CRDT reports it
#[derive(Debug, Clone)]
pub struct SubdocsChange<D> {
    /// Sub-documents whose content is available; eligible for a connection
    pub loaded: Vec<D>,
    /// Referenced but not loaded yet
    pub added: Vec<D>,
    pub removed: Vec<D>,
}

impl<D> Default for SubdocsChange<D> {
    fn default() -> Self {
        Self {
            loaded: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<D> SubdocsChange<D> {
    pub fn with_loaded(mut self, docs: impl IntoIterator<Item = D>) -> Self {
        self.loaded.extend(docs);
        self
    }

    pub fn with_added(mut self, docs: impl IntoIterator<Item = D>) -> Self {
        self.added.extend(docs);
        self
    }

    pub fn with_removed(mut self, docs: impl IntoIterator<Item = D>) -> Self {
        self.removed.extend(docs);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Two-state connectivity signal published on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    NotSynced,
}

impl SyncState {
    pub fn is_synced(self) -> bool {
        matches!(self, SyncState::Synced)
    }

    /// Payload carried by the `sync` document event
    pub fn to_payload(self) -> Value {
        Value::Bool(self.is_synced())
    }

    /// Read a `sync` payload. Anything but a boolean is rejected.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        payload.as_bool().map(Self::from)
    }
}

impl From<bool> for SyncState {
    fn from(synced: bool) -> Self {
        if synced {
            SyncState::Synced
        } else {
            SyncState::NotSynced
        }
    }
}

/// Publish a sync transition on `events`
pub fn emit_sync(events: &DocEvents, state: SyncState) {
    events.emit(SYNC_EVENT, &state.to_payload());
}

/// Listen for sync transitions; malformed payloads are skipped
pub fn on_sync<F>(events: &DocEvents, f: F) -> ListenerId
where
    F: Fn(SyncState) + Send + Sync + 'static,
{
    events.on(SYNC_EVENT, move |payload| {
        if let Some(state) = SyncState::from_payload(payload) {
            f(state);
        }
    })
}

// yrs documents carry no emitter of their own, so channels are resolved per
// instance: guid plus client id. Two replicas sharing a guid never share a
// channel. An entry is kept while someone holds a handle or has a listener.
type InstanceKey = (Arc<str>, u64);

static YRS_DOC_EVENTS: Lazy<DashMap<InstanceKey, DocEvents>> = Lazy::new(DashMap::new);

fn events_for_instance(key: InstanceKey) -> DocEvents {
    if let Some(existing) = YRS_DOC_EVENTS.get(&key) {
        return existing.clone();
    }
    prune_idle_doc_events();
    YRS_DOC_EVENTS.entry(key).or_default().clone()
}

/// Drop registry entries of `yrs` documents nobody listens to or holds a
/// channel handle for. Returns how many were removed.
///
/// Idle entries are also swept whenever a channel is created for a new
/// document instance; long-running hosts that drop many documents without
/// creating new ones can call this periodically.
pub fn prune_idle_doc_events() -> usize {
    let before = YRS_DOC_EVENTS.len();
    YRS_DOC_EVENTS.retain(|_, events| !events.is_idle());
    before.saturating_sub(YRS_DOC_EVENTS.len())
}

impl ReplicatedDocument for yrs::Doc {
    type Subscription = yrs::Subscription;

    fn doc_guid(&self) -> Arc<str> {
        Arc::from(yrs::Doc::guid(self).to_string())
    }

    fn on_subdocs<F>(&self, f: F) -> Result<Self::Subscription>
    where
        F: Fn(&SubdocsChange<Self>) + Send + Sync + 'static,
    {
        yrs::Doc::observe_subdocs(self, move |_txn, event| {
            let change = SubdocsChange {
                loaded: event.loaded().map(|doc| doc.clone()).collect(),
                added: event.added().map(|doc| doc.clone()).collect(),
                removed: event.removed().map(|doc| doc.clone()).collect(),
            };
            f(&change);
        })
        .map_err(|e| {
            anyhow!(
                "document {} refused a subdocs observer: {e:?}",
                yrs::Doc::guid(self)
            )
        })
    }

    fn events(&self) -> DocEvents {
        events_for_instance((self.doc_guid(), yrs::Doc::client_id(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn sync_state_round_trips_through_bool_payload() {
        assert_eq!(SyncState::Synced.to_payload(), Value::Bool(true));
        assert_eq!(
            SyncState::from_payload(&Value::Bool(false)),
            Some(SyncState::NotSynced)
        );
        assert_eq!(SyncState::from_payload(&Value::from("yes")), None);
    }

    #[test]
    fn on_sync_ignores_malformed_payloads() {
        let events = DocEvents::new();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        on_sync(&events, move |state| s.lock().push(state));

        events.emit(SYNC_EVENT, &Value::Null);
        emit_sync(&events, SyncState::Synced);
        emit_sync(&events, SyncState::NotSynced);

        assert_eq!(*seen.lock(), vec![SyncState::Synced, SyncState::NotSynced]);
    }

    #[test]
    fn yrs_doc_events_are_shared_per_guid() {
        let doc = yrs::Doc::new();
        let first = doc.events();
        let second = doc.clone().events();
        assert!(first.same_channel(&second));

        let other = yrs::Doc::new();
        assert!(!other.events().same_channel(&first));
    }

    #[test]
    fn yrs_doc_listener_survives_dropped_handle() {
        let doc = yrs::Doc::new();
        let hits = std::sync::Arc::new(Mutex::new(0));
        let h = hits.clone();
        on_sync(&doc.events(), move |_| *h.lock() += 1);

        // a fresh lookup must land on the channel holding the listener
        emit_sync(&doc.events(), SyncState::Synced);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn replicas_sharing_a_guid_get_separate_channels() {
        let a = yrs::Doc::new();
        let b = yrs::Doc::with_options(yrs::Options {
            guid: a.guid(),
            ..yrs::Options::default()
        });
        assert_eq!(a.doc_guid(), b.doc_guid());

        let hits = std::sync::Arc::new(Mutex::new(0));
        let h = hits.clone();
        on_sync(&b.events(), move |_| *h.lock() += 1);
        emit_sync(&a.events(), SyncState::Synced);

        assert!(!a.events().same_channel(&b.events()));
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn idle_entries_are_pruned_on_demand() {
        let doc = yrs::Doc::new();
        let key: InstanceKey = (doc.doc_guid(), doc.client_id());

        let id = on_sync(&doc.events(), |_| {});
        prune_idle_doc_events();
        assert!(YRS_DOC_EVENTS.contains_key(&key));

        doc.events().off(SYNC_EVENT, id);
        prune_idle_doc_events();
        assert!(!YRS_DOC_EVENTS.contains_key(&key));
    }
}
