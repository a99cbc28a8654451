//! Recursive connection tree
//!
//! A [`ConnectionNode`] binds one document to one channel through one
//! transport connection. It republishes connection events as the document's
//! `sync` signal and grows or shrinks its subtree as sub-documents are loaded
//! and removed. Children are keyed by sub-document guid and owned exclusively
//! by their parent.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::transport::{
    Connection, ConnectionEvent, Endpoint, Transport, EVENT_CONNECTION_CLOSE,
    EVENT_CONNECTION_ERROR, EVENT_SYNC,
};
use crate::crdt::{emit_sync, ReplicatedDocument, SubdocsChange};
use crate::events::ListenerId;

type DocSubscription<T> = <<T as Transport>::Document as ReplicatedDocument>::Subscription;

struct Children<T: Transport> {
    /// Set once the owning node starts tearing down; no attachments after that
    closed: bool,
    nodes: HashMap<Arc<str>, ConnectionNode<T>>,
}

/// Attach the root of a connection tree for `doc` on channel `room`.
///
/// The returned node is the handle for the whole tree: dropping or disposing
/// it closes every connection it opened.
pub fn attach_provider<T: Transport>(
    transport: Arc<T>,
    url: impl Into<String>,
    room: impl Into<String>,
    doc: T::Document,
    presence: Arc<T::Presence>,
) -> Result<ConnectionNode<T>> {
    ConnectionNode::attach(transport, Endpoint::new(url, room), doc, presence)
}

pub struct ConnectionNode<T: Transport> {
    endpoint: Endpoint,
    doc: T::Document,
    presence: Arc<T::Presence>,
    connection: T::Connection,
    listeners: Vec<(&'static str, ListenerId)>,
    subdocs: Option<DocSubscription<T>>,
    children: Arc<Mutex<Children<T>>>,
    disposed: bool,
}

impl<T: Transport> ConnectionNode<T> {
    pub fn attach(
        transport: Arc<T>,
        endpoint: Endpoint,
        doc: T::Document,
        presence: Arc<T::Presence>,
    ) -> Result<Self> {
        let connection = transport.open(endpoint.clone(), &doc, presence.clone());

        let mut listeners = Vec::with_capacity(3);
        for name in [EVENT_SYNC, EVENT_CONNECTION_CLOSE, EVENT_CONNECTION_ERROR] {
            let doc_events = doc.events();
            let room = endpoint.room.clone();
            let id = connection.events().on(name, move |event: &ConnectionEvent| {
                let state = event.sync_state();
                trace!(%room, ?state, "connection event {}", event.name());
                emit_sync(&doc_events, state);
            });
            listeners.push((name, id));
        }

        let children = Arc::new(Mutex::new(Children {
            closed: false,
            nodes: HashMap::new(),
        }));

        let subdocs = match doc.on_subdocs(subdocs_handler(
            transport,
            endpoint.clone(),
            presence.clone(),
            children.clone(),
        )) {
            Ok(subscription) => subscription,
            Err(err) => {
                for (name, id) in listeners {
                    connection.events().off(name, id);
                }
                return Err(err.context(format!("cannot attach channel {}", endpoint.room)));
            }
        };

        connection.connect();
        debug!(room = %endpoint.room, url = %endpoint.url, "connection node attached");

        Ok(Self {
            endpoint,
            doc,
            presence,
            connection,
            listeners,
            subdocs: Some(subdocs),
            children,
            disposed: false,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn room(&self) -> &str {
        &self.endpoint.room
    }

    pub fn document(&self) -> &T::Document {
        &self.doc
    }

    pub fn connection(&self) -> &T::Connection {
        &self.connection
    }

    pub fn presence(&self) -> &Arc<T::Presence> {
        &self.presence
    }

    /// Channels of the directly attached children, sorted
    pub fn child_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .children
            .lock()
            .nodes
            .values()
            .map(|child| child.endpoint.room.clone())
            .collect();
        rooms.sort();
        rooms
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().nodes.len()
    }

    pub fn has_child(&self, guid: &str) -> bool {
        self.children.lock().nodes.contains_key(guid)
    }

    /// Every node below this one, at any depth
    pub fn descendant_count(&self) -> usize {
        self.children
            .lock()
            .nodes
            .values()
            .map(|child| 1 + child.descendant_count())
            .sum()
    }

    /// Tear down this node and its whole subtree.
    pub fn dispose(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        // listeners go first so an intentional close never reads as a drop
        let events = self.connection.events();
        for (name, id) in self.listeners.drain(..) {
            events.off(name, id);
        }
        drop(self.subdocs.take());

        self.connection.disconnect();

        let nodes = {
            let mut children = self.children.lock();
            children.closed = true;
            std::mem::take(&mut children.nodes)
        };
        for (_, child) in nodes {
            child.dispose();
        }

        debug!(room = %self.endpoint.room, "connection node disposed");
    }
}

impl<T: Transport> Drop for ConnectionNode<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<T: Transport> fmt::Debug for ConnectionNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionNode")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.connection.is_connected())
            .field("children", &self.child_rooms())
            .finish()
    }
}

/// Handles one sub-documents notification.
///
/// The child map is only locked to read or swap entries. Children are
/// attached, connected and disposed with the lock released, so transport
/// and `sync` callbacks may call back into the parent node.
fn subdocs_handler<T: Transport>(
    transport: Arc<T>,
    endpoint: Endpoint,
    presence: Arc<T::Presence>,
    children: Arc<Mutex<Children<T>>>,
) -> impl Fn(&SubdocsChange<T::Document>) + Send + Sync + 'static {
    move |change| {
        let stale: Vec<ConnectionNode<T>> = {
            let mut children = children.lock();
            if children.closed {
                trace!(room = %endpoint.room, "sub-document change after teardown ignored");
                return;
            }
            change
                .loaded
                .iter()
                .filter_map(|subdoc| children.nodes.remove(&subdoc.doc_guid()))
                .collect()
        };
        for node in stale {
            let guid = node.doc.doc_guid();
            warn!(room = %endpoint.room, %guid, "sub-document loaded twice, replacing it");
            node.dispose();
        }

        let mut attached = Vec::with_capacity(change.loaded.len());
        for subdoc in &change.loaded {
            let guid = subdoc.doc_guid();
            match ConnectionNode::attach(
                transport.clone(),
                endpoint.child(&guid),
                subdoc.clone(),
                presence.clone(),
            ) {
                Ok(node) => attached.push((guid, node)),
                Err(err) => {
                    warn!(room = %endpoint.room, %guid, "sub-document left unsynced: {err:#}");
                }
            }
        }

        let mut released = Vec::new();
        {
            let mut children = children.lock();
            if children.closed {
                // torn down while the children were connecting
                released.extend(attached.into_iter().map(|(_, node)| node));
            } else {
                for (guid, node) in attached {
                    if let Some(previous) = children.nodes.insert(guid, node) {
                        released.push(previous);
                    }
                }
                for subdoc in &change.removed {
                    let guid = subdoc.doc_guid();
                    match children.nodes.remove(&guid) {
                        Some(node) => released.push(node),
                        // removed before it ever loaded; could also hide a double detach
                        None => debug!(room = %endpoint.room, %guid, "removed, never attached"),
                    }
                }
            }
        }
        for node in released {
            node.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{on_sync, MemoryDoc, SyncState};
    use crate::sync::memory::MemoryTransport;

    fn transport() -> Arc<MemoryTransport<MemoryDoc>> {
        Arc::new(MemoryTransport::new())
    }

    fn attach(
        transport: &Arc<MemoryTransport<MemoryDoc>>,
        doc: &MemoryDoc,
    ) -> ConnectionNode<MemoryTransport<MemoryDoc>> {
        attach_provider(transport.clone(), "wss://x", "proj", doc.clone(), Arc::new(())).unwrap()
    }

    #[test]
    fn root_connects_on_attach() {
        let transport = transport();
        let doc = MemoryDoc::with_guid("root");
        let node = attach(&transport, &doc);

        assert!(node.connection().is_connected());
        assert_eq!(transport.hub().live_rooms(), vec!["proj".to_string()]);
        assert_eq!(doc.subdoc_observer_count(), 1);
        assert_eq!(node.room(), "proj");
    }

    #[test]
    fn added_only_subdocs_open_nothing() {
        let transport = transport();
        let doc = MemoryDoc::with_guid("root");
        let node = attach(&transport, &doc);

        let pending = MemoryDoc::with_guid("pending");
        doc.notify_subdocs(SubdocsChange::default().with_added([pending]));

        assert_eq!(node.child_count(), 0);
        assert_eq!(transport.hub().open_count("proj--pending"), 0);
    }

    #[test]
    fn dropping_root_tears_down_like_dispose() {
        let transport = transport();
        let doc = MemoryDoc::with_guid("root");
        let sub = MemoryDoc::with_guid("a1");
        {
            let _node = attach(&transport, &doc);
            doc.load(&[&sub]);
            assert_eq!(transport.hub().live_count("proj--a1"), 1);
        }

        assert!(transport.hub().live_rooms().is_empty());
        assert_eq!(doc.active_listeners(), 0);
        assert_eq!(sub.active_listeners(), 0);
    }

    #[test]
    fn close_and_error_both_read_as_not_synced() {
        let transport = transport();
        let doc = MemoryDoc::with_guid("root");
        let _node = attach(&transport, &doc);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        on_sync(&doc.events(), move |state| s.lock().push(state));

        let hub = transport.hub();
        hub.emit("proj", ConnectionEvent::Synced);
        hub.emit("proj", ConnectionEvent::Closed { reason: None });
        hub.emit("proj", ConnectionEvent::Synced);
        hub.emit(
            "proj",
            ConnectionEvent::Error {
                message: "reset".into(),
            },
        );

        assert_eq!(
            *seen.lock(),
            vec![
                SyncState::Synced,
                SyncState::NotSynced,
                SyncState::Synced,
                SyncState::NotSynced
            ]
        );
    }
}
