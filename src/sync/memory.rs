//! In-process transport.
//!
//! Connections never touch the network. Every connection opened through a
//! [`MemoryTransport`] is recorded in its [`MemoryHub`], where tests and
//! hosts can look it up by channel name and fire connection events by hand.

use parking_lot::Mutex;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::transport::{
    emit_connection_event, Connection, ConnectionEvent, ConnectionEvents, Endpoint, Transport,
};
use crate::crdt::ReplicatedDocument;

struct ConnectionState {
    endpoint: Endpoint,
    doc_guid: Arc<str>,
    presence: Arc<dyn Any + Send + Sync>,
    events: ConnectionEvents,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryConnection {
    state: Arc<ConnectionState>,
}

impl MemoryConnection {
    pub fn doc_guid(&self) -> Arc<str> {
        self.state.doc_guid.clone()
    }

    /// Presence this connection was opened with, if it is a `P`
    pub fn presence<P: Any + Send + Sync>(&self) -> Option<Arc<P>> {
        self.state.presence.clone().downcast::<P>().ok()
    }

    pub fn connect_calls(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Fire a connection event as the network would
    pub fn emit(&self, event: ConnectionEvent) {
        emit_connection_event(&self.state.events, event);
    }

    pub fn same_connection(&self, other: &MemoryConnection) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Connection for MemoryConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.state.endpoint
    }

    fn connect(&self) {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(true, Ordering::SeqCst);
    }

    fn disconnect(&self) {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.state.connected.swap(false, Ordering::SeqCst) {
            self.emit(ConnectionEvent::Closed {
                reason: Some("disconnected".into()),
            });
        }
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> &ConnectionEvents {
        &self.state.events
    }
}

/// Registry of every connection a [`MemoryTransport`] opened, in order
#[derive(Clone, Default)]
pub struct MemoryHub {
    opened: Arc<Mutex<Vec<MemoryConnection>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently opened connection on `room`
    pub fn connection(&self, room: &str) -> Option<MemoryConnection> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|conn| conn.endpoint().room == room)
            .cloned()
    }

    /// How many connections were ever opened on `room`
    pub fn open_count(&self, room: &str) -> usize {
        self.opened
            .lock()
            .iter()
            .filter(|conn| conn.endpoint().room == room)
            .count()
    }

    /// Channels with a connected connection, sorted
    pub fn live_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .opened
            .lock()
            .iter()
            .filter(|conn| conn.is_connected())
            .map(|conn| conn.endpoint().room.clone())
            .collect();
        rooms.sort();
        rooms
    }

    pub fn live_count(&self, room: &str) -> usize {
        self.opened
            .lock()
            .iter()
            .filter(|conn| conn.is_connected() && conn.endpoint().room == room)
            .count()
    }

    /// Fire `event` on the latest connection for `room`. Returns false if none exists.
    pub fn emit(&self, room: &str, event: ConnectionEvent) -> bool {
        match self.connection(room) {
            Some(conn) => {
                conn.emit(event);
                true
            }
            None => false,
        }
    }

    fn record(&self, conn: MemoryConnection) {
        self.opened.lock().push(conn);
    }
}

/// Transport whose connections live in a [`MemoryHub`]
pub struct MemoryTransport<D, P = ()> {
    hub: MemoryHub,
    _marker: PhantomData<fn() -> (D, P)>,
}

impl<D, P> MemoryTransport<D, P> {
    pub fn new() -> Self {
        Self::with_hub(MemoryHub::new())
    }

    pub fn with_hub(hub: MemoryHub) -> Self {
        Self {
            hub,
            _marker: PhantomData,
        }
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl<D, P> Default for MemoryTransport<D, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, P> Transport for MemoryTransport<D, P>
where
    D: ReplicatedDocument,
    P: Send + Sync + 'static,
{
    type Document = D;
    type Presence = P;
    type Connection = MemoryConnection;

    fn open(&self, endpoint: Endpoint, doc: &D, presence: Arc<P>) -> MemoryConnection {
        let conn = MemoryConnection {
            state: Arc::new(ConnectionState {
                endpoint,
                doc_guid: doc.doc_guid(),
                presence,
                events: ConnectionEvents::new(),
                connected: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
            }),
        };
        self.hub.record(conn.clone());
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::MemoryDoc;

    #[test]
    fn hub_tracks_opened_and_live_connections() {
        let transport: MemoryTransport<MemoryDoc> = MemoryTransport::new();
        let doc = MemoryDoc::with_guid("d");
        let conn = transport.open(Endpoint::new("ws://hub", "room"), &doc, Arc::new(()));

        assert_eq!(transport.hub().open_count("room"), 1);
        assert!(transport.hub().live_rooms().is_empty());

        conn.connect();
        assert_eq!(transport.hub().live_rooms(), vec!["room".to_string()]);
        assert_eq!(conn.doc_guid().as_ref(), "d");

        conn.disconnect();
        assert_eq!(transport.hub().live_count("room"), 0);
        assert_eq!(conn.disconnect_calls(), 1);
    }

    #[test]
    fn disconnect_of_live_connection_reports_close() {
        let transport: MemoryTransport<MemoryDoc, String> = MemoryTransport::new();
        let conn = transport.open(
            Endpoint::new("ws://hub", "room"),
            &MemoryDoc::new(),
            Arc::new("cursor".to_string()),
        );
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        conn.events().on("connection-close", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        conn.disconnect();
        conn.connect();
        conn.disconnect();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.presence::<String>().as_deref().map(String::as_str), Some("cursor"));
        assert!(conn.presence::<u32>().is_none());
    }
}
