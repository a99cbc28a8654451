use std::fmt;
use std::sync::Arc;

use crate::crdt::{ReplicatedDocument, SyncState};
use crate::events::EventEmitter;

/// Separator between a parent channel and a sub-document guid
pub const ROOM_SEPARATOR: &str = "--";

pub const EVENT_SYNC: &str = "sync";
pub const EVENT_CONNECTION_CLOSE: &str = "connection-close";
pub const EVENT_CONNECTION_ERROR: &str = "connection-error";

/// Channel name of a sub-document nested under `parent`
pub fn subdoc_room(parent: &str, guid: &str) -> String {
    format!("{parent}{ROOM_SEPARATOR}{guid}")
}

/// Where a document's updates are exchanged
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub url: String,
    pub room: String,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            room: room.into(),
        }
    }

    /// Same server, channel derived for the sub-document `guid`
    pub fn child(&self, guid: &str) -> Self {
        Self {
            url: self.url.clone(),
            room: subdoc_room(&self.room, guid),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.url, self.room)
    }
}

/// Low-level connection events, one named channel each
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Initial state exchange with the server finished
    Synced,
    Closed { reason: Option<String> },
    Error { message: String },
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Synced => EVENT_SYNC,
            ConnectionEvent::Closed { .. } => EVENT_CONNECTION_CLOSE,
            ConnectionEvent::Error { .. } => EVENT_CONNECTION_ERROR,
        }
    }

    /// What this transition means for the document's sync signal
    pub fn sync_state(&self) -> SyncState {
        match self {
            ConnectionEvent::Synced => SyncState::Synced,
            ConnectionEvent::Closed { .. } | ConnectionEvent::Error { .. } => SyncState::NotSynced,
        }
    }
}

pub type ConnectionEvents = EventEmitter<ConnectionEvent>;

/// Publish `event` on its named channel
pub fn emit_connection_event(events: &ConnectionEvents, event: ConnectionEvent) {
    events.emit(event.name(), &event);
}

/// One live (or connecting) link between a document and a server channel
pub trait Connection: Send + Sync + 'static {
    fn endpoint(&self) -> &Endpoint;

    /// Start connecting. Reconnection after drops is the connection's business.
    fn connect(&self);

    /// Close the link and stop reconnecting. Safe mid-handshake.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn events(&self) -> &ConnectionEvents;
}

/// Factory for connections of one kind
pub trait Transport: Send + Sync + 'static {
    type Document: ReplicatedDocument;
    /// Shared presence state handed to every connection unchanged
    type Presence: Send + Sync + 'static;
    type Connection: Connection;

    /// Create a connection without connecting it yet
    fn open(
        &self,
        endpoint: Endpoint,
        doc: &Self::Document,
        presence: Arc<Self::Presence>,
    ) -> Self::Connection;
}
