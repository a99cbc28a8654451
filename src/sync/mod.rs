pub mod memory;
pub mod provider;
pub mod remote;
pub mod transport;

pub use memory::{MemoryConnection, MemoryHub, MemoryTransport};
pub use provider::{attach_provider, ConnectionNode};
pub use remote::{WebsocketConnection, WebsocketTransport};
pub use transport::{
    subdoc_room, Connection, ConnectionEvent, ConnectionEvents, Endpoint, Transport,
    ROOM_SEPARATOR,
};

// Connection trees: one transport connection per loaded document, channel
// names derived from the parent's, and the connection state republished on
// each document as a boolean `sync` event.
