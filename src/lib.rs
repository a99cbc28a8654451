//! # DocSync - Live Connection Trees for Replicated Documents
//!
//! Keeps a tree of `yrs` documents connected to a sync server, one channel
//! per loaded document, and bridges document changes into reactive scopes.
//!
//! ## Features
//!
//! - **Recursive attachment**: sub-documents get their own connection as soon
//!   as they load, on channel `<parent>--<guid>`, and lose it when removed
//! - **Sync signal**: connection state is republished on every document as a
//!   boolean `sync` event, so consumers never touch the connection
//! - **Exact teardown**: disposing a node closes its whole subtree once
//! - **Scoped observers**: `observe_yjs` / `observe_yjs_deep` tie observer
//!   registrations to a reactive scope
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use docsync::crdt::{on_sync, ReplicatedDocument};
//! use docsync::error::RetryPolicy;
//! use docsync::sync::{attach_provider, WebsocketTransport};
//! use yrs::sync::Awareness;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(WebsocketTransport::new(RetryPolicy::default())?);
//!     let doc = yrs::Doc::new();
//!     on_sync(&doc.events(), |state| println!("root synced: {}", state.is_synced()));
//!
//!     let presence = Arc::new(Awareness::new(doc.clone()));
//!     let root = attach_provider(transport, "ws://localhost:1234", "proj", doc, presence)?;
//!     tokio::signal::ctrl_c().await?;
//!     root.dispose();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crdt;
pub mod error;
pub mod events;
pub mod logging;
pub mod reactive;
pub mod sync;

// Re-export main types for library consumers
pub use config::SyncConfig;
pub use crdt::{ReplicatedDocument, SubdocsChange, SyncState};
pub use events::{EventEmitter, ListenerId};
pub use reactive::{bind_watch, observe_yjs, observe_yjs_deep, ScopedObservation};
pub use sync::{attach_provider, ConnectionEvent, ConnectionNode, Endpoint, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
