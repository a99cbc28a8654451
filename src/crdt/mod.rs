pub mod document;
pub mod memory;

pub use document::{
    emit_sync, on_sync, prune_idle_doc_events, DocEvents, ReplicatedDocument,
    SubdocsChange, SyncState, SYNC_EVENT,
};
pub use memory::MemoryDoc;
