//! Backplane Storage
//!
//! The backing store contract, two reference stores (in-process and LMDB),
//! the translation of native store events into change events, and the
//! typed cache handle.

pub mod events;
pub mod handle;
pub mod store;

pub use events::{map_removal_reason, ChangeEvent, ChangeEventSource, ChangeSink};
pub use handle::CacheHandle;
pub use store::{
    BackingStore, ListenerId, LmdbConnection, LmdbStore, MemoryConnection, MemoryStore,
    NativeRemoval, StoreEventListener, StoredEntry,
};
