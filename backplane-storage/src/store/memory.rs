//! In-process shared store.
//!
//! A [`MemoryStore`] plays the role of the cluster: it owns the entries and
//! fans native events out to the open connections. Each node is one client,
//! opened with [`MemoryStore::connect`]; components of the same node share
//! it through [`MemoryConnection::sibling`].
//!
//! Expiration is lazy. An entry past its deadline is removed, and reported
//! as expired, the next time any connection touches it or counts the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use backplane_core::StoreError;
use chrono::Utc;
use tracing::debug;

use super::fanout::{EventFanout, StoreEvent};
use super::{BackingStore, ListenerId, NativeRemoval, StoreEventListener, StoredEntry};

#[derive(Default)]
struct Shared {
    entries: RwLock<HashMap<String, StoredEntry>>,
    fanout: EventFanout,
}

/// Shared in-process store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection for a new client.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection::open(&self.shared, self.shared.fanout.new_client())
    }

    /// Drop an entry on the store's own initiative, reporting `reason`.
    ///
    /// Models server-side eviction and administrative removal.
    pub fn evict(&self, key: &str, reason: NativeRemoval) -> Result<bool, StoreError> {
        let removed = {
            let mut entries = self
                .shared
                .entries
                .write()
                .map_err(|_| StoreError::LockPoisoned)?;
            entries.remove(key).is_some()
        };
        if removed {
            self.shared
                .fanout
                .emit(StoreEvent::ItemRemoved(key.to_string(), reason));
        }
        Ok(removed)
    }
}

/// One node's connection to a [`MemoryStore`].
pub struct MemoryConnection {
    shared: Arc<Shared>,
    client: u64,
    connection_id: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn open(shared: &Arc<Shared>, client: u64) -> Self {
        Self {
            shared: Arc::clone(shared),
            client,
            connection_id: shared.fanout.open_connection(client),
            closed: AtomicBool::new(false),
        }
    }

    /// Open another connection for the same client.
    ///
    /// Items added through either connection are reported to the listeners
    /// of both.
    pub fn sibling(&self) -> Self {
        Self::open(&self.shared, self.client)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::ConnectionClosed);
        }
        Ok(())
    }

    fn emit_all(&self, events: Vec<StoreEvent>) {
        for event in events {
            self.shared.fanout.emit(event);
        }
    }

    /// Remove `key` if it has expired. Returns the expiry event to emit.
    fn expire_key(entries: &mut HashMap<String, StoredEntry>, key: &str) -> Option<StoreEvent> {
        let now = Utc::now();
        let expired = entries.get(key).is_some_and(|e| e.is_expired_at(now));
        if expired {
            entries.remove(key);
            debug!(key = %key, "Entry expired");
            return Some(StoreEvent::ItemRemoved(key.to_string(), NativeRemoval::Expired));
        }
        None
    }
}

#[async_trait]
impl BackingStore for MemoryConnection {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        self.ensure_open()?;
        let (found, expired) = {
            let mut entries = self
                .shared
                .entries
                .write()
                .map_err(|_| StoreError::LockPoisoned)?;
            let expired = Self::expire_key(&mut entries, key);
            let found = entries.get_mut(key).map(|entry| {
                if entry.sliding_window().is_some() {
                    entry.touched_at = Utc::now();
                }
                entry.clone()
            });
            (found, expired)
        };
        self.emit_all(expired.into_iter().collect());
        Ok(found)
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let (present, expired) = {
            let mut entries = self
                .shared
                .entries
                .write()
                .map_err(|_| StoreError::LockPoisoned)?;
            let expired = Self::expire_key(&mut entries, key);
            (entries.contains_key(key), expired)
        };
        self.emit_all(expired.into_iter().collect());
        Ok(present)
    }

    async fn insert_if_absent(&self, key: &str, entry: StoredEntry) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let (inserted, expired) = {
            let mut entries = self
                .shared
                .entries
                .write()
                .map_err(|_| StoreError::LockPoisoned)?;
            let expired = Self::expire_key(&mut entries, key);
            if entries.contains_key(key) {
                (false, expired)
            } else {
                entries.insert(key.to_string(), entry);
                (true, expired)
            }
        };

        let mut events: Vec<StoreEvent> = expired.into_iter().collect();
        if inserted {
            events.push(StoreEvent::ItemAdded {
                key: key.to_string(),
                client: self.client,
            });
        }
        self.emit_all(events);
        Ok(inserted)
    }

    async fn put(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        self.ensure_open()?;
        let (replaced, expired) = {
            let mut entries = self
                .shared
                .entries
                .write()
                .map_err(|_| StoreError::LockPoisoned)?;
            let expired = Self::expire_key(&mut entries, key);
            (entries.insert(key.to_string(), entry).is_some(), expired)
        };

        let mut events: Vec<StoreEvent> = expired.into_iter().collect();
        if !replaced {
            events.push(StoreEvent::ItemAdded {
                key: key.to_string(),
                client: self.client,
            });
        }
        self.emit_all(events);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let (removed, expired) = {
            let mut entries = self
                .shared
                .entries
                .write()
                .map_err(|_| StoreError::LockPoisoned)?;
            let expired = Self::expire_key(&mut entries, key);
            (entries.remove(key).is_some(), expired)
        };

        let mut events: Vec<StoreEvent> = expired.into_iter().collect();
        if removed {
            events.push(StoreEvent::ItemRemoved(key.to_string(), NativeRemoval::Removed));
        }
        self.emit_all(events);
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        {
            let mut entries = self
                .shared
                .entries
                .write()
                .map_err(|_| StoreError::LockPoisoned)?;
            entries.clear();
        }
        self.shared.fanout.emit(StoreEvent::Cleared);
        Ok(())
    }

    async fn remove_group(&self, group: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let removed = {
            let mut entries = self
                .shared
                .entries
                .write()
                .map_err(|_| StoreError::LockPoisoned)?;
            let before = entries.len();
            entries.retain(|_, entry| !entry.in_group(group));
            (before - entries.len()) as u64
        };
        self.shared
            .fanout
            .emit(StoreEvent::GroupCleared(group.to_string()));
        Ok(removed)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let (count, expired) = {
            let mut entries = self
                .shared
                .entries
                .write()
                .map_err(|_| StoreError::LockPoisoned)?;
            let now = Utc::now();
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                entries.remove(key);
            }
            (entries.len() as u64, stale)
        };

        self.emit_all(
            expired
                .into_iter()
                .map(|key| StoreEvent::ItemRemoved(key, NativeRemoval::Expired))
                .collect(),
        );
        Ok(count)
    }

    fn register_listener(
        &self,
        listener: Arc<dyn StoreEventListener>,
    ) -> Result<ListenerId, StoreError> {
        self.ensure_open()?;
        self.shared.fanout.register(self.connection_id, listener)
    }

    fn unregister_listener(&self, id: ListenerId) -> bool {
        self.shared.fanout.unregister(self.connection_id, id)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.fanout.close_connection(self.connection_id);
            debug!(connection = self.connection_id, "Memory store connection closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.fanout.close_connection(self.connection_id);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
