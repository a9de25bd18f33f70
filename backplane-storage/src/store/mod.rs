//! Backing store contract.
//!
//! A backing store is a flat-key value store shared by several nodes. Each
//! node talks to it through its own connection. Besides keyed reads and
//! writes a store must report native change events (item added, item removed,
//! cleared) to listeners registered on a connection.
//!
//! # Connection ownership
//!
//! Whoever opened a connection closes it. Components that only borrow a
//! connection never call [`BackingStore::close`].

mod fanout;
pub mod lmdb;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backplane_core::{Expiration, StoreError, Timestamp};
use chrono::Utc;

pub use lmdb::{LmdbConnection, LmdbStore};
pub use memory::{MemoryConnection, MemoryStore};

/// Handle returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Native removal reason as the store reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeRemoval {
    /// A client removed the entry.
    Removed,
    /// The expiration deadline passed.
    Expired,
    /// The store evicted the entry to reclaim space.
    Underused,
    /// A reason this crate has no mapping for, with the store's own description.
    Other(String),
}

/// Callbacks a store invokes for native change events.
///
/// Keys are flat store keys. Callbacks run on the store's event context
/// (for the in-process stores: the thread that performed the mutation) and
/// must not block.
pub trait StoreEventListener: Send + Sync {
    fn on_item_added(&self, flat_key: &str);

    fn on_item_removed(&self, flat_key: &str, reason: &NativeRemoval);

    fn on_cleared(&self);

    /// Every entry tagged with `group` was removed in one operation.
    fn on_group_cleared(&self, group: &str);
}

/// A stored value with its store-level metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    /// Serialized value.
    pub value: Vec<u8>,
    /// Group (region) tag used for bulk removal.
    pub group: Option<String>,
    /// Policy the entry was written with.
    pub expiration: Expiration,
    /// Absolute deadline, set for [`Expiration::Absolute`].
    pub expires_at: Option<Timestamp>,
    /// Last write or, for sliding entries, last access.
    pub touched_at: Timestamp,
}

impl StoredEntry {
    /// Build an entry, translating the expiration policy.
    ///
    /// Absolute expirations become a deadline of now plus the timeout.
    /// Sliding expirations keep the timeout and let the store push the
    /// deadline forward on every read.
    pub fn new(value: Vec<u8>, group: Option<String>, expiration: Expiration) -> Self {
        let now = Utc::now();
        let expires_at = match expiration {
            Expiration::Absolute(timeout) => chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|t| now.checked_add_signed(t)),
            Expiration::None | Expiration::Sliding(_) => None,
        };
        Self {
            value,
            group,
            expiration,
            expires_at,
            touched_at: now,
        }
    }

    /// Sliding window, if the entry has one.
    pub fn sliding_window(&self) -> Option<Duration> {
        match self.expiration {
            Expiration::Sliding(window) => Some(window),
            _ => None,
        }
    }

    /// Whether the entry is past its deadline at `now`.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        if let Some(deadline) = self.expires_at {
            if now >= deadline {
                return true;
            }
        }
        if let Some(window) = self.sliding_window() {
            let idle = now
                .signed_duration_since(self.touched_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            return idle >= window;
        }
        false
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.group.as_deref() == Some(group)
    }
}

/// Connection to a flat-key backing store.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Read an entry. Sliding entries have their window refreshed.
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError>;

    /// Existence check. Does not count as an access.
    async fn contains(&self, key: &str) -> Result<bool, StoreError>;

    /// Write an entry unless the key is already present. Returns whether it
    /// was written.
    async fn insert_if_absent(&self, key: &str, entry: StoredEntry) -> Result<bool, StoreError>;

    /// Write an entry, replacing any existing one.
    async fn put(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError>;

    /// Remove an entry. Returns whether one was present.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Remove every entry tagged with `group`. Returns how many were removed.
    async fn remove_group(&self, group: &str) -> Result<u64, StoreError>;

    /// Number of live entries.
    async fn count(&self) -> Result<u64, StoreError>;

    /// Register a listener for native events.
    fn register_listener(
        &self,
        listener: Arc<dyn StoreEventListener>,
    ) -> Result<ListenerId, StoreError>;

    /// Remove a listener. Returns whether it was registered.
    fn unregister_listener(&self, id: ListenerId) -> bool;

    /// Close the connection and drop its listeners. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_expiration_sets_deadline() {
        let entry = StoredEntry::new(
            b"1".to_vec(),
            None,
            Expiration::Absolute(Duration::from_secs(10)),
        );
        let deadline = entry.expires_at.expect("absolute entries carry a deadline");
        let ahead = deadline.signed_duration_since(entry.touched_at);
        assert_eq!(ahead.num_seconds(), 10);
        assert!(!entry.is_expired_at(entry.touched_at));
        assert!(entry.is_expired_at(deadline));
    }

    #[test]
    fn test_sliding_expiration_keeps_timeout() {
        let entry = StoredEntry::new(
            b"1".to_vec(),
            None,
            Expiration::Sliding(Duration::from_secs(2)),
        );
        assert_eq!(entry.expires_at, None);
        assert_eq!(entry.sliding_window(), Some(Duration::from_secs(2)));

        let later = entry.touched_at + chrono::Duration::seconds(3);
        assert!(entry.is_expired_at(later));
    }

    #[test]
    fn test_no_expiration_never_expires() {
        let entry = StoredEntry::new(b"1".to_vec(), Some("g".to_string()), Expiration::None);
        let far = entry.touched_at + chrono::Duration::days(365);
        assert!(!entry.is_expired_at(far));
        assert!(entry.in_group("g"));
        assert!(!entry.in_group("h"));
    }
}
