//! LMDB-backed shared store.
//!
//! Uses heed to keep entries in a memory-mapped LMDB environment. One
//! [`LmdbStore`] owns the environment; every [`LmdbConnection`] opened from
//! it shares the environment and the native event fan-out.
//!
//! # Record layout
//!
//! `[touched_at: 8 bytes LE millis][json record]`. The JSON record holds the
//! value bytes, group, expiration policy and deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backplane_core::{Expiration, StoreConfig, StoreError, Timestamp};
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::fanout::{EventFanout, StoreEvent};
use super::{BackingStore, ListenerId, NativeRemoval, StoreEventListener, StoredEntry};

fn txn_error(e: heed::Error) -> StoreError {
    StoreError::TransactionFailed {
        reason: e.to_string(),
    }
}

#[derive(Serialize)]
struct RecordRef<'a> {
    group: Option<&'a str>,
    expiration: Expiration,
    expires_at: Option<Timestamp>,
    value: &'a [u8],
}

#[derive(Deserialize)]
struct Record {
    group: Option<String>,
    expiration: Expiration,
    expires_at: Option<Timestamp>,
    value: Vec<u8>,
}

fn encode_record(key: &str, entry: &StoredEntry) -> Result<Vec<u8>, StoreError> {
    let body = serde_json::to_vec(&RecordRef {
        group: entry.group.as_deref(),
        expiration: entry.expiration,
        expires_at: entry.expires_at,
        value: &entry.value,
    })
    .map_err(|e| StoreError::WriteFailed {
        key: key.to_string(),
        reason: e.to_string(),
    })?;

    let mut full_bytes = Vec::with_capacity(8 + body.len());
    full_bytes.extend_from_slice(&entry.touched_at.timestamp_millis().to_le_bytes());
    full_bytes.extend_from_slice(&body);
    Ok(full_bytes)
}

fn decode_record(key: &str, bytes: &[u8]) -> Result<StoredEntry, StoreError> {
    let corrupt = |reason: String| StoreError::ReadFailed {
        key: key.to_string(),
        reason,
    };
    if bytes.len() < 8 {
        return Err(corrupt("record shorter than timestamp".to_string()));
    }

    let timestamp_bytes: [u8; 8] = bytes[0..8]
        .try_into()
        .map_err(|_| corrupt("invalid timestamp".to_string()))?;
    let touched_at = DateTime::from_timestamp_millis(i64::from_le_bytes(timestamp_bytes))
        .unwrap_or_else(Utc::now);

    let record: Record =
        serde_json::from_slice(&bytes[8..]).map_err(|e| corrupt(e.to_string()))?;

    Ok(StoredEntry {
        value: record.value,
        group: record.group,
        expiration: record.expiration,
        expires_at: record.expires_at,
        touched_at,
    })
}

struct Shared {
    env: Env,
    db: Database<Bytes, Bytes>,
    fanout: EventFanout,
}

/// LMDB environment shared by all connections.
#[derive(Clone)]
pub struct LmdbStore {
    shared: Arc<Shared>,
}

impl LmdbStore {
    /// Open (or create) the environment described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        config
            .validate()
            .map_err(|e| StoreError::TransactionFailed {
                reason: e.to_string(),
            })?;
        std::fs::create_dir_all(&config.path).map_err(|e| StoreError::TransactionFailed {
            reason: format!("cannot create {}: {e}", config.path.display()),
        })?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(&config.path)
        }
        .map_err(txn_error)?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;

        info!(path = %config.path.display(), max_size_mb = config.max_size_mb, "LMDB store opened");

        Ok(Self {
            shared: Arc::new(Shared {
                env,
                db,
                fanout: EventFanout::default(),
            }),
        })
    }

    /// Open a connection for a new client.
    pub fn connect(&self) -> LmdbConnection {
        LmdbConnection::open(&self.shared, self.shared.fanout.new_client())
    }
}

/// One node's connection to an [`LmdbStore`].
pub struct LmdbConnection {
    shared: Arc<Shared>,
    client: u64,
    connection_id: u64,
    closed: AtomicBool,
}

impl LmdbConnection {
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

    /// Read `key` inside a write transaction, dropping it if expired and
    /// refreshing its sliding window when `touch` is set.
    fn read_live(
        &self,
        key: &str,
        touch: bool,
    ) -> Result<(Option<StoredEntry>, Option<StoreEvent>), StoreError> {
        let Shared { env, db, .. } = self.shared.as_ref();
        let mut wtxn = env.write_txn().map_err(txn_error)?;

        let current = match db.get(&wtxn, key.as_bytes()).map_err(txn_error)? {
            Some(bytes) => Some(decode_record(key, bytes)?),
            None => None,
        };

        let Some(mut entry) = current else {
            wtxn.abort();
            return Ok((None, None));
        };

        let now = Utc::now();
        if entry.is_expired_at(now) {
            db.delete(&mut wtxn, key.as_bytes()).map_err(txn_error)?;
            wtxn.commit().map_err(txn_error)?;
            debug!(key = %key, "Entry expired");
            return Ok((
                None,
                Some(StoreEvent::ItemRemoved(key.to_string(), NativeRemoval::Expired)),
            ));
        }

        if touch && entry.sliding_window().is_some() {
            entry.touched_at = now;
            db.put(&mut wtxn, key.as_bytes(), &encode_record(key, &entry)?)
                .map_err(txn_error)?;
            wtxn.commit().map_err(txn_error)?;
        } else {
            wtxn.abort();
        }
        Ok((Some(entry), None))
    }

    fn write_entry(
        &self,
        key: &str,
        entry: &StoredEntry,
        only_if_absent: bool,
    ) -> Result<(bool, Vec<StoreEvent>), StoreError> {
        let Shared { env, db, .. } = self.shared.as_ref();
        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let mut events = Vec::new();

        let existing = match db.get(&wtxn, key.as_bytes()).map_err(txn_error)? {
            Some(bytes) => Some(decode_record(key, bytes)?),
            None => None,
        };
        let live = match existing {
            Some(found) if found.is_expired_at(Utc::now()) => {
                db.delete(&mut wtxn, key.as_bytes()).map_err(txn_error)?;
                events.push(StoreEvent::ItemRemoved(
                    key.to_string(),
                    NativeRemoval::Expired,
                ));
                false
            }
            Some(_) => true,
            None => false,
        };

        if live && only_if_absent {
            wtxn.commit().map_err(txn_error)?;
            return Ok((false, events));
        }

        db.put(&mut wtxn, key.as_bytes(), &encode_record(key, entry)?)
            .map_err(|e| StoreError::WriteFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        wtxn.commit().map_err(txn_error)?;

        if !live {
            events.push(StoreEvent::ItemAdded {
                key: key.to_string(),
                client: self.client,
            });
        }
        Ok((true, events))
    }

    fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        let Shared { env, db, .. } = self.shared.as_ref();
        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let deleted = db.delete(&mut wtxn, key.as_bytes()).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(deleted)
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        let Shared { env, db, .. } = self.shared.as_ref();
        let mut wtxn = env.write_txn().map_err(txn_error)?;
        db.clear(&mut wtxn).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }

    /// Collect keys whose records satisfy `pred`, then delete them in one
    /// write transaction.
    fn delete_matching<F>(&self, pred: F) -> Result<Vec<String>, StoreError>
    where
        F: Fn(&str, &StoredEntry) -> bool,
    {
        let Shared { env, db, .. } = self.shared.as_ref();

        let doomed = {
            let rtxn = env.read_txn().map_err(txn_error)?;
            let mut keys = Vec::new();
            for result in db.iter(&rtxn).map_err(txn_error)? {
                let Ok((raw_key, bytes)) = result else {
                    continue;
                };
                let Ok(key) = std::str::from_utf8(raw_key) else {
                    continue;
                };
                match decode_record(key, bytes) {
                    Ok(entry) if pred(key, &entry) => keys.push(key.to_string()),
                    Ok(_) => {}
                    Err(e) => debug!(key = %key, error = %e, "Skipping unreadable record"),
                }
            }
            keys
        };

        if doomed.is_empty() {
            return Ok(doomed);
        }

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        for key in &doomed {
            db.delete(&mut wtxn, key.as_bytes()).map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(doomed)
    }

    fn entry_count(&self) -> Result<u64, StoreError> {
        let Shared { env, db, .. } = self.shared.as_ref();
        let rtxn = env.read_txn().map_err(txn_error)?;
        db.len(&rtxn).map_err(txn_error)
    }
}

#[async_trait]
impl BackingStore for LmdbConnection {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        self.ensure_open()?;
        let (entry, expired) = self.read_live(key, true)?;
        self.emit_all(expired.into_iter().collect());
        Ok(entry)
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let (entry, expired) = self.read_live(key, false)?;
        self.emit_all(expired.into_iter().collect());
        Ok(entry.is_some())
    }

    async fn insert_if_absent(&self, key: &str, entry: StoredEntry) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let (written, events) = self.write_entry(key, &entry, true)?;
        self.emit_all(events);
        Ok(written)
    }

    async fn put(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        self.ensure_open()?;
        let (_, events) = self.write_entry(key, &entry, false)?;
        self.emit_all(events);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let removed = self.delete_key(key)?;
        if removed {
            self.shared.fanout.emit(StoreEvent::ItemRemoved(
                key.to_string(),
                NativeRemoval::Removed,
            ));
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.clear_all()?;
        self.shared.fanout.emit(StoreEvent::Cleared);
        Ok(())
    }

    async fn remove_group(&self, group: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let removed = self.delete_matching(|_, entry| entry.in_group(group))?;
        self.shared
            .fanout
            .emit(StoreEvent::GroupCleared(group.to_string()));
        Ok(removed.len() as u64)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let now = Utc::now();
        let expired = self.delete_matching(|_, entry| entry.is_expired_at(now))?;
        self.emit_all(
            expired
                .into_iter()
                .map(|key| StoreEvent::ItemRemoved(key, NativeRemoval::Expired))
                .collect(),
        );
        self.entry_count()
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
            debug!(connection = self.connection_id, "LMDB store connection closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for LmdbConnection {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.fanout.close_connection(self.connection_id);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl StoreEventListener for Recorder {
        fn on_item_added(&self, flat_key: &str) {
            self.events.lock().unwrap().push(format!("added:{flat_key}"));
        }

        fn on_item_removed(&self, flat_key: &str, reason: &NativeRemoval) {
            self.events
                .lock()
                .unwrap()
                .push(format!("removed:{flat_key}:{reason:?}"));
        }

        fn on_cleared(&self) {
            self.events.lock().unwrap().push("cleared".to_string());
        }

        fn on_group_cleared(&self, group: &str) {
            self.events.lock().unwrap().push(format!("group:{group}"));
        }
    }

    fn create_test_store() -> (LmdbStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = StoreConfig::new(temp_dir.path()).with_max_size_mb(10);
        let store = LmdbStore::open(&config).expect("Failed to open store");
        (store, temp_dir)
    }

    #[test]
    fn test_record_layout_preserves_metadata() {
        let entry = StoredEntry::new(
            b"{\"n\":1}".to_vec(),
            Some("orders".to_string()),
            Expiration::Absolute(Duration::from_secs(30)),
        );
        let bytes = encode_record("orders@1", &entry).unwrap();
        assert_eq!(
            &bytes[0..8],
            &entry.touched_at.timestamp_millis().to_le_bytes()[..]
        );
        let decoded = decode_record("orders@1", &bytes).unwrap();

        assert_eq!(decoded.value, entry.value);
        assert_eq!(decoded.group, entry.group);
        assert_eq!(decoded.expiration, entry.expiration);
        assert_eq!(
            decoded.expires_at.map(|t| t.timestamp_millis()),
            entry.expires_at.map(|t| t.timestamp_millis())
        );
    }

    #[test]
    fn test_corrupt_record_is_rejected() {
        let err = decode_record("k", &[0u8; 5]).unwrap_err();
        assert!(matches!(err, StoreError::ReadFailed { .. }));

        let mut bytes = 0i64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{\"group\":null}");
        let err = decode_record("k", &bytes).unwrap_err();
        assert!(matches!(err, StoreError::ReadFailed { .. }));
    }

    #[tokio::test]
    async fn test_dropped_connection_releases_listeners() {
        let (store, _dir) = create_test_store();
        let conn = store.connect();
        conn.register_listener(Arc::new(Recorder::default())).unwrap();
        assert_eq!(store.shared.fanout.connection_count(), 1);

        drop(conn);
        assert_eq!(store.shared.fanout.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let (store, _dir) = create_test_store();
        let conn = store.connect();

        let entry = StoredEntry::new(b"v".to_vec(), None, Expiration::None);
        assert!(conn.insert_if_absent("k", entry.clone()).await.unwrap());
        assert!(!conn.insert_if_absent("k", entry).await.unwrap());
        assert!(conn.contains("k").await.unwrap());
        assert_eq!(conn.get("k").await.unwrap().unwrap().value, b"v".to_vec());

        assert!(conn.remove("k").await.unwrap());
        assert!(!conn.remove("k").await.unwrap());
        assert!(conn.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_removal_and_events() {
        let (store, _dir) = create_test_store();
        let a = store.connect();
        let b = a.sibling();
        let peer = store.connect();
        let seen = Arc::new(Recorder::default());
        let seen_peer = Arc::new(Recorder::default());
        b.register_listener(seen.clone()).unwrap();
        peer.register_listener(seen_peer.clone()).unwrap();

        for (key, group) in [("g1@a", "g1"), ("g1@b", "g1"), ("g2@a", "g2")] {
            let entry = StoredEntry::new(b"v".to_vec(), Some(group.to_string()), Expiration::None);
            a.put(key, entry).await.unwrap();
        }

        assert_eq!(a.remove_group("g1").await.unwrap(), 2);
        assert_eq!(a.count().await.unwrap(), 1);

        a.clear().await.unwrap();
        assert_eq!(a.count().await.unwrap(), 0);

        let events = seen.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "added:g1@a".to_string(),
                "added:g1@b".to_string(),
                "added:g2@a".to_string(),
                "group:g1".to_string(),
                "cleared".to_string(),
            ]
        );
        assert_eq!(
            seen_peer.events.lock().unwrap().clone(),
            vec!["group:g1".to_string(), "cleared".to_string()]
        );
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped_on_read() {
        let (store, _dir) = create_test_store();
        let conn = store.connect();
        let seen = Arc::new(Recorder::default());
        conn.register_listener(seen.clone()).unwrap();

        let entry = StoredEntry::new(
            b"v".to_vec(),
            None,
            Expiration::Absolute(Duration::from_millis(20)),
        );
        conn.put("k", entry).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!conn.contains("k").await.unwrap());
        assert_eq!(
            seen.events.lock().unwrap().last().cloned(),
            Some("removed:k:Expired".to_string())
        );
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (store, _dir) = create_test_store();
        let conn = store.connect();
        conn.close().await;
        assert!(conn.is_closed());
        assert_eq!(conn.count().await.unwrap_err(), StoreError::ConnectionClosed);

        let other = store.connect();
        assert_eq!(other.count().await.unwrap(), 0);
    }
}
