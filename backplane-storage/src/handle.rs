//! Cache handle over a flat-key backing store.
//!
//! The handle encodes `(key, region)` addresses into flat keys, serializes
//! values with serde_json, and performs the store operation. It keeps no
//! values of its own: change notifications surface through the store's
//! native events, not through the handle.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use backplane_core::{
    AtDelimitedCodec, BackplaneResult, CacheAddress, CacheItem, KeyCodec, StoreError,
    ValidationError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::store::{BackingStore, StoredEntry};

/// Typed cache handle owning one store connection.
pub struct CacheHandle<T, S: BackingStore> {
    store: S,
    codec: Arc<dyn KeyCodec>,
    disposed: AtomicBool,
    _value: PhantomData<fn() -> T>,
}

impl<T, S> CacheHandle<T, S>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    S: BackingStore,
{
    /// Wrap a connection using the `region@key` codec.
    pub fn new(store: S) -> Self {
        Self::with_codec(store, Arc::new(AtDelimitedCodec))
    }

    pub fn with_codec(store: S, codec: Arc<dyn KeyCodec>) -> Self {
        Self {
            store,
            codec,
            disposed: AtomicBool::new(false),
            _value: PhantomData,
        }
    }

    /// The underlying connection.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn flat_key(&self, key: &str, region: Option<&str>) -> BackplaneResult<(CacheAddress, String)> {
        let address = CacheAddress::from_parts(key, region)?;
        let flat = self.codec.encode(&address);
        Ok((address, flat))
    }

    fn to_entry(&self, flat: &str, item: &CacheItem<T>) -> BackplaneResult<StoredEntry> {
        let value = serde_json::to_vec(item.value()).map_err(|e| StoreError::ValueCodec {
            key: flat.to_string(),
            reason: e.to_string(),
        })?;
        Ok(StoredEntry::new(
            value,
            item.region().map(str::to_string),
            item.expiration(),
        ))
    }

    /// Add an item unless its address is already taken.
    ///
    /// Returns `false` for a duplicate. A store failure is logged and also
    /// reported as `false`.
    pub async fn add(&self, item: &CacheItem<T>) -> BackplaneResult<bool> {
        let flat = self.codec.encode(item.address());
        let entry = self.to_entry(&flat, item)?;

        match self.store.insert_if_absent(&flat, entry).await {
            Ok(true) => {
                debug!(key = %flat, "Item added");
                Ok(true)
            }
            Ok(false) => {
                debug!(key = %flat, "Item already present, not added");
                Ok(false)
            }
            Err(e) => {
                error!(key = %flat, error = %e, "Add failed");
                Ok(false)
            }
        }
    }

    /// Write an item, replacing any existing value.
    pub async fn put(&self, item: &CacheItem<T>) -> BackplaneResult<()> {
        let flat = self.codec.encode(item.address());
        let entry = self.to_entry(&flat, item)?;
        self.store.put(&flat, entry).await?;
        debug!(key = %flat, "Item put");
        Ok(())
    }

    /// Read an item back with its expiration policy.
    ///
    /// `created_at` of the returned item is the store's last write time, or
    /// the last access time for sliding entries.
    pub async fn get(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> BackplaneResult<Option<CacheItem<T>>> {
        let (address, flat) = self.flat_key(key, region)?;
        let Some(entry) = self.store.get(&flat).await? else {
            return Ok(None);
        };

        let value: T = serde_json::from_slice(&entry.value).map_err(|e| StoreError::ValueCodec {
            key: flat.clone(),
            reason: e.to_string(),
        })?;
        let item = CacheItem::at(address, value)
            .with_expiration(entry.expiration)?
            .with_created_at(entry.touched_at);
        Ok(Some(item))
    }

    pub async fn get_value(&self, key: &str, region: Option<&str>) -> BackplaneResult<Option<T>> {
        Ok(self.get(key, region).await?.map(CacheItem::into_value))
    }

    /// Remove an item. Returns whether one was present.
    pub async fn remove(&self, key: &str, region: Option<&str>) -> BackplaneResult<bool> {
        let (_, flat) = self.flat_key(key, region)?;
        Ok(self.store.remove(&flat).await?)
    }

    pub async fn exists(&self, key: &str, region: Option<&str>) -> BackplaneResult<bool> {
        let (_, flat) = self.flat_key(key, region)?;
        Ok(self.store.contains(&flat).await?)
    }

    /// Remove every item from the store.
    pub async fn clear(&self) -> BackplaneResult<()> {
        self.store.clear().await?;
        Ok(())
    }

    /// Remove every item of `region`. Returns how many were removed.
    pub async fn clear_region(&self, region: &str) -> BackplaneResult<u64> {
        if region.trim().is_empty() {
            return Err(ValidationError::missing("region").into());
        }
        Ok(self.store.remove_group(region).await?)
    }

    /// Number of items currently in the store.
    pub async fn count(&self) -> BackplaneResult<u64> {
        Ok(self.store.count().await?)
    }

    /// Close the owned connection. Idempotent.
    pub async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.store.close().await;
            debug!("Cache handle disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use backplane_core::{BackplaneError, Expiration};
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        total: f64,
    }

    fn handle(store: &MemoryStore) -> CacheHandle<Order, crate::store::MemoryConnection> {
        CacheHandle::new(store.connect())
    }

    fn order(id: u32) -> Order {
        Order {
            id,
            total: id as f64 * 1.5,
        }
    }

    #[tokio::test]
    async fn test_add_twice_keeps_first_value() {
        let store = MemoryStore::new();
        let cache = handle(&store);

        assert!(cache.add(&CacheItem::new("K", order(1)).unwrap()).await.unwrap());
        assert!(!cache.add(&CacheItem::new("K", order(2)).unwrap()).await.unwrap());
        assert_eq!(cache.get_value("K", None).await.unwrap(), Some(order(1)));
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = MemoryStore::new();
        let cache = handle(&store);

        cache.put(&CacheItem::new("K", order(1)).unwrap()).await.unwrap();
        cache.put(&CacheItem::new("K", order(2)).unwrap()).await.unwrap();
        assert_eq!(cache.get_value("K", None).await.unwrap(), Some(order(2)));
        assert_eq!(cache.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_region_is_part_of_the_address() {
        let store = MemoryStore::new();
        let cache = handle(&store);

        cache
            .put(&CacheItem::in_region("K", "region1", order(1)).unwrap())
            .await
            .unwrap();
        cache.put(&CacheItem::new("K", order(2)).unwrap()).await.unwrap();

        assert!(cache.exists("K", Some("region1")).await.unwrap());
        assert_eq!(cache.clear_region("region1").await.unwrap(), 1);
        assert!(!cache.exists("K", Some("region1")).await.unwrap());
        assert!(cache.exists("K", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_restores_expiration() {
        let store = MemoryStore::new();
        let cache = handle(&store);

        let item = CacheItem::in_region("K", "r", order(3))
            .unwrap()
            .expire_after(Duration::from_secs(60))
            .unwrap();
        cache.put(&item).await.unwrap();

        let read = cache.get("K", Some("r")).await.unwrap().unwrap();
        assert_eq!(read.value(), &order(3));
        assert_eq!(read.region(), Some("r"));
        assert_eq!(read.expiration(), Expiration::Absolute(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_remove_reports_presence() {
        let store = MemoryStore::new();
        let cache = handle(&store);
        cache.put(&CacheItem::new("K", order(1)).unwrap()).await.unwrap();

        assert!(cache.remove("K", None).await.unwrap());
        assert!(!cache.remove("K", None).await.unwrap());
        assert_eq!(cache.get("K", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blank_key_is_rejected() {
        let store = MemoryStore::new();
        let cache = handle(&store);

        let err = cache.get("  ", None).await.unwrap_err();
        assert!(matches!(
            err,
            BackplaneError::Validation(ValidationError::RequiredFieldMissing { .. })
        ));
        assert!(cache.clear_region("").await.is_err());
    }

    #[tokio::test]
    async fn test_clear_empties_store() {
        let store = MemoryStore::new();
        let cache = handle(&store);
        for id in 0..5 {
            cache
                .put(&CacheItem::new(format!("k{id}"), order(id)).unwrap())
                .await
                .unwrap();
        }
        assert_eq!(cache.count().await.unwrap(), 5);
        cache.clear().await.unwrap();
        assert_eq!(cache.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_values_are_shared_between_handles() {
        let store = MemoryStore::new();
        let a = handle(&store);
        let b = handle(&store);

        a.put(&CacheItem::new("K", order(7)).unwrap()).await.unwrap();
        assert_eq!(b.get_value("K", None).await.unwrap(), Some(order(7)));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let store = MemoryStore::new();
        let cache = handle(&store);

        cache.dispose().await;
        cache.dispose().await;
        assert!(cache.is_disposed());
        assert!(cache.store().is_closed());

        assert!(!cache.add(&CacheItem::new("K", order(1)).unwrap()).await.unwrap());
        assert!(matches!(
            cache.count().await.unwrap_err(),
            BackplaneError::Store(StoreError::ConnectionClosed)
        ));
    }
}
