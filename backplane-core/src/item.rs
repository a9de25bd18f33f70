//! Cache item carried between callers and cache handles

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{CacheAddress, Expiration, Timestamp, ValidationError, MINIMUM_EXPIRATION_TIMEOUT};

/// A value addressed by key and optional region, with its expiration policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheItem<T> {
    address: CacheAddress,
    value: T,
    expiration: Expiration,
    created_at: Timestamp,
}

impl<T> CacheItem<T> {
    /// Create an item without region or expiration.
    pub fn new(key: impl Into<String>, value: T) -> Result<Self, ValidationError> {
        Ok(Self::at(CacheAddress::new(key)?, value))
    }

    /// Create an item inside a region.
    pub fn in_region(
        key: impl Into<String>,
        region: impl Into<String>,
        value: T,
    ) -> Result<Self, ValidationError> {
        Ok(Self::at(CacheAddress::with_region(key, region)?, value))
    }

    /// Create an item at an existing address.
    pub fn at(address: CacheAddress, value: T) -> Self {
        Self {
            address,
            value,
            expiration: Expiration::None,
            created_at: Utc::now(),
        }
    }

    /// Attach an expiration policy.
    ///
    /// Timeouts shorter than one millisecond are rejected.
    pub fn with_expiration(mut self, expiration: Expiration) -> Result<Self, ValidationError> {
        if let Some(timeout) = expiration.timeout() {
            if timeout < MINIMUM_EXPIRATION_TIMEOUT {
                return Err(ValidationError::invalid(
                    "expiration",
                    format!("timeout {:?} is lower than one millisecond", timeout),
                ));
            }
        }
        self.expiration = expiration;
        Ok(self)
    }

    /// Shorthand for an absolute expiration.
    pub fn expire_after(self, timeout: Duration) -> Result<Self, ValidationError> {
        self.with_expiration(Expiration::Absolute(timeout))
    }

    /// Shorthand for a sliding expiration.
    pub fn expire_idle(self, timeout: Duration) -> Result<Self, ValidationError> {
        self.with_expiration(Expiration::Sliding(timeout))
    }

    /// Override the creation timestamp (used when rebuilding from storage).
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn address(&self) -> &CacheAddress {
        &self.address
    }

    pub fn key(&self) -> &str {
        self.address.key()
    }

    pub fn region(&self) -> Option<&str> {
        self.address.region()
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn expiration(&self) -> Expiration {
        self.expiration
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_defaults() {
        let item = CacheItem::new("MyAmount", 100).unwrap();
        assert_eq!(item.key(), "MyAmount");
        assert_eq!(item.region(), None);
        assert_eq!(*item.value(), 100);
        assert!(item.expiration().is_none());
    }

    #[test]
    fn test_item_in_region() {
        let item = CacheItem::in_region("MyAmount", "awesome", 100).unwrap();
        assert_eq!(item.region(), Some("awesome"));
        assert_eq!(item.address().to_string(), "awesome@MyAmount");
    }

    #[test]
    fn test_item_rejects_blank_key() {
        assert!(CacheItem::new(" ", 1).is_err());
    }

    #[test]
    fn test_expiration_minimum_timeout() {
        let item = CacheItem::new("k", 1).unwrap();
        assert!(item.clone().expire_after(Duration::from_micros(500)).is_err());

        let item = item.expire_idle(Duration::from_millis(1)).unwrap();
        assert_eq!(
            item.expiration(),
            Expiration::Sliding(Duration::from_millis(1))
        );
    }
}
