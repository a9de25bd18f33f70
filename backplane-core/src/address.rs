//! Key/region addressing over stores that only understand flat string keys.
//!
//! A cached entry is identified by a key and an optional region. Stores
//! without a region concept see a single flat key:
//!
//! - key without region: `key`
//! - key with region: `region@key`
//!
//! Decoding only treats an `@` as the region boundary when it sits strictly
//! inside the string. An `@` at index 0 or at the last index is a literal
//! character. This keeps "no region" and "empty region" apart.
//!
//! # Known limitation
//!
//! A key that itself contains `@` does not survive an encode/decode
//! round-trip when it has no region (`a@b` decodes as region `a`, key `b`).
//! Existing stored data relies on this exact scheme, so the codec keeps it
//! and hides it behind [`KeyCodec`] for a future structured encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ValidationError;

/// Region/key delimiter of the flat encoding.
pub const REGION_DELIMITER: char = '@';

/// Logical identity of a cached entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheAddress {
    key: String,
    region: Option<String>,
}

impl CacheAddress {
    /// Address a key outside any region.
    ///
    /// Fails if the key is empty or whitespace only.
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        Self::build(key.into(), None)
    }

    /// Address a key inside a region. A blank region is treated as no region.
    pub fn with_region(
        key: impl Into<String>,
        region: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Self::build(key.into(), Some(region.into()))
    }

    /// Address a key with an optional region.
    pub fn from_parts(key: &str, region: Option<&str>) -> Result<Self, ValidationError> {
        Self::build(key.to_string(), region.map(str::to_string))
    }

    fn build(key: String, region: Option<String>) -> Result<Self, ValidationError> {
        if is_blank(&key) {
            return Err(ValidationError::missing("key"));
        }
        Ok(Self {
            key,
            region: region.filter(|r| !is_blank(r)),
        })
    }

    /// Decoded addresses come from the store and skip argument validation.
    fn decoded(key: &str, region: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            region: region.map(str::to_string),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn has_region(&self) -> bool {
        self.region.is_some()
    }
}

impl fmt::Display for CacheAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{}{}{}", region, REGION_DELIMITER, self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Bidirectional mapping between a [`CacheAddress`] and a flat store key.
pub trait KeyCodec: Send + Sync {
    /// Produce the flat key for an address.
    fn encode(&self, address: &CacheAddress) -> String;

    /// Recover the address from a flat key. Never fails: a flat key without
    /// a recognizable boundary is a key without region.
    fn decode(&self, flat_key: &str) -> CacheAddress;
}

/// The `region@key` scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtDelimitedCodec;

impl KeyCodec for AtDelimitedCodec {
    fn encode(&self, address: &CacheAddress) -> String {
        match address.region() {
            Some(region) => {
                let mut flat = String::with_capacity(region.len() + 1 + address.key().len());
                flat.push_str(region);
                flat.push(REGION_DELIMITER);
                flat.push_str(address.key());
                flat
            }
            None => address.key().to_string(),
        }
    }

    fn decode(&self, flat_key: &str) -> CacheAddress {
        match region_boundary(flat_key) {
            Some(idx) => CacheAddress::decoded(&flat_key[idx + 1..], Some(&flat_key[..idx])),
            None => CacheAddress::decoded(flat_key, None),
        }
    }
}

/// Encode a key and optional region with the default codec.
///
/// Fails with a validation error if `key` is blank.
pub fn encode_key(key: &str, region: Option<&str>) -> Result<String, ValidationError> {
    let address = CacheAddress::from_parts(key, region)?;
    Ok(AtDelimitedCodec.encode(&address))
}

/// Decode a flat key with the default codec.
pub fn decode_key(flat_key: &str) -> CacheAddress {
    AtDelimitedCodec.decode(flat_key)
}

/// Index of the first delimiter strictly inside the string.
fn region_boundary(flat_key: &str) -> Option<usize> {
    let last = flat_key.len().checked_sub(1)?;
    flat_key
        .char_indices()
        .find(|&(idx, c)| c == REGION_DELIMITER && idx > 0 && idx < last)
        .map(|(idx, _)| idx)
}

pub(crate) fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}
