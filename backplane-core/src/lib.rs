//! Backplane Core - Data Types
//!
//! Types shared by every crate of the workspace: node identity, the
//! key/region address codec, change enums, cache items, errors,
//! configuration, and the batch wire format.
//!
//! This crate performs no I/O.

mod address;
mod config;
mod enums;
mod error;
mod identity;
mod item;
mod message;

pub use address::{
    decode_key, encode_key, AtDelimitedCodec, CacheAddress, KeyCodec, REGION_DELIMITER,
};
pub use config::{BackplaneConfig, StoreConfig, DEFAULT_MESSAGE_TTL, DEFAULT_TOPIC_NAME};
pub use enums::{
    BackplaneAction, ChangeAction, ChangeKind, Expiration, RemovalReason,
    MINIMUM_EXPIRATION_TIMEOUT,
};
pub use error::{
    BackplaneError, BackplaneResult, ConfigError, StoreError, TransportError, ValidationError,
    WireError,
};
pub use identity::{NodeId, Timestamp};
pub use item::CacheItem;
pub use message::{
    deserialize_batch, serialize_batch, BackplaneMessage, Notification, WIRE_VERSION,
};

pub(crate) use address::is_blank;
