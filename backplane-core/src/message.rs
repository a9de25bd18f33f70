//! Backplane messages and the batch wire format.
//!
//! A payload carries the sender's [`NodeId`] once, followed by an ordered
//! batch of notifications. Decoding stamps the sender id onto every message.
//!
//! # Wire Format
//!
//! A batch is one JSON document:
//!
//! ```text
//! {"version":1,"sender":"<uuid>","messages":[
//!     {"action":"Changed","change":"Add","key":"K","region":"r"}
//! ]}
//! ```
//!
//! `change`, `key` and `region` are omitted when a message has none. Unknown
//! fields, unknown action names, a missing key on a keyed message, or any
//! bytes after the document reject the whole payload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BackplaneAction, CacheAddress, ChangeAction, NodeId, WireError};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// What a backplane message says happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A value was added or overwritten. Peers should invalidate it.
    Changed {
        address: CacheAddress,
        action: ChangeAction,
    },
    /// A single entry was removed.
    Removed { address: CacheAddress },
    /// The whole cache was cleared.
    Cleared,
    /// Every entry of a region was removed.
    ClearedRegion { region: String },
}

impl Notification {
    pub fn action(&self) -> BackplaneAction {
        match self {
            Notification::Changed { .. } => BackplaneAction::Changed,
            Notification::Removed { .. } => BackplaneAction::Removed,
            Notification::Cleared => BackplaneAction::Cleared,
            Notification::ClearedRegion { .. } => BackplaneAction::ClearedRegion,
        }
    }
}

/// One unit of broadcast intent, stamped with the node that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackplaneMessage {
    origin: NodeId,
    notification: Notification,
}

impl BackplaneMessage {
    pub fn new(origin: NodeId, notification: Notification) -> Self {
        Self {
            origin,
            notification,
        }
    }

    pub fn for_changed(origin: NodeId, address: CacheAddress, action: ChangeAction) -> Self {
        Self::new(origin, Notification::Changed { address, action })
    }

    pub fn for_removed(origin: NodeId, address: CacheAddress) -> Self {
        Self::new(origin, Notification::Removed { address })
    }

    pub fn for_cleared(origin: NodeId) -> Self {
        Self::new(origin, Notification::Cleared)
    }

    pub fn for_cleared_region(origin: NodeId, region: impl Into<String>) -> Self {
        Self::new(
            origin,
            Notification::ClearedRegion {
                region: region.into(),
            },
        )
    }

    pub fn origin(&self) -> NodeId {
        self.origin
    }

    pub fn action(&self) -> BackplaneAction {
        self.notification.action()
    }

    pub fn notification(&self) -> &Notification {
        &self.notification
    }

    pub fn into_notification(self) -> Notification {
        self.notification
    }

    /// Whether this message was produced by `node`.
    pub fn is_from(&self, node: &NodeId) -> bool {
        self.origin == *node
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireBatch {
    version: u8,
    sender: Uuid,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMessage {
    action: BackplaneAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change: Option<ChangeAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<String>,
}

impl WireMessage {
    fn from_notification(notification: &Notification) -> Self {
        let (change, address, region) = match notification {
            Notification::Changed { address, action } => (Some(*action), Some(address), None),
            Notification::Removed { address } => (None, Some(address), None),
            Notification::Cleared => (None, None, None),
            Notification::ClearedRegion { region } => (None, None, Some(region.clone())),
        };
        Self {
            action: notification.action(),
            change,
            key: address.map(|a| a.key().to_string()),
            region: region.or_else(|| address.and_then(|a| a.region()).map(str::to_string)),
        }
    }

    fn into_notification(self) -> Result<Notification, WireError> {
        match self.action {
            BackplaneAction::Changed => {
                let action = self.change.ok_or(WireError::MissingField { field: "change" })?;
                Ok(Notification::Changed {
                    address: wire_address(self.key, self.region)?,
                    action,
                })
            }
            BackplaneAction::Removed => Ok(Notification::Removed {
                address: wire_address(self.key, self.region)?,
            }),
            BackplaneAction::Cleared => Ok(Notification::Cleared),
            BackplaneAction::ClearedRegion => match self.region {
                Some(region) if !region.trim().is_empty() => {
                    Ok(Notification::ClearedRegion { region })
                }
                _ => Err(WireError::MissingField { field: "region" }),
            },
        }
    }
}

fn wire_address(key: Option<String>, region: Option<String>) -> Result<CacheAddress, WireError> {
    let key = key.ok_or(WireError::MissingField { field: "key" })?;
    CacheAddress::from_parts(&key, region.as_deref())
        .map_err(|_| WireError::MissingField { field: "key" })
}

// ============================================================================
// ENCODING
// ============================================================================

/// Serialize a batch of notifications sent by `sender`.
pub fn serialize_batch(sender: &NodeId, batch: &[Notification]) -> Result<Vec<u8>, WireError> {
    let envelope = WireBatch {
        version: WIRE_VERSION,
        sender: sender.as_uuid(),
        messages: batch.iter().map(WireMessage::from_notification).collect(),
    };
    serde_json::to_vec(&envelope).map_err(|e| WireError::Encode(e.to_string()))
}

// ============================================================================
// DECODING
// ============================================================================

/// Deserialize a payload into messages, each stamped with the sender id.
///
/// All-or-nothing: any defect rejects the whole batch.
pub fn deserialize_batch(payload: &[u8]) -> Result<Vec<BackplaneMessage>, WireError> {
    if payload.is_empty() {
        return Err(WireError::Empty);
    }

    let envelope: WireBatch =
        serde_json::from_slice(payload).map_err(|e| WireError::Malformed(e.to_string()))?;
    if envelope.version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(envelope.version));
    }

    let sender = NodeId::from_uuid(envelope.sender);
    envelope
        .messages
        .into_iter()
        .map(|m| Ok(BackplaneMessage::new(sender, m.into_notification()?)))
        .collect()
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Property: arbitrary bytes never panic the decoder.
        #[test]
        fn prop_decoder_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = deserialize_batch(&bytes);
        }

        /// Property: a decoded batch always carries the sender it was written with.
        #[test]
        fn prop_every_message_gets_sender(
            keys in proptest::collection::vec("[a-z0-9]{1,12}", 0..16),
        ) {
            let sender = NodeId::generate();
            let batch: Vec<Notification> = keys
                .iter()
                .map(|k| Notification::Changed {
                    address: CacheAddress::new(k.clone()).unwrap(),
                    action: ChangeAction::Update,
                })
                .collect();
            let messages = deserialize_batch(&serialize_batch(&sender, &batch).unwrap()).unwrap();
            prop_assert_eq!(messages.len(), keys.len());
            prop_assert!(messages.iter().all(|m| m.is_from(&sender)));
        }
    }
}
