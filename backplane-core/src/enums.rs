//! Enum types for change notifications

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// CHANGE ENUMS
// ============================================================================

/// Normalized kind of a change observed on the backing store.
///
/// `Added` and `Updated` mean "value changed, peers should invalidate or
/// re-fetch" and are the only kinds ever broadcast. The remaining kinds are
/// structural: they propagate through the store's own replication and only
/// reach local observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
    Cleared,
    RegionCleared,
}

impl ChangeKind {
    /// Whether this kind travels over the backplane topic.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, ChangeKind::Added | ChangeKind::Updated)
    }

    /// Whether this kind is a structural (remove/clear) event.
    pub fn is_structural(&self) -> bool {
        !self.is_broadcast()
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ChangeKind::Added => "Added",
            ChangeKind::Updated => "Updated",
            ChangeKind::Removed => "Removed",
            ChangeKind::Cleared => "Cleared",
            ChangeKind::RegionCleared => "RegionCleared",
        };
        write!(f, "{}", value)
    }
}

/// What the caller did when it reported a change through the backplane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
    /// A new entry was added.
    Add,
    /// An entry was written unconditionally (upsert).
    Put,
    /// An existing entry was updated in place.
    Update,
}

impl ChangeAction {
    /// Change kind peers observe for this action.
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeAction::Add => ChangeKind::Added,
            ChangeAction::Put | ChangeAction::Update => ChangeKind::Updated,
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ChangeAction::Add => "Add",
            ChangeAction::Put => "Put",
            ChangeAction::Update => "Update",
        };
        write!(f, "{}", value)
    }
}

/// Wire-level discriminator of a backplane message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackplaneAction {
    Changed,
    Removed,
    Cleared,
    ClearedRegion,
}

/// Why an entry left the store, as reported to local observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemovalReason {
    /// Removed by a client of the store, possibly on another node.
    ExternalDelete,
    /// Expiration deadline passed.
    Expired,
    /// Evicted by the store under memory pressure.
    Evicted,
}

// ============================================================================
// EXPIRATION
// ============================================================================

/// Smallest expiration timeout a store is asked to honour.
pub const MINIMUM_EXPIRATION_TIMEOUT: Duration = Duration::from_millis(1);

/// Expiration policy carried by a cache item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Expiration {
    /// Entry lives until removed.
    #[default]
    None,
    /// Entry expires a fixed time after it was written.
    Absolute(Duration),
    /// Entry expires after a period without access.
    Sliding(Duration),
}

impl Expiration {
    /// The configured timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Expiration::None => None,
            Expiration::Absolute(t) | Expiration::Sliding(t) => Some(*t),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Expiration::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_kind_broadcast_split() {
        assert!(ChangeKind::Added.is_broadcast());
        assert!(ChangeKind::Updated.is_broadcast());
        assert!(ChangeKind::Removed.is_structural());
        assert!(ChangeKind::Cleared.is_structural());
        assert!(ChangeKind::RegionCleared.is_structural());
    }

    #[test]
    fn test_change_action_kind() {
        assert_eq!(ChangeAction::Add.kind(), ChangeKind::Added);
        assert_eq!(ChangeAction::Put.kind(), ChangeKind::Updated);
        assert_eq!(ChangeAction::Update.kind(), ChangeKind::Updated);
    }

    #[test]
    fn test_wire_names_are_stable() {
        assert_eq!(serde_json::to_string(&ChangeAction::Put).unwrap(), "\"Put\"");
        assert_eq!(
            serde_json::to_string(&BackplaneAction::ClearedRegion).unwrap(),
            "\"ClearedRegion\""
        );
        assert!(serde_json::from_str::<ChangeAction>("\"Upsert\"").is_err());
    }

    #[test]
    fn test_expiration_timeout() {
        assert_eq!(Expiration::None.timeout(), None);
        assert_eq!(
            Expiration::Sliding(Duration::from_secs(3)).timeout(),
            Some(Duration::from_secs(3))
        );
        assert!(Expiration::default().is_none());
    }
}
