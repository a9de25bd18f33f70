//! Native store events translated into backplane change events.
//!
//! A [`ChangeEventSource`] is registered as a [`StoreEventListener`] on a
//! store connection. It decodes flat keys back into addresses, maps native
//! removal reasons, and hands the result to a [`ChangeSink`].
//!
//! The source holds its sink weakly, so a store that outlives the sink
//! simply stops delivering.

use std::fmt;
use std::sync::{Arc, Weak};

use backplane_core::{CacheAddress, ChangeKind, KeyCodec, RemovalReason};
use tracing::{trace, warn};

use crate::store::{NativeRemoval, StoreEventListener};

/// A change reported by the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Added(CacheAddress),
    Removed(CacheAddress, RemovalReason),
    Cleared,
    RegionCleared(String),
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Added(_) => ChangeKind::Added,
            ChangeEvent::Removed(..) => ChangeKind::Removed,
            ChangeEvent::Cleared => ChangeKind::Cleared,
            ChangeEvent::RegionCleared(_) => ChangeKind::RegionCleared,
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeEvent::Added(address) => write!(f, "added {address}"),
            ChangeEvent::Removed(address, reason) => write!(f, "removed {address} ({reason:?})"),
            ChangeEvent::Cleared => write!(f, "cleared"),
            ChangeEvent::RegionCleared(region) => write!(f, "region {region} cleared"),
        }
    }
}

/// Receiver of translated change events.
pub trait ChangeSink: Send + Sync {
    fn on_change_event(&self, event: ChangeEvent);
}

/// Map a native removal reason. `None` means the event is not forwarded.
pub fn map_removal_reason(reason: &NativeRemoval) -> Option<RemovalReason> {
    match reason {
        NativeRemoval::Removed => Some(RemovalReason::ExternalDelete),
        NativeRemoval::Expired => Some(RemovalReason::Expired),
        NativeRemoval::Underused => Some(RemovalReason::Evicted),
        NativeRemoval::Other(_) => None,
    }
}

/// Store listener forwarding translated events to a sink.
pub struct ChangeEventSource<K: ChangeSink> {
    codec: Arc<dyn KeyCodec>,
    sink: Weak<K>,
}

impl<K: ChangeSink> ChangeEventSource<K> {
    pub fn new(codec: Arc<dyn KeyCodec>, sink: Weak<K>) -> Self {
        Self { codec, sink }
    }

    fn forward(&self, event: ChangeEvent) {
        match self.sink.upgrade() {
            Some(sink) => {
                trace!(event = %event, "Forwarding store event");
                sink.on_change_event(event);
            }
            None => trace!(event = %event, "Sink gone, dropping store event"),
        }
    }
}

impl<K: ChangeSink> StoreEventListener for ChangeEventSource<K> {
    fn on_item_added(&self, flat_key: &str) {
        self.forward(ChangeEvent::Added(self.codec.decode(flat_key)));
    }

    fn on_item_removed(&self, flat_key: &str, reason: &NativeRemoval) {
        match map_removal_reason(reason) {
            Some(mapped) => {
                self.forward(ChangeEvent::Removed(self.codec.decode(flat_key), mapped))
            }
            None => warn!(
                key = %flat_key,
                reason = ?reason,
                "Unmapped removal reason, event dropped"
            ),
        }
    }

    fn on_cleared(&self) {
        self.forward(ChangeEvent::Cleared);
    }

    fn on_group_cleared(&self, group: &str) {
        self.forward(ChangeEvent::RegionCleared(group.to_string()));
    }
}
