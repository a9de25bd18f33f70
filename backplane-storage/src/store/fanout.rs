//! Native event fan-out shared by the in-process stores.
//!
//! A store is shared by every connection opened on it. Removals and clears
//! are reported to the listeners of every open connection, the way a
//! clustered store notifies all of its clients. An added item is only
//! reported to the connections of the client that wrote it; peers learn
//! about it from the backplane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use backplane_core::StoreError;

use super::{ListenerId, NativeRemoval, StoreEventListener};

type ListenerSet = Vec<(ListenerId, Arc<dyn StoreEventListener>)>;

/// Native event as produced by a store mutation.
#[derive(Debug, Clone)]
pub(crate) enum StoreEvent {
    /// Raised for the writing client only.
    ItemAdded { key: String, client: u64 },
    ItemRemoved(String, NativeRemoval),
    Cleared,
    GroupCleared(String),
}

impl StoreEvent {
    fn reaches(&self, client: u64) -> bool {
        match self {
            StoreEvent::ItemAdded { client: origin, .. } => *origin == client,
            _ => true,
        }
    }

    fn deliver(&self, listener: &dyn StoreEventListener) {
        match self {
            StoreEvent::ItemAdded { key, .. } => listener.on_item_added(key),
            StoreEvent::ItemRemoved(key, reason) => listener.on_item_removed(key, reason),
            StoreEvent::Cleared => listener.on_cleared(),
            StoreEvent::GroupCleared(group) => listener.on_group_cleared(group),
        }
    }
}

struct Slot {
    client: u64,
    listeners: ListenerSet,
}

#[derive(Default)]
pub(crate) struct EventFanout {
    next_client: AtomicU64,
    next_connection: AtomicU64,
    next_listener: AtomicU64,
    connections: RwLock<HashMap<u64, Slot>>,
}

impl EventFanout {
    pub(crate) fn new_client(&self) -> u64 {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn open_connection(&self, client: u64) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut connections) = self.connections.write() {
            connections.insert(
                id,
                Slot {
                    client,
                    listeners: Vec::new(),
                },
            );
        }
        id
    }

    pub(crate) fn close_connection(&self, connection: u64) {
        if let Ok(mut connections) = self.connections.write() {
            connections.remove(&connection);
        }
    }

    pub(crate) fn register(
        &self,
        connection: u64,
        listener: Arc<dyn StoreEventListener>,
    ) -> Result<ListenerId, StoreError> {
        let mut connections = self
            .connections
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let slot = connections
            .get_mut(&connection)
            .ok_or(StoreError::ConnectionClosed)?;
        let id = ListenerId::new(self.next_listener.fetch_add(1, Ordering::Relaxed));
        slot.listeners.push((id, listener));
        Ok(id)
    }

    pub(crate) fn unregister(&self, connection: u64, id: ListenerId) -> bool {
        let Ok(mut connections) = self.connections.write() else {
            return false;
        };
        match connections.get_mut(&connection) {
            Some(slot) => {
                let before = slot.listeners.len();
                slot.listeners.retain(|(existing, _)| *existing != id);
                slot.listeners.len() != before
            }
            None => false,
        }
    }

    /// Deliver an event to every listener of every connection it reaches.
    ///
    /// Listeners are called after the registry lock is released, so a
    /// listener may register or unregister without deadlocking.
    pub(crate) fn emit(&self, event: StoreEvent) {
        let snapshot: Vec<Arc<dyn StoreEventListener>> = match self.connections.read() {
            Ok(connections) => connections
                .values()
                .filter(|slot| event.reaches(slot.client))
                .flat_map(|slot| slot.listeners.iter().map(|(_, l)| Arc::clone(l)))
                .collect(),
            Err(_) => return,
        };

        for listener in snapshot {
            event.deliver(listener.as_ref());
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.connections
            .read()
            .map(|c| c.values().map(|slot| slot.listeners.len()).sum())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }
}
