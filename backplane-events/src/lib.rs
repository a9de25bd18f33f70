//! Backplane Events - Pub/Sub Transport and the Backplane
//!
//! This crate defines the transport contract the backplane publishes on, an
//! in-process transport built on tokio broadcast channels, and the
//! [`Backplane`] itself.
//!
//! # Traits
//!
//! - `MessageBus`: idempotent topic lookup
//! - `Topic`: publish with time-to-live, subscribe, release
//! - `TopicSubscription`: stop delivery
//! - `BackplaneObserver`: local notification callbacks

mod backplane;
mod bus;
mod in_memory;

pub use backplane::{Backplane, BackplaneObserver, BackplaneState};
pub use bus::{MessageBus, MessageHandler, Topic, TopicSubscription};
pub use in_memory::{InMemoryBus, InMemorySubscription, InMemoryTopic, DEFAULT_TOPIC_CAPACITY};

// Re-export core types for convenience
pub use backplane_core::{
    BackplaneConfig, BackplaneError, BackplaneResult, CacheAddress, ChangeAction, NodeId,
    RemovalReason, TransportError,
};
