//! Pub/sub transport contract.
//!
//! The backplane needs very little from a transport: named topics that can
//! be looked up idempotently, fire-and-forget publish with an optional
//! time-to-live, and a subscription callback invoked once per delivered
//! payload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backplane_core::TransportError;

/// Callback invoked with the raw bytes of each delivered message.
///
/// Runs on the transport's delivery task and must not block.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Entry point of a pub/sub transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Look up a topic, creating it if needed. Asking for an existing name
    /// yields a handle on the existing topic.
    async fn topic(&self, name: &str) -> Result<Arc<dyn Topic>, TransportError>;
}

/// Handle on a named topic.
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    /// Publish a payload. Messages older than `ttl` may be dropped instead of
    /// delivered.
    async fn publish(&self, payload: Vec<u8>, ttl: Option<Duration>) -> Result<(), TransportError>;

    /// Start delivering messages to `handler`.
    async fn subscribe(
        &self,
        handler: MessageHandler,
    ) -> Result<Box<dyn TopicSubscription>, TransportError>;

    /// Give the handle back to the transport. The topic itself stays alive
    /// for other holders.
    async fn release(&self);
}

/// An active subscription.
#[async_trait]
pub trait TopicSubscription: Send + Sync {
    /// Stop delivery. Idempotent.
    async fn unsubscribe(&self);
}
