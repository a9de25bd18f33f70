//! In-process message bus.
//!
//! Topics are `tokio::sync::broadcast` channels keyed by name. Each
//! subscription runs a tokio task that forwards payloads to its handler.
//! Messages whose time-to-live has passed by the time they are received are
//! dropped.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use backplane_core::TransportError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::bus::{MessageBus, MessageHandler, Topic, TopicSubscription};

/// Default per-topic channel capacity.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Envelope {
    payload: Arc<[u8]>,
    expires_at: Option<Instant>,
}

impl Envelope {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct Channel {
    name: String,
    tx: broadcast::Sender<Envelope>,
}

/// Bus whose topics live in this process.
#[derive(Clone)]
pub struct InMemoryBus {
    capacity: usize,
    topics: Arc<RwLock<HashMap<String, Arc<Channel>>>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a bus whose topics buffer up to `capacity` messages per
    /// subscriber before lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of distinct topics created so far.
    pub fn topic_count(&self) -> usize {
        self.topics.read().map(|t| t.len()).unwrap_or(0)
    }

    fn channel(&self, name: &str) -> Result<Arc<Channel>, TransportError> {
        let unavailable = |reason: &str| TransportError::TopicUnavailable {
            topic: name.to_string(),
            reason: reason.to_string(),
        };

        if let Some(existing) = self
            .topics
            .read()
            .map_err(|_| unavailable("topic registry poisoned"))?
            .get(name)
        {
            return Ok(Arc::clone(existing));
        }

        let mut topics = self
            .topics
            .write()
            .map_err(|_| unavailable("topic registry poisoned"))?;
        let channel = topics.entry(name.to_string()).or_insert_with(|| {
            debug!(topic = %name, capacity = self.capacity, "Topic created");
            let (tx, _rx) = broadcast::channel(self.capacity);
            Arc::new(Channel {
                name: name.to_string(),
                tx,
            })
        });
        Ok(Arc::clone(channel))
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn topic(&self, name: &str) -> Result<Arc<dyn Topic>, TransportError> {
        if name.trim().is_empty() {
            return Err(TransportError::TopicUnavailable {
                topic: name.to_string(),
                reason: "topic name is blank".to_string(),
            });
        }
        let channel = self.channel(name)?;
        Ok(Arc::new(InMemoryTopic {
            channel,
            released: AtomicBool::new(false),
        }))
    }
}

/// One holder's handle on an in-process topic.
pub struct InMemoryTopic {
    channel: Arc<Channel>,
    released: AtomicBool,
}

impl InMemoryTopic {
    fn ensure_held(&self) -> Result<(), TransportError> {
        if self.released.load(Ordering::Acquire) {
            return Err(TransportError::TopicUnavailable {
                topic: self.channel.name.clone(),
                reason: "topic handle released".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Topic for InMemoryTopic {
    fn name(&self) -> &str {
        &self.channel.name
    }

    async fn publish(&self, payload: Vec<u8>, ttl: Option<Duration>) -> Result<(), TransportError> {
        self.ensure_held()?;
        let envelope = Envelope {
            payload: payload.into(),
            expires_at: ttl.and_then(|t| Instant::now().checked_add(t)),
        };

        match self.channel.tx.send(envelope) {
            Ok(receivers) => {
                trace!(topic = %self.channel.name, receivers = receivers, "Published");
            }
            Err(_) => {
                debug!(topic = %self.channel.name, "No subscribers for message");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        handler: MessageHandler,
    ) -> Result<Box<dyn TopicSubscription>, TransportError> {
        self.ensure_held()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            TransportError::SubscribeFailed {
                topic: self.channel.name.clone(),
                reason: e.to_string(),
            }
        })?;

        let topic = self.channel.name.clone();
        let mut rx = self.channel.tx.subscribe();
        let task = runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.is_expired() {
                            trace!(topic = %topic, "Dropping expired message");
                            continue;
                        }
                        let payload = &envelope.payload[..];
                        let delivered =
                            panic::catch_unwind(AssertUnwindSafe(|| handler(payload)));
                        if delivered.is_err() {
                            warn!(topic = %topic, "Message handler panicked");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            topic = %topic,
                            skipped = skipped,
                            "Subscriber lagged, some messages were dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(topic = %topic, "Topic channel closed");
                        break;
                    }
                }
            }
        });

        debug!(topic = %self.channel.name, "Subscribed");
        Ok(Box::new(InMemorySubscription {
            topic: self.channel.name.clone(),
            task: Mutex::new(Some(task)),
        }))
    }

    async fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            debug!(topic = %self.channel.name, "Topic handle released");
        }
    }
}

/// Delivery task of one subscriber.
pub struct InMemorySubscription {
    topic: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TopicSubscription for InMemorySubscription {
    async fn unsubscribe(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.abort();
            debug!(topic = %self.topic, "Unsubscribed");
        }
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn collecting_handler() -> (MessageHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |payload: &[u8]| {
            sink.lock().unwrap().push(payload.to_vec());
        });
        (handler, seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_topic_lookup_is_idempotent() {
        let bus = InMemoryBus::new();
        let a = bus.topic("t").await.unwrap();
        let b = bus.topic("t").await.unwrap();
        assert_eq!(a.name(), b.name());
        assert_eq!(bus.topic_count(), 1);

        let (handler, seen) = collecting_handler();
        let _sub = b.subscribe(handler).await.unwrap();
        a.publish(b"hello".to_vec(), None).await.unwrap();
        settle().await;

        assert_eq!(seen.lock().unwrap().clone(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_delivery_survives_handler_panic() {
        let bus = InMemoryBus::new();
        let topic = bus.topic("t").await.unwrap();
        let (collect, seen) = collecting_handler();
        let handler: MessageHandler = Arc::new(move |payload: &[u8]| {
            if payload == b"boom" {
                panic!("handler failure");
            }
            collect(payload);
        });
        let _sub = topic.subscribe(handler).await.unwrap();

        topic.publish(b"boom".to_vec(), None).await.unwrap();
        topic.publish(b"next".to_vec(), None).await.unwrap();
        settle().await;

        assert_eq!(seen.lock().unwrap().clone(), vec![b"next".to_vec()]);
    }

    #[tokio::test]
    async fn test_blank_topic_name_is_rejected() {
        let bus = InMemoryBus::new();
        assert!(matches!(
            bus.topic(" ").await,
            Err(TransportError::TopicUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = InMemoryBus::new();
        let topic = bus.topic("t").await.unwrap();
        topic.publish(vec![1, 2, 3], Some(Duration::from_secs(1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_each_message() {
        let bus = InMemoryBus::new();
        let topic = bus.topic("t").await.unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let mut subs = Vec::new();
        for _ in 0..3 {
            let counter = Arc::clone(&count);
            let handler: MessageHandler = Arc::new(move |_: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            subs.push(topic.subscribe(handler).await.unwrap());
        }

        topic.publish(vec![0], None).await.unwrap();
        topic.publish(vec![1], None).await.unwrap();
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = InMemoryBus::new();
        let topic = bus.topic("t").await.unwrap();
        let (handler, seen) = collecting_handler();
        let sub = topic.subscribe(handler).await.unwrap();

        sub.unsubscribe().await;
        sub.unsubscribe().await;
        topic.publish(vec![9], None).await.unwrap();
        settle().await;

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_released_handle_rejects_publish() {
        let bus = InMemoryBus::new();
        let topic = bus.topic("t").await.unwrap();
        topic.release().await;
        topic.release().await;

        assert!(topic.publish(vec![1], None).await.is_err());

        let other = bus.topic("t").await.unwrap();
        assert!(other.publish(vec![1], None).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_messages_are_dropped() {
        let bus = InMemoryBus::new();
        let topic = bus.topic("t").await.unwrap();
        let (handler, seen) = collecting_handler();
        let _sub = topic.subscribe(handler).await.unwrap();

        let channel = bus.channel("t").unwrap();
        channel
            .tx
            .send(Envelope {
                payload: Arc::from(&b"stale"[..]),
                expires_at: Some(Instant::now()),
            })
            .unwrap();
        topic
            .publish(b"fresh".to_vec(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        settle().await;

        assert_eq!(seen.lock().unwrap().clone(), vec![b"fresh".to_vec()]);
    }
}
