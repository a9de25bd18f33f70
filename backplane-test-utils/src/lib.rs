//! Backplane Test Utilities
//!
//! Shared test infrastructure for the backplane workspace:
//! - Recording transport and observer mocks
//! - Proptest generators for addresses and notifications
//! - Fixtures wiring nodes onto a shared store and bus
//! - Custom assertions

// Re-export core types for convenience
pub use backplane_core::{
    BackplaneConfig, BackplaneError, BackplaneResult, CacheAddress, CacheItem, ChangeAction,
    NodeId, Notification, RemovalReason, TransportError,
};
pub use backplane_events::{
    Backplane, BackplaneObserver, BackplaneState, InMemoryBus, MessageBus, MessageHandler, Topic,
    TopicSubscription,
};
pub use backplane_storage::{CacheHandle, MemoryConnection, MemoryStore};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// RECORDING TRANSPORT
// ============================================================================

/// One call to [`Topic::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub ttl: Option<Duration>,
}

/// Counters shared by every handle a [`RecordingBus`] hands out.
#[derive(Debug, Default)]
pub struct TransportLog {
    publishes: Mutex<Vec<PublishRecord>>,
    topic_lookups: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    releases: AtomicUsize,
}

impl TransportLog {
    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.publishes.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn publish_count(&self) -> usize {
        self.publishes.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn topic_lookups(&self) -> usize {
        self.topic_lookups.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Transport that records every call and delivers through an [`InMemoryBus`].
#[derive(Clone, Default)]
pub struct RecordingBus {
    inner: InMemoryBus,
    log: Arc<TransportLog>,
    fail_publish: Arc<AtomicBool>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Arc<TransportLog> {
        Arc::clone(&self.log)
    }

    /// Make every subsequent publish fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn topic(&self, name: &str) -> Result<Arc<dyn Topic>, TransportError> {
        self.log.topic_lookups.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.topic(name).await?;
        Ok(Arc::new(RecordingTopic {
            inner,
            log: Arc::clone(&self.log),
            fail_publish: Arc::clone(&self.fail_publish),
        }))
    }
}

struct RecordingTopic {
    inner: Arc<dyn Topic>,
    log: Arc<TransportLog>,
    fail_publish: Arc<AtomicBool>,
}

#[async_trait]
impl Topic for RecordingTopic {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn publish(&self, payload: Vec<u8>, ttl: Option<Duration>) -> Result<(), TransportError> {
        if let Ok(mut publishes) = self.log.publishes.lock() {
            publishes.push(PublishRecord {
                topic: self.inner.name().to_string(),
                payload: payload.clone(),
                ttl,
            });
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed {
                topic: self.inner.name().to_string(),
                reason: "publish failure injected".to_string(),
            });
        }
        self.inner.publish(payload, ttl).await
    }

    async fn subscribe(
        &self,
        handler: MessageHandler,
    ) -> Result<Box<dyn TopicSubscription>, TransportError> {
        self.log.subscribes.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.subscribe(handler).await?;
        Ok(Box::new(RecordingSubscription {
            inner,
            log: Arc::clone(&self.log),
        }))
    }

    async fn release(&self) {
        self.log.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release().await;
    }
}

struct RecordingSubscription {
    inner: Box<dyn TopicSubscription>,
    log: Arc<TransportLog>,
}

#[async_trait]
impl TopicSubscription for RecordingSubscription {
    async fn unsubscribe(&self) {
        self.log.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.inner.unsubscribe().await;
    }
}

// ============================================================================
// RECORDING OBSERVER
// ============================================================================

/// A notification as seen by an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Changed(CacheAddress, ChangeAction),
    Removed(CacheAddress, RemovalReason),
    Cleared,
    RegionCleared(String),
}

/// Observer that keeps every callback in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Observed> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Only the `on_changed` callbacks.
    pub fn changes(&self) -> Vec<(CacheAddress, ChangeAction)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Changed(address, action) => Some((address, action)),
                _ => None,
            })
            .collect()
    }

    /// Poll until at least `count` callbacks arrived or `timeout` passed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.len() >= count
    }

    fn push(&self, event: Observed) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(event);
        }
    }
}

impl BackplaneObserver for RecordingObserver {
    fn on_changed(&self, address: &CacheAddress, action: ChangeAction) {
        self.push(Observed::Changed(address.clone(), action));
    }

    fn on_removed(&self, address: &CacheAddress, reason: RemovalReason) {
        self.push(Observed::Removed(address.clone(), reason));
    }

    fn on_cleared(&self) {
        self.push(Observed::Cleared);
    }

    fn on_region_cleared(&self, region: &str) {
        self.push(Observed::RegionCleared(region.to_string()));
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for addresses and notifications.

    use super::*;
    use proptest::prelude::*;

    /// Keys that survive the flat encoding: non-blank, no `@` at either end.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_:.-]{1,24}"
    }

    /// Region names without any `@`.
    pub fn arb_region() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_-]{1,16}"
    }

    pub fn arb_address() -> impl Strategy<Value = CacheAddress> {
        (arb_key(), proptest::option::of(arb_region())).prop_map(|(key, region)| {
            CacheAddress::from_parts(&key, region.as_deref())
                .expect("generated keys are never blank")
        })
    }

    pub fn arb_change_action() -> impl Strategy<Value = ChangeAction> {
        prop_oneof![
            Just(ChangeAction::Add),
            Just(ChangeAction::Put),
            Just(ChangeAction::Update),
        ]
    }

    pub fn arb_change() -> impl Strategy<Value = (CacheAddress, ChangeAction)> {
        (arb_address(), arb_change_action())
    }

    pub fn arb_node_id() -> impl Strategy<Value = NodeId> {
        any::<[u8; 16]>().prop_map(|bytes| {
            NodeId::from_slice(&bytes).unwrap_or_else(NodeId::generate)
        })
    }

    pub fn arb_notification() -> impl Strategy<Value = Notification> {
        prop_oneof![
            4 => arb_change()
                .prop_map(|(address, action)| Notification::Changed { address, action }),
            1 => arb_address().prop_map(|address| Notification::Removed { address }),
            1 => Just(Notification::Cleared),
            1 => arb_region().prop_map(|region| Notification::ClearedRegion { region }),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Nodes wired onto a shared store and bus.

    use super::*;
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    /// One cluster member: a cache handle and a backplane on two connections
    /// of the same store client, plus an observer on the backplane.
    pub struct TestNode<T> {
        pub cache: CacheHandle<T, MemoryConnection>,
        pub backplane: Backplane<MemoryConnection>,
        pub observer: Arc<RecordingObserver>,
    }

    impl<T> TestNode<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        /// Join `store` and `bus` with the default configuration.
        pub async fn join(store: &MemoryStore, bus: &dyn MessageBus) -> BackplaneResult<Self> {
            Self::join_with(store, bus, BackplaneConfig::default()).await
        }

        pub async fn join_with(
            store: &MemoryStore,
            bus: &dyn MessageBus,
            config: BackplaneConfig,
        ) -> BackplaneResult<Self> {
            let connection = store.connect();
            let cache = CacheHandle::new(connection.sibling());
            let backplane = Backplane::connect(config, connection, bus).await?;
            let observer = RecordingObserver::new();
            backplane.subscribe(observer.clone());
            Ok(Self {
                cache,
                backplane,
                observer,
            })
        }

        /// Dispose the backplane and the cache handle.
        pub async fn leave(&self) {
            self.backplane.dispose().await;
            self.cache.dispose().await;
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for backplane test scenarios.

    use super::*;

    /// Assert that no transport publish happened.
    pub fn assert_no_publish(log: &TransportLog) {
        assert_eq!(
            log.publish_count(),
            0,
            "Expected no publish, got {:?}",
            log.publishes()
        );
    }

    /// Assert that exactly `expected` publishes happened.
    pub fn assert_publish_count(log: &TransportLog, expected: usize) {
        assert_eq!(
            log.publish_count(),
            expected,
            "Unexpected publish count: {:?}",
            log.publishes()
        );
    }

    /// Assert that an observer saw exactly these changes, in order.
    pub fn assert_changes(observer: &RecordingObserver, expected: &[(CacheAddress, ChangeAction)]) {
        assert_eq!(observer.changes(), expected);
    }

    pub fn assert_validation_error<T: std::fmt::Debug>(result: &BackplaneResult<T>) {
        assert!(
            matches!(result, Err(BackplaneError::Validation(_))),
            "Expected validation error, got {:?}",
            result
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_bus_counts_calls() {
        let bus = RecordingBus::new();
        let log = bus.log();
        let topic = bus.topic("t").await.unwrap();
        let sub = topic.subscribe(Arc::new(|_: &[u8]| {})).await.unwrap();

        topic.publish(vec![1], Some(Duration::from_secs(1))).await.unwrap();
        sub.unsubscribe().await;
        topic.release().await;

        assert_eq!(log.topic_lookups(), 1);
        assert_eq!(log.subscribes(), 1);
        assert_eq!(log.publish_count(), 1);
        assert_eq!(log.publishes()[0].ttl, Some(Duration::from_secs(1)));
        assert_eq!(log.unsubscribes(), 1);
        assert_eq!(log.releases(), 1);
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let bus = RecordingBus::new();
        bus.fail_publishes(true);
        let topic = bus.topic("t").await.unwrap();

        let err = topic.publish(vec![1], None).await.unwrap_err();
        assert!(matches!(err, TransportError::PublishFailed { .. }));
        assert_eq!(bus.log().publish_count(), 1);
    }

    #[test]
    fn test_recording_observer_filters_changes() {
        let observer = RecordingObserver::new();
        let address = CacheAddress::new("k").unwrap();
        observer.on_cleared();
        observer.on_changed(&address, ChangeAction::Put);

        assert_eq!(observer.len(), 2);
        assert_eq!(observer.changes(), vec![(address, ChangeAction::Put)]);
    }
}
