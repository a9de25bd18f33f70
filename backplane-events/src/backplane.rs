//! The cache invalidation backplane.
//!
//! Every node runs one [`Backplane`]. It publishes value changes on a shared
//! topic, receives the changes published by its peers, and relays the
//! backing store's native events to local observers.
//!
//! # Message flow
//!
//! ```text
//! notify_change ──────────────┐
//!                              ├──► serialize_batch ──► Topic::publish
//! store item added ────────────┘
//!
//! Topic delivery ──► deserialize_batch ──► drop own messages ──► on_changed
//!
//! store removal / clear ──► ChangeEventSource ──► on_removed / on_cleared /
//!                                                 on_region_cleared
//! ```
//!
//! Only value changes travel over the topic. An item added through this
//! node's store client is published like any other change, so peers hear
//! about it once and this node not at all. Removals and clears already
//! reach every node through the store's own eventing, so the corresponding
//! `notify_*` calls are accepted and ignored.
//!
//! A panicking observer is logged and skipped; delivery to the remaining
//! observers and of later messages continues.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use backplane_core::{
    deserialize_batch, serialize_batch, AtDelimitedCodec, BackplaneConfig, BackplaneResult,
    CacheAddress, ChangeAction, KeyCodec, NodeId, Notification, RemovalReason, StoreError,
};
use backplane_storage::{BackingStore, ChangeEvent, ChangeEventSource, ChangeSink, ListenerId};
use tracing::{debug, info, trace, warn};

use crate::bus::{MessageBus, MessageHandler, Topic, TopicSubscription};

/// Receiver of backplane notifications on one node.
///
/// Callbacks run on the transport's delivery task or on the store's event
/// context and must not block.
pub trait BackplaneObserver: Send + Sync {
    /// A peer changed or added a value.
    fn on_changed(&self, address: &CacheAddress, action: ChangeAction);

    fn on_removed(&self, _address: &CacheAddress, _reason: RemovalReason) {}

    fn on_cleared(&self) {}

    fn on_region_cleared(&self, _region: &str) {}
}

/// Lifecycle of a backplane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackplaneState {
    /// Built, subscriptions not yet established.
    Constructed,
    /// Subscribed to the topic and to the store's events.
    Active,
    /// Resources released. Terminal.
    Disposed,
}

impl BackplaneState {
    fn to_u8(self) -> u8 {
        match self {
            BackplaneState::Constructed => 0,
            BackplaneState::Active => 1,
            BackplaneState::Disposed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => BackplaneState::Constructed,
            1 => BackplaneState::Active,
            _ => BackplaneState::Disposed,
        }
    }
}

struct Inner<S> {
    this: Weak<Inner<S>>,
    node_id: NodeId,
    config: BackplaneConfig,
    codec: Arc<dyn KeyCodec>,
    store: S,
    topic: Arc<dyn Topic>,
    observers: RwLock<Vec<Arc<dyn BackplaneObserver>>>,
    publish_lock: tokio::sync::Mutex<()>,
    dispose_lock: tokio::sync::Mutex<()>,
    subscription: Mutex<Option<Box<dyn TopicSubscription>>>,
    listener: Mutex<Option<ListenerId>>,
    state: AtomicU8,
}

impl<S: BackingStore> Inner<S> {
    fn state(&self) -> BackplaneState {
        BackplaneState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BackplaneState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.state() == BackplaneState::Disposed
    }

    fn observers(&self) -> Vec<Arc<dyn BackplaneObserver>> {
        self.observers
            .read()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    fn for_each_observer(&self, f: impl Fn(&dyn BackplaneObserver)) {
        for observer in self.observers() {
            if panic::catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                warn!(node = %self.node_id, "Backplane observer panicked");
            }
        }
    }

    async fn publish(&self, batch: Vec<Notification>) {
        let _guard = self.publish_lock.lock().await;
        if self.is_disposed() {
            trace!(node = %self.node_id, "Backplane disposed, publish skipped");
            return;
        }

        let payload = match serialize_batch(&self.node_id, &batch) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "Failed to serialize backplane batch");
                return;
            }
        };

        let bytes = payload.len();
        match self.topic.publish(payload, self.config.message_ttl).await {
            Ok(()) => debug!(
                node = %self.node_id,
                topic = %self.topic.name(),
                messages = batch.len(),
                bytes = bytes,
                "Backplane batch published"
            ),
            Err(e) => warn!(
                node = %self.node_id,
                topic = %self.topic.name(),
                error = %e,
                "Failed to publish backplane batch"
            ),
        }
    }

    fn dispatch_payload(&self, payload: &[u8]) {
        if self.is_disposed() {
            trace!(node = %self.node_id, "Backplane disposed, inbound payload ignored");
            return;
        }

        let messages = match deserialize_batch(payload) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(
                    node = %self.node_id,
                    bytes = payload.len(),
                    error = %e,
                    "Discarding malformed backplane batch"
                );
                return;
            }
        };

        for message in messages {
            if message.is_from(&self.node_id) {
                continue;
            }
            let origin = message.origin();
            match message.into_notification() {
                Notification::Changed { address, action } => {
                    trace!(
                        node = %self.node_id,
                        origin = %origin,
                        address = %address,
                        action = %action,
                        "Peer change"
                    );
                    self.for_each_observer(|o| o.on_changed(&address, action));
                }
                other => {
                    trace!(
                        node = %self.node_id,
                        origin = %origin,
                        action = ?other.action(),
                        "Ignoring structural message"
                    );
                }
            }
        }
    }
}

impl<S: BackingStore + 'static> Inner<S> {
    /// Publish an item this node's store client added. Store events arrive
    /// on a synchronous context, so the publish runs as its own task.
    fn publish_added(&self, address: CacheAddress) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    this.publish(vec![Notification::Changed {
                        address,
                        action: ChangeAction::Add,
                    }])
                    .await;
                });
            }
            Err(e) => warn!(
                node = %self.node_id,
                address = %address,
                error = %e,
                "No runtime to publish added item"
            ),
        }
    }
}

impl<S: BackingStore + 'static> ChangeSink for Inner<S> {
    fn on_change_event(&self, event: ChangeEvent) {
        if self.is_disposed() {
            return;
        }
        match event {
            ChangeEvent::Added(address) => self.publish_added(address),
            ChangeEvent::Removed(address, reason) => {
                self.for_each_observer(|o| o.on_removed(&address, reason));
            }
            ChangeEvent::Cleared => self.for_each_observer(|o| o.on_cleared()),
            ChangeEvent::RegionCleared(region) => {
                self.for_each_observer(|o| o.on_region_cleared(&region));
            }
        }
    }
}

/// One node's backplane.
///
/// Owns its topic subscription and the store connection it was given.
pub struct Backplane<S: BackingStore + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: BackingStore + 'static> Backplane<S> {
    /// Connect with the `region@key` codec.
    pub async fn connect(
        config: BackplaneConfig,
        store: S,
        bus: &dyn MessageBus,
    ) -> BackplaneResult<Self> {
        Self::connect_with_codec(config, store, bus, Arc::new(AtDelimitedCodec)).await
    }

    /// Validate the configuration, open the topic, subscribe to it and to
    /// the store's native events.
    pub async fn connect_with_codec(
        config: BackplaneConfig,
        store: S,
        bus: &dyn MessageBus,
        codec: Arc<dyn KeyCodec>,
    ) -> BackplaneResult<Self> {
        config.validate()?;
        if store.is_closed() {
            return Err(StoreError::ConnectionClosed.into());
        }

        let topic = bus.topic(&config.topic_name).await?;
        let backplane = Self {
            inner: Arc::new_cyclic(|this| Inner {
                this: this.clone(),
                node_id: NodeId::generate(),
                config,
                codec,
                store,
                topic,
                observers: RwLock::new(Vec::new()),
                publish_lock: tokio::sync::Mutex::new(()),
                dispose_lock: tokio::sync::Mutex::new(()),
                subscription: Mutex::new(None),
                listener: Mutex::new(None),
                state: AtomicU8::new(BackplaneState::Constructed.to_u8()),
            }),
        };

        if let Err(e) = backplane.activate().await {
            backplane.dispose().await;
            return Err(e);
        }
        Ok(backplane)
    }

    async fn activate(&self) -> BackplaneResult<()> {
        let inner = &self.inner;

        let weak = Arc::downgrade(inner);
        let handler: MessageHandler = Arc::new(move |payload: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch_payload(payload);
            }
        });
        let subscription = inner.topic.subscribe(handler).await?;
        if let Ok(mut slot) = inner.subscription.lock() {
            *slot = Some(subscription);
        }

        let source = ChangeEventSource::new(Arc::clone(&inner.codec), Arc::downgrade(inner));
        let listener = inner.store.register_listener(Arc::new(source))?;
        if let Ok(mut slot) = inner.listener.lock() {
            *slot = Some(listener);
        }

        inner.set_state(BackplaneState::Active);
        info!(
            node = %inner.node_id,
            label = inner.config.node_label.as_deref().unwrap_or("-"),
            topic = %inner.config.topic_name,
            "Backplane active"
        );
        Ok(())
    }

    /// This node's identifier.
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn config(&self) -> &BackplaneConfig {
        &self.inner.config
    }

    pub fn state(&self) -> BackplaneState {
        self.inner.state()
    }

    /// The store connection this backplane listens on.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Register an observer for every notification kind.
    pub fn subscribe(&self, observer: Arc<dyn BackplaneObserver>) {
        if let Ok(mut observers) = self.inner.observers.write() {
            observers.push(observer);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Tell peers a value changed. Never fails: publish problems are logged.
    pub async fn notify_change(&self, address: &CacheAddress, action: ChangeAction) {
        self.inner
            .publish(vec![Notification::Changed {
                address: address.clone(),
                action,
            }])
            .await;
    }

    /// Tell peers several values changed, in one message.
    pub async fn notify_changes(&self, changes: &[(CacheAddress, ChangeAction)]) {
        if changes.is_empty() {
            return;
        }
        let batch = changes
            .iter()
            .map(|(address, action)| Notification::Changed {
                address: address.clone(),
                action: *action,
            })
            .collect();
        self.inner.publish(batch).await;
    }

    /// Removals propagate through the store's own events.
    pub async fn notify_remove(&self, address: &CacheAddress) {
        trace!(node = %self.inner.node_id, address = %address, "Remove not broadcast");
    }

    /// Clears propagate through the store's own events.
    pub async fn notify_clear(&self) {
        trace!(node = %self.inner.node_id, "Clear not broadcast");
    }

    /// Region clears propagate through the store's own events.
    pub async fn notify_clear_region(&self, region: &str) {
        trace!(node = %self.inner.node_id, region = %region, "Region clear not broadcast");
    }

    /// Handle a payload delivered by the transport.
    ///
    /// Malformed payloads are logged and discarded. Messages sent by this
    /// node are skipped.
    pub fn dispatch_payload(&self, payload: &[u8]) {
        self.inner.dispatch_payload(payload);
    }

    /// Release the topic subscription, the topic handle and the store
    /// connection, in that order. Idempotent.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        let _guard = inner.dispose_lock.lock().await;
        if inner.is_disposed() {
            return;
        }
        inner.set_state(BackplaneState::Disposed);

        let subscription = inner.subscription.lock().ok().and_then(|mut s| s.take());
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await;
        }
        inner.topic.release().await;

        let listener = inner.listener.lock().ok().and_then(|mut l| l.take());
        if let Some(listener) = listener {
            inner.store.unregister_listener(listener);
        }
        inner.store.close().await;

        info!(node = %inner.node_id, "Backplane disposed");
    }
}

// =============================================================================
// TESTS
// =============================================================================
