//! Topic-keyed publish/subscribe registry.
//!
//! [`PubSub`] keeps a table of subscriber callbacks keyed by topic and an
//! integer [`SubscriptionHandle`]. Publishing snapshots the current
//! subscribers of a topic under the table lock and hands the delivery to a
//! single dispatcher task, so `publish` never waits on subscribers and
//! every subscriber observes its topic in publish order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::PubSubError;

/// Opaque identifier returned by [`PubSubEngine::subscribe`].
///
/// Handles are unique for the lifetime of the bus that issued them and
/// increase monotonically, so ordering by handle is ordering by
/// subscription time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Returns the raw integer value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscriber callback invoked once per delivered payload.
///
/// Callbacks run on the dispatcher task and must not block. Returning an
/// error (or panicking) only affects the current delivery to this
/// subscriber.
pub type Callback = Arc<dyn Fn(&Value) -> Result<(), PubSubError> + Send + Sync>;

/// Contract of an event bus backend, in-process or external broker.
#[async_trait]
pub trait PubSubEngine: Send + Sync + fmt::Debug {
    /// Delivers `payload` to every subscriber currently registered on
    /// `topic`. Returns without waiting for the deliveries to finish.
    ///
    /// # Errors
    ///
    /// Returns a [`PubSubError`] if the backend cannot accept the publish.
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PubSubError>;

    /// Registers `callback` for `topic`.
    ///
    /// # Errors
    ///
    /// Returns a [`PubSubError`] if the backend cannot register the
    /// subscription.
    async fn subscribe(
        &self,
        topic: &str,
        callback: Callback,
    ) -> Result<SubscriptionHandle, PubSubError>;

    /// Removes a subscription. Unknown handles are ignored.
    ///
    /// Never suspends, so it can run from `Drop`.
    fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Opens the backend connection. No-op for in-process buses.
    ///
    /// # Errors
    ///
    /// Returns a [`PubSubError`] if the backend cannot be reached.
    async fn connect(&self) -> Result<(), PubSubError> {
        Ok(())
    }

    /// Closes the backend connection. No-op for in-process buses.
    ///
    /// # Errors
    ///
    /// Returns a [`PubSubError`] if the backend fails to shut down cleanly.
    async fn disconnect(&self) -> Result<(), PubSubError> {
        Ok(())
    }
}

/// One queued publish: the payload plus the subscribers registered on the
/// topic at publish time.
struct Delivery {
    topic: String,
    payload: Arc<Value>,
    targets: Vec<SubscriptionHandle>,
}

#[derive(Default)]
struct Table {
    /// Per-topic subscribers, ordered by handle.
    topics: HashMap<String, BTreeMap<SubscriptionHandle, Callback>>,
    /// Reverse index used by `unsubscribe`.
    owners: HashMap<SubscriptionHandle, String>,
}

impl Table {
    fn insert(&mut self, handle: SubscriptionHandle, topic: &str, callback: Callback) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(handle, callback);
        self.owners.insert(handle, topic.to_string());
    }

    fn remove(&mut self, handle: SubscriptionHandle) -> bool {
        let Some(topic) = self.owners.remove(&handle) else {
            return false;
        };
        if let Some(subscribers) = self.topics.get_mut(&topic) {
            subscribers.remove(&handle);
            if subscribers.is_empty() {
                self.topics.remove(&topic);
            }
        }
        true
    }

    fn handles(&self, topic: &str) -> Vec<SubscriptionHandle> {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.keys().copied().collect())
            .unwrap_or_default()
    }

    fn callback(&self, handle: SubscriptionHandle) -> Option<Callback> {
        let topic = self.owners.get(&handle)?;
        self.topics
            .get(topic)
            .and_then(|subscribers| subscribers.get(&handle))
            .map(Arc::clone)
    }
}

struct Inner {
    table: Mutex<Table>,
    next_handle: AtomicU64,
    queue: Mutex<mpsc::UnboundedSender<Delivery>>,
    /// Receiving end of `queue`, moved into the dispatcher on first publish.
    pending_dispatcher: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("Inner")
            .field("topics", &table.topics.len())
            .field("subscribers", &table.owners.len())
            .field("next_handle", &self.next_handle.load(Ordering::Relaxed))
            .finish()
    }
}

/// In-process publish/subscribe bus.
///
/// Cheap to clone; all clones share one subscriber table. The dispatcher
/// task is spawned lazily on the first publish, so a `PubSub` can be built
/// outside a Tokio runtime. If the runtime running the dispatcher shuts
/// down, the next publish spawns a fresh one on the caller's runtime;
/// deliveries queued on the old one are lost.
#[derive(Debug, Clone)]
pub struct PubSub {
    inner: Arc<Inner>,
}

impl PubSub {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table::default()),
                next_handle: AtomicU64::new(1),
                queue: Mutex::new(queue),
                pending_dispatcher: Mutex::new(Some(rx)),
            }),
        }
    }

    /// Returns the total number of live subscriptions across all topics.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.table.lock().owners.len()
    }

    /// Returns the number of live subscriptions on `topic`.
    #[must_use]
    pub fn topic_subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .table
            .lock()
            .topics
            .get(topic)
            .map_or(0, BTreeMap::len)
    }

    /// Returns a snapshot of every topic with at least one subscriber and
    /// its subscriber count, sorted by topic.
    #[must_use]
    pub fn topics(&self) -> BTreeMap<String, usize> {
        self.inner
            .table
            .lock()
            .topics
            .iter()
            .map(|(topic, subscribers)| (topic.clone(), subscribers.len()))
            .collect()
    }

    /// Returns `true` if `handle` is currently subscribed.
    #[must_use]
    pub fn is_subscribed(&self, handle: SubscriptionHandle) -> bool {
        self.inner.table.lock().owners.contains_key(&handle)
    }

    fn ensure_dispatcher(&self) {
        let mut queue = self.inner.queue.lock();
        if queue.is_closed() {
            tracing::warn!("pubsub dispatcher stopped, respawning");
            let (tx, rx) = mpsc::unbounded_channel();
            *queue = tx;
            *self.inner.pending_dispatcher.lock() = Some(rx);
        }
        drop(queue);
        if let Some(rx) = self.inner.pending_dispatcher.lock().take() {
            tokio::spawn(dispatch_loop(Arc::downgrade(&self.inner), rx));
        }
    }

    fn enqueue(&self, topic: &str, payload: Value) -> Result<(), PubSubError> {
        let table = self.inner.table.lock();
        let targets = table.handles(topic);
        if targets.is_empty() {
            tracing::trace!(topic, "publish without subscribers");
            return Ok(());
        }
        // Enqueue while holding the table lock so queue order matches the
        // order in which snapshots were taken.
        self.inner
            .queue
            .lock()
            .send(Delivery {
                topic: topic.to_string(),
                payload: Arc::new(payload),
                targets,
            })
            .map_err(|_| PubSubError::Backend("dispatcher stopped".to_string()))
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubEngine for PubSub {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PubSubError> {
        self.ensure_dispatcher();
        self.enqueue(topic, payload)
    }

    async fn subscribe(
        &self,
        topic: &str,
        callback: Callback,
    ) -> Result<SubscriptionHandle, PubSubError> {
        let handle = SubscriptionHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        self.inner.table.lock().insert(handle, topic, callback);
        tracing::debug!(topic, %handle, "subscribed");
        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self.inner.table.lock().remove(handle) {
            tracing::debug!(%handle, "unsubscribed");
        }
    }
}

/// Drains the delivery queue until every [`PubSub`] clone is dropped.
async fn dispatch_loop(bus: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        let Some(inner) = bus.upgrade() else {
            break;
        };
        // Subscribers removed since the publish are skipped.
        let callbacks: Vec<(SubscriptionHandle, Callback)> = {
            let table = inner.table.lock();
            delivery
                .targets
                .iter()
                .filter_map(|handle| table.callback(*handle).map(|cb| (*handle, cb)))
                .collect()
        };
        drop(inner);

        for (handle, callback) in callbacks {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                callback(delivery.payload.as_ref())
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(topic = %delivery.topic, %handle, error = %err, "subscriber callback failed");
                }
                Err(_) => {
                    tracing::warn!(topic = %delivery.topic, %handle, "subscriber callback panicked");
                }
            }
        }
    }
    tracing::debug!("pubsub dispatcher stopped");
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn channel_callback() -> (Callback, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: Callback = Arc::new(move |payload: &Value| {
            tx.send(payload.clone())
                .map_err(|_| PubSubError::Callback("receiver dropped".to_string()))
        });
        (callback, rx)
    }

    fn noop() -> Callback {
        Arc::new(|_: &Value| -> Result<(), PubSubError> { Ok(()) })
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        let Ok(Some(value)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await else {
            panic!("expected a delivery");
        };
        value
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Value>) {
        let outcome = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(outcome.is_err(), "unexpected delivery: {outcome:?}");
    }

    async fn subscribe(bus: &PubSub, topic: &str, callback: Callback) -> SubscriptionHandle {
        let Ok(handle) = bus.subscribe(topic, callback).await else {
            panic!("subscribe failed");
        };
        handle
    }

    #[tokio::test]
    async fn handles_are_unique_and_increasing() {
        let bus = PubSub::new();
        let a = subscribe(&bus, "A", noop()).await;
        let b = subscribe(&bus, "A", noop()).await;
        bus.unsubscribe(a);
        let c = subscribe(&bus, "B", noop()).await;
        assert!(a < b && b < c);
        assert_eq!(a.get(), 1);
    }

    #[tokio::test]
    async fn live_set_tracks_subscribe_and_unsubscribe() {
        let bus = PubSub::new();
        let mut live = BTreeSet::new();
        for topic in ["A", "B", "A", "C"] {
            live.insert(subscribe(&bus, topic, noop()).await);
        }
        let Some(first) = live.iter().next().copied() else {
            panic!("no handles");
        };
        bus.unsubscribe(first);
        live.remove(&first);

        assert_eq!(bus.subscriber_count(), live.len());
        for handle in &live {
            assert!(bus.is_subscribed(*handle));
        }
        assert!(!bus.is_subscribed(first));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_handle_is_noop() {
        let bus = PubSub::new();
        let handle = subscribe(&bus, "A", noop()).await;
        bus.unsubscribe(SubscriptionHandle(999));
        bus.unsubscribe(handle);
        bus.unsubscribe(handle);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.topics().is_empty());
    }

    #[tokio::test]
    async fn dispatcher_respawns_after_its_runtime_stops() {
        let bus = PubSub::new();
        let (callback, mut rx) = channel_callback();
        subscribe(&bus, "T", callback).await;

        let other = bus.clone();
        let worker = std::thread::spawn(move || {
            let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            else {
                panic!("cannot build runtime");
            };
            runtime.block_on(async {
                let _ = other.publish("T", json!(0)).await;
            });
        });
        let Ok(()) = worker.join() else {
            panic!("worker thread panicked");
        };

        assert!(bus.publish("T", json!(1)).await.is_ok());
        let mut received = recv(&mut rx).await;
        if received == json!(0) {
            received = recv(&mut rx).await;
        }
        assert_eq!(received, json!(1));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = PubSub::new();
        let result = bus.publish("NOBODY", json!({"x": 1})).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn publish_reaches_only_matching_topic() {
        let bus = PubSub::new();
        let (post_cb, mut post_rx) = channel_callback();
        let (other_cb, mut other_rx) = channel_callback();
        subscribe(&bus, "POST_ADDED", post_cb).await;
        subscribe(&bus, "OTHER", other_cb).await;

        let result = bus.publish("POST_ADDED", json!({"author": "Jack"})).await;
        assert!(result.is_ok());

        assert_eq!(recv(&mut post_rx).await, json!({"author": "Jack"}));
        assert_silent(&mut post_rx).await;
        assert_silent(&mut other_rx).await;
    }

    #[tokio::test]
    async fn subscriber_sees_publishes_in_order() {
        let bus = PubSub::new();
        let (cb, mut rx) = channel_callback();
        subscribe(&bus, "T", cb).await;

        for i in 0..50 {
            let _ = bus.publish("T", json!(i)).await;
            let _ = bus.publish("NOISE", json!(i)).await;
        }
        for i in 0..50 {
            assert_eq!(recv(&mut rx).await, json!(i));
        }
    }

    #[tokio::test]
    async fn fan_out_follows_subscription_order() {
        let bus = PubSub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for name in ["first", "second", "third"] {
            let tx = tx.clone();
            let cb: Callback = Arc::new(move |_: &Value| -> Result<(), PubSubError> {
                let _ = tx.send(json!(name));
                Ok(())
            });
            subscribe(&bus, "T", cb).await;
        }
        let _ = bus.publish("T", json!({})).await;

        assert_eq!(recv(&mut rx).await, json!("first"));
        assert_eq!(recv(&mut rx).await, json!("second"));
        assert_eq!(recv(&mut rx).await, json!("third"));
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others() {
        let bus = PubSub::new();
        let failing: Callback = Arc::new(|_: &Value| -> Result<(), PubSubError> {
            Err(PubSubError::Callback("boom".to_string()))
        });
        let panicking: Callback =
            Arc::new(|_: &Value| -> Result<(), PubSubError> { panic!("subscriber bug") });
        let (cb, mut rx) = channel_callback();
        subscribe(&bus, "T", failing).await;
        subscribe(&bus, "T", panicking).await;
        subscribe(&bus, "T", cb).await;

        assert!(bus.publish("T", json!(1)).await.is_ok());
        assert!(bus.publish("T", json!(2)).await.is_ok());
        assert_eq!(recv(&mut rx).await, json!(1));
        assert_eq!(recv(&mut rx).await, json!(2));
    }

    #[tokio::test]
    async fn unsubscribed_callback_receives_nothing() {
        let bus = PubSub::new();
        let (cb, mut rx) = channel_callback();
        let handle = subscribe(&bus, "T", cb).await;
        bus.unsubscribe(handle);
        let _ = bus.publish("T", json!(1)).await;
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn topics_snapshot_counts_subscribers() {
        let bus = PubSub::new();
        subscribe(&bus, "B", noop()).await;
        subscribe(&bus, "A", noop()).await;
        subscribe(&bus, "A", noop()).await;
        let topics = bus.topics();
        assert_eq!(topics.get("A"), Some(&2));
        assert_eq!(topics.get("B"), Some(&1));
        assert_eq!(bus.topic_subscriber_count("A"), 2);
        assert_eq!(bus.topic_subscriber_count("C"), 0);
    }
}
