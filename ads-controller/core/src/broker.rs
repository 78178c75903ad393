//! In-process publish/subscribe of control plane events.
//!
//! Delivery is lossy: publishing never blocks, and a message is dropped for any subscriber whose
//! buffer is full. Proxy updates are idempotent, so a subscriber that already has an update queued
//! loses nothing by missing another.
//!
//! Certificate rotations are published on per-certificate topics, so a proxy's stream only buffers
//! rotations of the certificates it serves. Any queued rotation leads to a full secret push, so a
//! rotation dropped behind another one for the same proxy is not lost either.
//!
//! Proxy update announcements are not published directly. They are sent to a [`Dispatcher`],
//! which coalesces bursts of announcements per topic before publishing a single update.

use crate::{CommonName, Proxy, ProxyIdentity, SerialNumber, ServiceIdentity, Uuid};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::sync::{Arc, Weak};
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};

/// Topic on which updates for all proxies are published.
pub const PROXY_UPDATE_TOPIC: &str = "proxy-update";

/// Prefix of the topics on which certificate rotations are published.
pub const CERTIFICATE_ROTATED_TOPIC: &str = "certificate-rotated";

/// Topic on which pod deletions are published.
pub const POD_DELETED_TOPIC: &str = "pod-deleted";

/// Returns the topic on which updates for a single proxy are published.
pub fn proxy_topic(uuid: &Uuid) -> String {
    format!("proxy:{uuid}")
}

/// Returns the topic on which rotations of the given certificate are published.
///
/// A proxy certificate has a topic of its own. Any other certificate is treated as a service
/// certificate, published on the topic of its `<service-account>.<namespace>` identity.
pub fn certificate_topic(cn: &CommonName) -> String {
    if ProxyIdentity::parse(cn).is_ok() {
        return format!("{CERTIFICATE_ROTATED_TOPIC}:{cn}");
    }
    let mut parts = cn.as_str().splitn(3, '.');
    match (parts.next(), parts.next()) {
        (Some(sa), Some(ns)) => format!("{CERTIFICATE_ROTATED_TOPIC}:{sa}.{ns}"),
        _ => format!("{CERTIFICATE_ROTATED_TOPIC}:{cn}"),
    }
}

fn service_certificate_topic(service: &ServiceIdentity) -> String {
    format!("{CERTIFICATE_ROTATED_TOPIC}:{service}")
}

/// Announces that proxy configuration must be recomputed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyUpdate {
    /// The number of announcements coalesced into this update.
    pub announcements: usize,
}

/// Announces that a proxy certificate was reissued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRotated {
    pub cn: CommonName,
    pub serial: Option<SerialNumber>,
}

/// Announces that a pod was deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodDeleted {
    pub uid: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Copy, Clone, Debug)]
pub struct BrokerConfig {
    /// Buffered messages per subscriber before messages are dropped.
    pub subscriber_capacity: usize,

    /// An announcement is published once no further announcement has arrived on its topic for
    /// this long.
    pub sliding_window: Duration,

    /// An announcement is published at most this long after the first unpublished announcement
    /// on its topic, even if announcements continue to arrive.
    pub max_window: Duration,
}

/// Event channels shared by all proxy streams.
#[derive(Clone, Debug)]
pub struct Broker {
    updates: PubSub<ProxyUpdate>,
    certificates: PubSub<CertificateRotated>,
    pods: PubSub<PodDeleted>,
    announcements: mpsc::UnboundedSender<String>,
}

/// Coalesces proxy update announcements and publishes them.
#[derive(Debug)]
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<String>,
    updates: PubSub<ProxyUpdate>,
    sliding_window: Duration,
    max_window: Duration,
}

/// A generic lossy topic-based message bus.
#[derive(Debug)]
pub struct PubSub<T> {
    topics: Arc<Mutex<Topics<T>>>,
    capacity: usize,
    metrics: BrokerMetrics,
}

/// Receives messages published on one or more topics. Unsubscribes when dropped.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    id: u64,
    topics: Vec<String>,
    registry: Weak<Mutex<Topics<T>>>,
}

#[derive(Clone, Debug, Default)]
pub struct BrokerMetrics {
    published: Family<TopicLabels, Counter>,
    delivered: Family<TopicLabels, Counter>,
    dropped: Family<TopicLabels, Counter>,
    coalesced: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TopicLabels {
    topic: String,
}

#[derive(Debug)]
struct Topics<T> {
    next_id: u64,
    subscribers: HashMap<String, HashMap<u64, mpsc::Sender<T>>>,
}

#[derive(Debug)]
struct Pending {
    first: Instant,
    last: Instant,
    announcements: usize,
}

// === impl BrokerConfig ===

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 64,
            sliding_window: Duration::from_secs(2),
            max_window: Duration::from_secs(10),
        }
    }
}

// === impl Broker ===

impl Broker {
    pub fn new(config: BrokerConfig, metrics: BrokerMetrics) -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let updates = PubSub::new(config.subscriber_capacity, metrics.clone());
        let broker = Self {
            updates: updates.clone(),
            certificates: PubSub::new(config.subscriber_capacity, metrics.clone()),
            pods: PubSub::new(config.subscriber_capacity, metrics),
            announcements: tx,
        };
        let dispatcher = Dispatcher {
            rx,
            updates,
            sliding_window: config.sliding_window,
            max_window: config.max_window.max(config.sliding_window),
        };
        (broker, dispatcher)
    }

    /// Requests that all proxies be updated.
    pub fn announce_all(&self) {
        self.announce(PROXY_UPDATE_TOPIC.to_string());
    }

    /// Requests that a single proxy be updated.
    pub fn announce_proxy(&self, uuid: &Uuid) {
        self.announce(proxy_topic(uuid));
    }

    fn announce(&self, topic: String) {
        if self.announcements.send(topic).is_err() {
            tracing::debug!("Proxy update dispatcher has shut down");
        }
    }

    /// Subscribes to updates that apply to the given proxy.
    pub fn subscribe_proxy_updates(&self, uuid: &Uuid) -> Subscription<ProxyUpdate> {
        self.updates
            .subscribe([PROXY_UPDATE_TOPIC.to_string(), proxy_topic(uuid)])
    }

    pub fn publish_certificate_rotated(&self, rotated: CertificateRotated) {
        let topic = certificate_topic(&rotated.cn);
        self.certificates.publish(&topic, rotated);
    }

    /// Subscribes to rotations of the proxy's own certificate and of its service certificate.
    pub fn subscribe_certificate_rotations(
        &self,
        proxy: &Proxy,
    ) -> Subscription<CertificateRotated> {
        self.certificates.subscribe([
            certificate_topic(proxy.common_name()),
            service_certificate_topic(&proxy.identity().service),
        ])
    }

    pub fn publish_pod_deleted(&self, deleted: PodDeleted) {
        self.pods.publish(POD_DELETED_TOPIC, deleted);
    }

    pub fn subscribe_pod_deletions(&self) -> Subscription<PodDeleted> {
        self.pods.subscribe([POD_DELETED_TOPIC.to_string()])
    }
}

// === impl Dispatcher ===

impl Dispatcher {
    /// Publishes coalesced announcements until all [`Broker`] handles are dropped. Pending
    /// announcements are flushed before returning.
    pub async fn run(mut self) {
        let mut pending = HashMap::<String, Pending>::default();
        loop {
            let deadline = pending
                .values()
                .map(|p| self.deadline(p))
                .min();

            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(topic) => {
                        let now = Instant::now();
                        let p = pending.entry(topic).or_insert(Pending {
                            first: now,
                            last: now,
                            announcements: 0,
                        });
                        p.last = now;
                        p.announcements += 1;
                    }
                    None => {
                        for (topic, p) in pending.drain() {
                            self.publish(&topic, p);
                        }
                        tracing::debug!("Proxy update dispatcher shutting down");
                        return;
                    }
                },

                () = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let now = Instant::now();
                    let due = pending
                        .iter()
                        .filter(|(_, p)| self.deadline(p) <= now)
                        .map(|(t, _)| t.clone())
                        .collect::<Vec<_>>();
                    for topic in due {
                        if let Some(p) = pending.remove(&topic) {
                            self.publish(&topic, p);
                        }
                    }
                }
            }
        }
    }

    fn deadline(&self, p: &Pending) -> Instant {
        (p.last + self.sliding_window).min(p.first + self.max_window)
    }

    fn publish(&self, topic: &str, p: Pending) {
        tracing::debug!(%topic, announcements = p.announcements, "Publishing proxy update");
        self.updates
            .metrics
            .coalesced
            .inc_by(p.announcements.saturating_sub(1) as u64);
        self.updates.publish(
            topic,
            ProxyUpdate {
                announcements: p.announcements,
            },
        );
    }
}

// === impl PubSub ===

impl<T> PubSub<T> {
    pub fn new(capacity: usize, metrics: BrokerMetrics) -> Self {
        Self {
            topics: Arc::new(Mutex::new(Topics {
                next_id: 0,
                subscribers: HashMap::default(),
            })),
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Subscribes a single receiver to all of the given topics.
    pub fn subscribe(&self, topics: impl IntoIterator<Item = String>) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let topics = topics.into_iter().collect::<Vec<_>>();

        let mut registry = self.topics.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        for topic in &topics {
            registry
                .subscribers
                .entry(topic.clone())
                .or_default()
                .insert(id, tx.clone());
        }
        drop(registry);

        Subscription {
            rx,
            id,
            topics,
            registry: Arc::downgrade(&self.topics),
        }
    }

    pub fn subscribers(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .subscribers
            .get(topic)
            .map_or(0, |s| s.len())
    }
}

impl<T: Clone> PubSub<T> {
    /// Delivers a message to every subscriber of the topic without waiting.
    pub fn publish(&self, topic: &str, msg: T) {
        let labels = TopicLabels::new(topic);
        self.metrics.published.get_or_create(&labels).inc();

        let mut registry = self.topics.lock();
        let Some(subscribers) = registry.subscribers.get_mut(topic) else {
            return;
        };
        subscribers.retain(|id, tx| match tx.try_send(msg.clone()) {
            Ok(()) => {
                self.metrics.delivered.get_or_create(&labels).inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(%topic, subscriber = id, "Subscriber is lagging; dropping message");
                self.metrics.dropped.get_or_create(&labels).inc();
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            registry.subscribers.remove(topic);
        }
    }
}

impl<T> Clone for PubSub<T> {
    fn clone(&self) -> Self {
        Self {
            topics: self.topics.clone(),
            capacity: self.capacity,
            metrics: self.metrics.clone(),
        }
    }
}

// === impl Subscription ===

impl<T> Subscription<T> {
    /// Receives the next message. Returns `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Unsubscribes from all topics. Safe to call whether or not any message was received.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();
        for topic in &self.topics {
            if let Some(subscribers) = registry.subscribers.get_mut(topic) {
                subscribers.remove(&self.id);
                if subscribers.is_empty() {
                    registry.subscribers.remove(topic);
                }
            }
        }
    }
}

// === impl BrokerMetrics ===

impl BrokerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "published",
            "Count of messages published, by topic",
            metrics.published.clone(),
        );
        prom.register(
            "delivered",
            "Count of messages delivered to subscribers, by topic",
            metrics.delivered.clone(),
        );
        prom.register(
            "dropped",
            "Count of messages dropped because a subscriber was lagging, by topic",
            metrics.dropped.clone(),
        );
        prom.register(
            "coalesced_announcements",
            "Count of proxy update announcements folded into an earlier announcement",
            metrics.coalesced.clone(),
        );
        metrics
    }
}

impl TopicLabels {
    // Per-proxy and per-certificate topics are aggregated to bound label cardinality.
    fn new(topic: &str) -> Self {
        let topic = match topic.split_once(':') {
            Some((prefix, _)) => prefix,
            None => topic,
        };
        Self {
            topic: topic.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(sliding: u64, max: u64) -> (Broker, Dispatcher) {
        Broker::new(
            BrokerConfig {
                subscriber_capacity: 4,
                sliding_window: Duration::from_secs(sliding),
                max_window: Duration::from_secs(max),
            },
            BrokerMetrics::default(),
        )
    }

    #[tokio::test]
    async fn publishes_to_all_topic_subscribers() {
        let bus = PubSub::<u32>::new(4, BrokerMetrics::default());
        let mut a = bus.subscribe(["a".to_string()]);
        let mut ab = bus.subscribe(["a".to_string(), "b".to_string()]);

        bus.publish("a", 1);
        bus.publish("b", 2);
        bus.publish("c", 3);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.try_recv(), None);
        assert_eq!(ab.recv().await, Some(1));
        assert_eq!(ab.recv().await, Some(2));
        assert_eq!(ab.try_recv(), None);
    }

    #[tokio::test]
    async fn drops_messages_for_lagging_subscribers() {
        let metrics = BrokerMetrics::default();
        let bus = PubSub::<u32>::new(1, metrics.clone());
        let mut sub = bus.subscribe(["a".to_string()]);

        bus.publish("a", 1);
        bus.publish("a", 2);

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.try_recv(), None);
        let labels = TopicLabels::new("a");
        assert_eq!(metrics.dropped.get_or_create(&labels).get(), 1);
        assert_eq!(metrics.delivered.get_or_create(&labels).get(), 1);
    }

    #[test]
    fn unsubscribes_on_drop() {
        let bus = PubSub::<u32>::new(1, BrokerMetrics::default());
        let sub = bus.subscribe(["a".to_string(), "b".to_string()]);
        let other = bus.subscribe(["a".to_string()]);
        assert_eq!(bus.subscribers("a"), 2);
        assert_eq!(bus.subscribers("b"), 1);

        sub.unsubscribe();
        assert_eq!(bus.subscribers("a"), 1);
        assert_eq!(bus.subscribers("b"), 0);

        drop(other);
        assert_eq!(bus.subscribers("a"), 0);
        bus.publish("a", 1);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_announcements_within_sliding_window() {
        let (broker, dispatcher) = broker(2, 10);
        let uuid = Uuid::new_v4();
        let mut updates = broker.subscribe_proxy_updates(&uuid);
        let dispatcher = tokio::spawn(dispatcher.run());

        for _ in 0..3 {
            broker.announce_all();
            time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(updates.try_recv(), None);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            updates.try_recv(),
            Some(ProxyUpdate { announcements: 3 })
        );
        assert_eq!(updates.try_recv(), None);

        drop(broker);
        dispatcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn max_window_bounds_publication_delay() {
        let (broker, dispatcher) = broker(3, 5);
        let uuid = Uuid::new_v4();
        let mut updates = broker.subscribe_proxy_updates(&uuid);
        tokio::spawn(dispatcher.run());

        // Announce every second, never letting the sliding window elapse.
        for _ in 0..4 {
            broker.announce_proxy(&uuid);
            time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(updates.try_recv(), None);

        // The sliding window alone would publish at 6s.
        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            updates.try_recv(),
            Some(ProxyUpdate { announcements: 4 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn targeted_announcements_reach_only_their_proxy() {
        let (broker, dispatcher) = broker(1, 5);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut updates_a = broker.subscribe_proxy_updates(&a);
        let mut updates_b = broker.subscribe_proxy_updates(&b);
        tokio::spawn(dispatcher.run());

        broker.announce_proxy(&a);
        time::sleep(Duration::from_secs(2)).await;

        assert_eq!(
            updates_a.try_recv(),
            Some(ProxyUpdate { announcements: 1 })
        );
        assert_eq!(updates_b.try_recv(), None);
    }

    #[tokio::test]
    async fn flushes_pending_announcements_on_shutdown() {
        let (broker, dispatcher) = broker(60, 600);
        let uuid = Uuid::new_v4();
        let mut updates = broker.subscribe_proxy_updates(&uuid);
        let dispatcher = tokio::spawn(dispatcher.run());

        broker.announce_all();
        // Keep the bus alive while dropping the announcing handle.
        let bus = broker.updates.clone();
        drop(broker);
        dispatcher.await.unwrap();

        assert_eq!(updates.recv().await, Some(ProxyUpdate { announcements: 1 }));
        drop(bus);
    }

    const BOOKBUYER: &str =
        "0b2c0a1e-6f5e-4e3b-9d39-7f4b2a8c1d10.sidecar.bookbuyer.bookstore.cluster.local";

    fn proxy(cn: &str) -> Proxy {
        let cn = CommonName::from(cn);
        let identity = ProxyIdentity::parse(&cn).expect("common name must parse");
        Proxy::new(cn, identity, SerialNumber::new("01"), None)
    }

    #[test]
    fn certificate_topics() {
        assert_eq!(
            certificate_topic(&CommonName::from(BOOKBUYER)),
            format!("certificate-rotated:{BOOKBUYER}")
        );
        assert_eq!(
            certificate_topic(&CommonName::from("bookbuyer.bookstore.cluster.local")),
            "certificate-rotated:bookbuyer.bookstore"
        );
        assert_eq!(
            TopicLabels::new(&certificate_topic(&CommonName::from("a.b.c"))).topic,
            "certificate-rotated"
        );
    }

    #[tokio::test]
    async fn delivers_certificate_rotations_and_pod_deletions() {
        let (broker, _dispatcher) = broker(1, 1);
        let mut rotations = broker.subscribe_certificate_rotations(&proxy(BOOKBUYER));
        let mut deletions = broker.subscribe_pod_deletions();

        let rotated = CertificateRotated {
            cn: CommonName::from(BOOKBUYER),
            serial: Some(SerialNumber::new("0a")),
        };
        broker.publish_certificate_rotated(rotated.clone());
        let deleted = PodDeleted {
            uid: "uid".to_string(),
            namespace: "ns".to_string(),
            name: "pod".to_string(),
        };
        broker.publish_pod_deleted(deleted.clone());

        assert_eq!(rotations.recv().await, Some(rotated));
        assert_eq!(deletions.recv().await, Some(deleted));
    }

    #[tokio::test]
    async fn rotations_of_other_identities_do_not_crowd_out_a_proxys_own() {
        let (broker, _dispatcher) = Broker::new(BrokerConfig::default(), BrokerMetrics::default());
        let proxy = proxy(BOOKBUYER);
        let mut rotations = broker.subscribe_certificate_rotations(&proxy);

        // The subscriber is not draining while many other services rotate.
        for i in 0..BrokerConfig::default().subscriber_capacity * 2 {
            broker.publish_certificate_rotated(CertificateRotated {
                cn: CommonName::from(format!("svc{i}.ns.cluster.local")),
                serial: None,
            });
        }
        let own = CertificateRotated {
            cn: CommonName::from("bookbuyer.bookstore.cluster.local"),
            serial: None,
        };
        broker.publish_certificate_rotated(own.clone());

        assert_eq!(rotations.recv().await, Some(own));
        assert_eq!(rotations.try_recv(), None);
    }

    #[tokio::test]
    async fn delivers_rotations_of_the_proxy_certificate_only_to_that_proxy() {
        let (broker, _dispatcher) = broker(1, 1);
        let bookbuyer = proxy(BOOKBUYER);
        let sibling =
            proxy("6a1bd2f0-1c55-4d3e-a1a8-2c4b8e1f0a77.sidecar.bookbuyer.bookstore.cluster.local");
        let mut rotations = broker.subscribe_certificate_rotations(&bookbuyer);
        let mut sibling_rotations = broker.subscribe_certificate_rotations(&sibling);

        let rotated = CertificateRotated {
            cn: bookbuyer.common_name().clone(),
            serial: None,
        };
        broker.publish_certificate_rotated(rotated.clone());

        assert_eq!(rotations.recv().await, Some(rotated));
        assert_eq!(sibling_rotations.try_recv(), None);
    }
}
