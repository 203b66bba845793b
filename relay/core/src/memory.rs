//! In-Process Backends
//!
//! Implementations of every store seam that live entirely in memory:
//!
//! - [`MemoryBroker`]: key/value + list records with expiry, and channel
//!   fan-out. Shared by every socket a [`MemoryConnector`] opens.
//! - [`MemoryConnector`]: a [`Connector`] with fault injection (refused
//!   connects, socket error and close events, connect latency) and
//!   per-role connect counters.
//! - [`MemoryKv`]: a [`KvStore`] for the active-stream registry.
//!
//! Expiry uses `tokio::time::Instant`, so tests drive it with a paused clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::pubsub::{Publisher, StoreError, Subscriber, Subscription};
use crate::registry::KvStore;
use crate::supervisor::{Connector, SocketEvents, SocketRole};

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, Debug)]
enum RecordValue {
    Value(Bytes),
    List(Vec<Bytes>),
}

#[derive(Clone, Debug)]
struct Record {
    value: RecordValue,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

fn deadline(expiry: Option<Duration>) -> Option<Instant> {
    expiry.map(|ttl| Instant::now() + ttl)
}

// ============================================================================
// Broker
// ============================================================================

struct Route {
    id: u64,
    socket_id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct BrokerInner {
    records: DashMap<String, Record>,
    routes: Mutex<HashMap<String, Vec<Route>>>,
    next_id: AtomicU64,
    fail_sets: AtomicBool,
    fail_publishes: AtomicBool,
}

/// An in-memory pub/sub key-value store
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create an empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `set` fail with a command error
    pub fn fail_sets(&self, fail: bool) {
        self.inner.fail_sets.store(fail, Ordering::SeqCst);
    }

    /// Make every `publish` fail with a connection error
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Whether a live record exists under `key`
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Remaining lifetime of the record under `key`
    ///
    /// `None` when the key is absent or has no expiry.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let record = self.live(key)?;
        record
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Number of active subscriptions on `channel`
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner.routes.lock().get(channel).map_or(0, Vec::len)
    }

    /// A publisher that is not managed by any connector
    #[must_use]
    pub fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(MemoryPublisher {
            broker: self.clone(),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    /// A subscriber that is not managed by any connector
    #[must_use]
    pub fn subscriber(&self) -> Arc<dyn Subscriber> {
        Arc::new(MemorySubscriber {
            broker: self.clone(),
            socket_id: self.next_id(),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn live(&self, key: &str) -> Option<Record> {
        let now = Instant::now();
        let record = self.inner.records.get(key)?.clone();
        if record.is_live(now) {
            Some(record)
        } else {
            self.inner.records.remove_if(key, |_, r| !r.is_live(now));
            None
        }
    }

    fn set(&self, key: &str, value: &[u8], expiry: Option<Duration>) -> Result<(), StoreError> {
        if self.inner.fail_sets.load(Ordering::SeqCst) {
            return Err(StoreError::Command("OOM command not allowed".to_string()));
        }
        self.inner.records.insert(
            key.to_string(),
            Record {
                value: RecordValue::Value(Bytes::copy_from_slice(value)),
                expires_at: deadline(expiry),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Record {
                value: RecordValue::Value(value),
                ..
            }) => Ok(Some(value)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn append(&self, key: &str, value: &[u8], expiry: Option<Duration>) -> Result<u64, StoreError> {
        // Drop an expired record first so the append starts a fresh list
        let _ = self.live(key);

        let mut entry = self
            .inner
            .records
            .entry(key.to_string())
            .or_insert_with(|| Record {
                value: RecordValue::List(Vec::new()),
                expires_at: None,
            });

        let RecordValue::List(items) = &mut entry.value else {
            return Err(wrong_type());
        };
        items.push(Bytes::copy_from_slice(value));
        let len = items.len() as u64;
        if expiry.is_some() {
            entry.expires_at = deadline(expiry);
        }
        Ok(len)
    }

    fn range(&self, key: &str) -> Result<Vec<Bytes>, StoreError> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Record {
                value: RecordValue::List(items),
                ..
            }) => Ok(items),
            Some(_) => Err(wrong_type()),
        }
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, StoreError> {
        if self.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("broken pipe".to_string()));
        }
        let payload = Bytes::copy_from_slice(payload);
        let mut routes = self.inner.routes.lock();
        let Some(subscribers) = routes.get_mut(channel) else {
            return Ok(0);
        };
        subscribers.retain(|route| route.tx.send(payload.clone()).is_ok());
        Ok(subscribers.len() as u64)
    }

    fn subscribe(&self, channel: &str, socket_id: u64) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        self.inner
            .routes
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(Route { id, socket_id, tx });

        let broker = self.clone();
        let owned = channel.to_string();
        Subscription::new(channel, rx).on_drop(move || broker.unroute(&owned, id))
    }

    fn unroute(&self, channel: &str, id: u64) {
        let mut routes = self.inner.routes.lock();
        if let Some(subscribers) = routes.get_mut(channel) {
            subscribers.retain(|route| route.id != id);
            if subscribers.is_empty() {
                routes.remove(channel);
            }
        }
    }

    /// Close every subscription opened through socket `socket_id`
    fn drop_socket_routes(&self, socket_id: u64) {
        let mut routes = self.inner.routes.lock();
        for subscribers in routes.values_mut() {
            subscribers.retain(|route| route.socket_id != socket_id);
        }
        routes.retain(|_, subscribers| !subscribers.is_empty());
    }
}

fn wrong_type() -> StoreError {
    StoreError::Command(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

fn closed() -> StoreError {
    StoreError::Connection("socket closed".to_string())
}

// ============================================================================
// Sockets
// ============================================================================

struct MemoryPublisher {
    broker: MemoryBroker,
    alive: Arc<AtomicBool>,
}

impl MemoryPublisher {
    fn check(&self) -> Result<&MemoryBroker, StoreError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(&self.broker)
        } else {
            Err(closed())
        }
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expiry: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check()?.set(key, value, expiry)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.check()?.get(key)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?.inner.records.remove(key);
        Ok(())
    }

    async fn append(
        &self,
        key: &str,
        value: &[u8],
        expiry: Option<Duration>,
    ) -> Result<u64, StoreError> {
        self.check()?.append(key, value, expiry)
    }

    async fn range(&self, key: &str) -> Result<Vec<Bytes>, StoreError> {
        self.check()?.range(key)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, StoreError> {
        self.check()?.publish(channel, payload)
    }
}

struct MemorySubscriber {
    broker: MemoryBroker,
    socket_id: u64,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(closed());
        }
        Ok(self.broker.subscribe(channel, self.socket_id))
    }
}

// ============================================================================
// Connector
// ============================================================================

struct LiveSocket {
    socket_id: u64,
    alive: Arc<AtomicBool>,
    events: SocketEvents,
}

/// A [`Connector`] over a [`MemoryBroker`] with fault injection
pub struct MemoryConnector {
    broker: MemoryBroker,
    publisher_connects: AtomicU64,
    subscriber_connects: AtomicU64,
    refuse: AtomicBool,
    fail_next: AtomicU64,
    connect_delay: Mutex<Duration>,
    live: Mutex<HashMap<SocketRole, LiveSocket>>,
}

impl MemoryConnector {
    /// Create a connector whose sockets all talk to `broker`
    #[must_use]
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            publisher_connects: AtomicU64::new(0),
            subscriber_connects: AtomicU64::new(0),
            refuse: AtomicBool::new(false),
            fail_next: AtomicU64::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// The broker behind this connector
    #[must_use]
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Socket connect attempts across both roles
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.publisher_connects() + self.subscriber_connects()
    }

    /// Publisher connect attempts (successful or not)
    #[must_use]
    pub fn publisher_connects(&self) -> u64 {
        self.publisher_connects.load(Ordering::SeqCst)
    }

    /// Subscriber connect attempts (successful or not)
    #[must_use]
    pub fn subscriber_connects(&self) -> u64 {
        self.subscriber_connects.load(Ordering::SeqCst)
    }

    /// Refuse every connect attempt until switched off again
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Refuse the next `count` connect attempts
    pub fn fail_connects(&self, count: u64) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delay every connect attempt by `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Kill the live socket for `role` and report `message` as its error
    ///
    /// Returns `false` when no socket is live for that role.
    pub fn inject_error(&self, role: SocketRole, message: &str) -> bool {
        self.kill(role).map(|events| events.error(message)).is_some()
    }

    /// Kill the live socket for `role` and report it closed by the backend
    pub fn inject_close(&self, role: SocketRole) -> bool {
        self.kill(role).map(|events| events.closed()).is_some()
    }

    fn kill(&self, role: SocketRole) -> Option<SocketEvents> {
        let socket = self.live.lock().remove(&role)?;
        socket.alive.store(false, Ordering::SeqCst);
        self.broker.drop_socket_routes(socket.socket_id);
        Some(socket.events)
    }

    async fn admit(&self, role: SocketRole, url: &str) -> Result<(), StoreError> {
        let counter = match role {
            SocketRole::Publisher => &self.publisher_connects,
            SocketRole::Subscriber => &self.subscriber_connects,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scheduled_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled_failure || self.refuse.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(format!("connection refused: {url}")));
        }
        Ok(())
    }

    fn register(&self, role: SocketRole, events: SocketEvents) -> (u64, Arc<AtomicBool>) {
        let socket_id = self.broker.next_id();
        let alive = Arc::new(AtomicBool::new(true));
        self.live.lock().insert(
            role,
            LiveSocket {
                socket_id,
                alive: alive.clone(),
                events,
            },
        );
        (socket_id, alive)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect_publisher(
        &self,
        url: &str,
        events: SocketEvents,
    ) -> Result<Arc<dyn Publisher>, StoreError> {
        self.admit(SocketRole::Publisher, url).await?;
        let (_, alive) = self.register(SocketRole::Publisher, events);
        Ok(Arc::new(MemoryPublisher {
            broker: self.broker.clone(),
            alive,
        }))
    }

    async fn connect_subscriber(
        &self,
        url: &str,
        events: SocketEvents,
    ) -> Result<Arc<dyn Subscriber>, StoreError> {
        self.admit(SocketRole::Subscriber, url).await?;
        let (socket_id, alive) = self.register(SocketRole::Subscriber, events);
        Ok(Arc::new(MemorySubscriber {
            broker: self.broker.clone(),
            socket_id,
            alive,
        }))
    }
}

// ============================================================================
// Key-Value Store
// ============================================================================

/// An in-memory [`KvStore`] with expiry
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, (String, Instant)>,
    unreachable: AtomicBool,
}

impl MemoryKv {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the store could not be reached
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(StoreError::Connection("registry unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.reachable()?;
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.reachable()?;
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| entry.1 <= now);
        }
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.reachable()?;
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_records_expire() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();

        publisher
            .set("k", b"v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        publisher.set("forever", b"v", None).await.unwrap();
        assert_eq!(broker.ttl("k"), Some(Duration::from_secs(10)));
        assert_eq!(broker.ttl("forever"), None);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(publisher.get("k").await.unwrap(), None);
        assert!(broker.contains("forever"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_refreshes_list_expiry() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        let ttl = Some(Duration::from_secs(5));

        assert_eq!(publisher.append("l", b"a", ttl).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(publisher.append("l", b"b", ttl).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(
            publisher.range("l").await.unwrap(),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    #[tokio::test]
    async fn test_type_mismatch_is_command_error() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();

        publisher.set("k", b"v", None).await.unwrap();
        assert!(matches!(
            publisher.append("k", b"x", None).await,
            Err(StoreError::Command(_))
        ));
        assert!(publisher.range("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_fans_out_and_unsubscribes_on_drop() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        let subscriber = broker.subscriber();

        let mut a = subscriber.subscribe("chan").await.unwrap();
        let b = subscriber.subscribe("chan").await.unwrap();
        assert_eq!(publisher.publish("chan", b"hello").await.unwrap(), 2);
        assert_eq!(a.next().await, Some(Bytes::from_static(b"hello")));

        drop(b);
        assert_eq!(broker.subscriber_count("chan"), 1);
        assert_eq!(publisher.publish("other", b"x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_error_kills_socket_and_reports_event() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        let events = SocketEvents::detached(SocketRole::Subscriber);
        let subscriber = connector
            .connect_subscriber("memory://", events)
            .await
            .unwrap();
        let mut sub = subscriber.subscribe("chan").await.unwrap();

        assert!(connector.inject_error(SocketRole::Subscriber, "idle timeout"));
        assert_eq!(sub.recv().await, None);
        assert!(subscriber.subscribe("chan").await.is_err());
        assert!(!connector.inject_close(SocketRole::Subscriber));
    }

    #[tokio::test]
    async fn test_scheduled_connect_failures() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        connector.fail_connects(2);

        let events = || SocketEvents::detached(SocketRole::Publisher);
        assert!(connector.connect_publisher("m", events()).await.is_err());
        assert!(connector.connect_publisher("m", events()).await.is_err());
        assert!(connector.connect_publisher("m", events()).await.is_ok());
        assert_eq!(connector.publisher_connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kv_expiry_and_unreachable() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_secs(600)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));

        kv.set_unreachable(true);
        assert!(kv.get("k").await.is_err());
        kv.set_unreachable(false);

        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
