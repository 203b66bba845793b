//! Redis Sockets
//!
//! Production implementation of the two store sockets:
//!
//! ```text
//!                       ┌──────────────────────────┐
//!  Publisher ops ──────►│ MultiplexedConnection    │──► SET / GET / DEL
//!                       │ (cloned per command)     │    RPUSH+EXPIRE / LRANGE
//!                       └──────────────────────────┘    PUBLISH
//!
//!                       ┌──────────────────────────┐
//!  subscribe(ch) ──────►│ PubSubSink (SUBSCRIBE)   │
//!                       └──────────────────────────┘
//!                       ┌──────────────────────────┐     routes[ch]
//!  dispatcher task ◄────│ PubSubStream (messages)  │──► Subscription, ...
//!                       └──────────────────────────┘
//! ```
//!
//! Connection-class failures are reported through the socket's
//! [`SocketEvents`] so the supervisor can re-establish it. The subscriber
//! reports `closed` when the backend ends the message stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::{MultiplexedConnection, PubSubSink};
use ::redis::{Client, RedisError, RedisResult};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Publisher, StoreError, Subscriber, Subscription};
use crate::supervisor::{Connector, SocketEvents};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if is_connection_error(&err) {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
}

/// Whole seconds for an `EX`/`EXPIRE` argument (at least one)
fn expiry_secs(expiry: Duration) -> u64 {
    let secs = expiry.as_secs() + u64::from(expiry.subsec_nanos() > 0);
    secs.max(1)
}

// ============================================================================
// Connector
// ============================================================================

/// Opens Redis sockets for the connection supervisor
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

impl RedisConnector {
    /// Create a connector
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect_publisher(
        &self,
        url: &str,
        events: SocketEvents,
    ) -> Result<Arc<dyn Publisher>, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        debug!("redis publisher connected");
        Ok(Arc::new(RedisPublisher { conn, events }))
    }

    async fn connect_subscriber(
        &self,
        url: &str,
        events: SocketEvents,
    ) -> Result<Arc<dyn Subscriber>, StoreError> {
        let client = Client::open(url)?;
        let pubsub = client.get_async_pubsub().await?;
        let (sink, stream) = pubsub.split();

        let routes: Arc<Routes> = Arc::new(DashMap::new());
        let dispatcher = tokio::spawn(dispatch(stream, routes.clone(), events));
        debug!("redis subscriber connected");

        Ok(Arc::new(RedisSubscriber {
            sink: Arc::new(Mutex::new(sink)),
            routes,
            next_id: AtomicU64::new(0),
            dispatcher,
        }))
    }
}

// ============================================================================
// Publisher
// ============================================================================

struct RedisPublisher {
    conn: MultiplexedConnection,
    events: SocketEvents,
}

impl RedisPublisher {
    fn observe<T>(&self, result: RedisResult<T>) -> Result<T, StoreError> {
        result.map_err(|err| {
            if is_connection_error(&err) {
                self.events.error(&err);
            }
            StoreError::from(err)
        })
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expiry: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(expiry) = expiry {
            cmd.arg("EX").arg(expiry_secs(expiry));
        }
        let result: RedisResult<()> = cmd.query_async(&mut conn).await;
        self.observe(result)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<Option<Vec<u8>>> =
            ::redis::cmd("GET").arg(key).query_async(&mut conn).await;
        Ok(self.observe(result)?.map(Bytes::from))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        self.observe(result)
    }

    async fn append(
        &self,
        key: &str,
        value: &[u8],
        expiry: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = ::redis::pipe();
        pipe.atomic().cmd("RPUSH").arg(key).arg(value);
        if let Some(expiry) = expiry {
            pipe.cmd("EXPIRE").arg(key).arg(expiry_secs(expiry)).ignore();
        }
        let result: RedisResult<(u64,)> = pipe.query_async(&mut conn).await;
        Ok(self.observe(result)?.0)
    }

    async fn range(&self, key: &str) -> Result<Vec<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<Vec<Vec<u8>>> = ::redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await;
        Ok(self.observe(result)?.into_iter().map(Bytes::from).collect())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<u64> = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        self.observe(result)
    }
}

// ============================================================================
// Subscriber
// ============================================================================

type Routes = DashMap<String, Vec<(u64, mpsc::UnboundedSender<Bytes>)>>;

struct RedisSubscriber {
    sink: Arc<Mutex<PubSubSink>>,
    routes: Arc<Routes>,
    next_id: AtomicU64,
    dispatcher: JoinHandle<()>,
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut sink = self.sink.lock().await;
            let first = {
                let mut routes = self.routes.entry(channel.to_string()).or_default();
                routes.push((id, tx));
                routes.len() == 1
            };
            if first {
                if let Err(err) = sink.subscribe(channel).await {
                    remove_route(&self.routes, channel, id);
                    return Err(err.into());
                }
            }
        }

        let sink = self.sink.clone();
        let routes = self.routes.clone();
        let owned = channel.to_string();
        Ok(Subscription::new(channel, rx).on_drop(move || {
            if remove_route(&routes, &owned, id) {
                unsubscribe_later(sink, routes, owned);
            }
        }))
    }
}

impl Drop for RedisSubscriber {
    fn drop(&mut self) {
        self.dispatcher.abort();
        // Subscriptions keep the table alive; their tails must still end
        close_routes(&self.routes);
    }
}

/// Drop every route's sender, ending all open subscriptions
fn close_routes(routes: &Routes) {
    routes.clear();
}

/// Remove route `id`, returning whether the channel has no routes left
fn remove_route(routes: &Routes, channel: &str, id: u64) -> bool {
    let Some(mut entry) = routes.get_mut(channel) else {
        return false;
    };
    entry.retain(|(route_id, _)| *route_id != id);
    let empty = entry.is_empty();
    drop(entry);
    if empty {
        routes.remove_if(channel, |_, r| r.is_empty());
    }
    empty
}

/// Issue UNSUBSCRIBE for `channel` unless a new route appeared meanwhile
fn unsubscribe_later(sink: Arc<Mutex<PubSubSink>>, routes: Arc<Routes>, channel: String) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        let mut sink = sink.lock().await;
        if routes.contains_key(&channel) {
            return;
        }
        if let Err(err) = sink.unsubscribe(&channel).await {
            debug!(channel = %channel, error = %err, "unsubscribe failed");
        }
    });
}

/// Fan incoming messages out to the routes of their channel
async fn dispatch(mut stream: ::redis::aio::PubSubStream, routes: Arc<Routes>, events: SocketEvents) {
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name();
        if let Some(mut entry) = routes.get_mut(channel) {
            let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
            entry.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        }
    }

    warn!("redis subscriber stream ended");
    close_routes(&routes);
    events.closed();
}
