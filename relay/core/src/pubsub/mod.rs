//! Publish/Subscribe Store Interfaces
//!
//! The relay talks to its backing store through two narrow traits, one per
//! socket role:
//!
//! - [`Publisher`]: key-value writes with optional expiry, list appends and
//!   channel publishes
//! - [`Subscriber`]: channel subscriptions delivered as a [`Subscription`]
//!   stream
//!
//! Many logical streams multiplex over one implementation of each trait.
//! Concrete backends live in [`self::redis`] (production) and
//! [`crate::memory`] (tests / local development). [`capped`] decorates any
//! publisher with a record lifetime cap.

pub mod capped;
pub mod redis;

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

pub use capped::CappedPublisher;
pub use self::redis::RedisConnector;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by a pub/sub store socket
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The socket could not reach the backend (refused, dropped, I/O)
    #[error("connection error: {0}")]
    Connection(String),

    /// The socket is currently down and being re-established
    #[error("socket is reconnecting")]
    Disconnected,

    /// The backend rejected the command
    #[error("command failed: {0}")]
    Command(String),

    /// The operation did not complete in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered with something we could not interpret
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Whether this error means the underlying socket is gone
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Disconnected | Self::Timeout(_))
    }
}

// ============================================================================
// Socket Traits
// ============================================================================

/// The publishing side of the store
///
/// Every write that accepts an `expiry` is a "write with expiry": `None`
/// means the record lives until explicitly removed.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: &[u8], expiry: Option<Duration>)
        -> Result<(), StoreError>;

    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Remove `key`
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Append `value` to the list at `key`, returning the new list length
    async fn append(
        &self,
        key: &str,
        value: &[u8],
        expiry: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Read the whole list at `key` (empty when absent)
    async fn range(&self, key: &str) -> Result<Vec<Bytes>, StoreError>;

    /// Publish `payload` on `channel`, returning the number of receivers
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, StoreError>;
}

/// The subscribing side of the store
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to `channel`
    ///
    /// The subscription is active once this returns; messages published
    /// afterwards are delivered in order.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

// ============================================================================
// Subscription
// ============================================================================

type DropHook = Box<dyn FnOnce() + Send + Sync>;

/// A live channel subscription
///
/// Yields message payloads until the backing socket goes away. Dropping the
/// subscription runs its unsubscribe hook.
pub struct Subscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    on_drop: Option<DropHook>,
}

impl Subscription {
    /// Wrap a payload receiver for `channel`
    pub fn new(channel: impl Into<String>, receiver: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
            on_drop: None,
        }
    }

    /// Run `hook` when the subscription is dropped
    #[must_use]
    pub fn on_drop(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_drop = Some(Box::new(hook));
        self
    }

    /// The subscribed channel
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next payload (`None` once the socket is gone)
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
