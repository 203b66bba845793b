//! Lifetime-Capping Publisher
//!
//! Decorates a [`Publisher`] so every write that carries an expiry is
//! stored with the configured cap instead. Writes without an expiry and all
//! reads pass through unchanged.
//!
//! The relay asks for a day-long record lifetime; conversational turns only
//! need minutes, so the cap keeps the backend small without touching the
//! relay code.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{Publisher, StoreError};

/// Default record lifetime cap (10 minutes)
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(600);

/// A publisher whose writes expire after at most `cap`
#[derive(Clone)]
pub struct CappedPublisher {
    inner: Arc<dyn Publisher>,
    cap: Duration,
}

impl CappedPublisher {
    /// Wrap `inner`, replacing any requested expiry with `cap`
    pub fn new(inner: Arc<dyn Publisher>, cap: Duration) -> Self {
        Self { inner, cap }
    }

    /// The configured cap
    #[must_use]
    pub fn cap(&self) -> Duration {
        self.cap
    }

    #[inline]
    fn capped(&self, requested: Option<Duration>) -> Option<Duration> {
        requested.map(|_| self.cap)
    }
}

#[async_trait]
impl Publisher for CappedPublisher {
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expiry: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.inner.set(key, value, self.capped(expiry)).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn append(
        &self,
        key: &str,
        value: &[u8],
        expiry: Option<Duration>,
    ) -> Result<u64, StoreError> {
        self.inner.append(key, value, self.capped(expiry)).await
    }

    async fn range(&self, key: &str) -> Result<Vec<Bytes>, StoreError> {
        self.inner.range(key).await
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, StoreError> {
        self.inner.publish(channel, payload).await
    }
}
