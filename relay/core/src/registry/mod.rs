//! Active-Stream Registry
//!
//! Maps a conversation to the stream currently being produced for it:
//!
//! ```text
//! stream:active:{conversationId}  ->  streamId      (expires after 600s)
//! ```
//!
//! Backed by a stateless HTTP key-value store ([`upstash::UpstashKv`]), so
//! it has no connection lifecycle of its own. Absence is a normal outcome:
//! missing credentials, an unreachable store and an expired entry all read
//! as "no active stream". Nothing here returns an error to callers.

pub mod upstash;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::pubsub::StoreError;

pub use upstash::UpstashKv;

/// Lifetime of an active-stream entry
pub const ACTIVE_STREAM_TTL: Duration = Duration::from_secs(600);

/// Minimal string key-value interface the registry needs
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Read `key`
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove `key`
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// Registry key for `conversation_id`
#[must_use]
pub fn active_key(conversation_id: &str) -> String {
    format!("stream:active:{conversation_id}")
}

/// Conversation → active stream lookup
pub struct ActiveStreamRegistry {
    store: Option<Arc<dyn KvStore>>,
    ttl: Duration,
    unconfigured_logged: AtomicBool,
}

impl ActiveStreamRegistry {
    /// Create a registry over `store` (`None` disables it)
    pub fn new(store: Option<Arc<dyn KvStore>>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            unconfigured_logged: AtomicBool::new(false),
        }
    }

    /// A registry with no backing store
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(None, ACTIVE_STREAM_TTL)
    }

    /// Whether a backing store is configured
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    fn store(&self) -> Option<&Arc<dyn KvStore>> {
        if self.store.is_none() && !self.unconfigured_logged.swap(true, Ordering::Relaxed) {
            warn!("registry credentials not configured; resumable streams disabled");
        }
        self.store.as_ref()
    }

    /// Record `stream_id` as the active stream of `conversation_id`
    ///
    /// Overwrites any previous entry.
    pub async fn set_active(&self, conversation_id: &str, stream_id: &str) {
        let Some(store) = self.store() else {
            return;
        };
        match store
            .set_ex(&active_key(conversation_id), stream_id, self.ttl)
            .await
        {
            Ok(()) => debug!(conversation_id, stream_id, "active stream recorded"),
            Err(e) => warn!(conversation_id, error = %e, "failed to record active stream"),
        }
    }

    /// The active stream of `conversation_id`, if any
    pub async fn get_active(&self, conversation_id: &str) -> Option<String> {
        let store = self.store()?;
        match store.get(&active_key(conversation_id)).await {
            Ok(stream_id) => stream_id,
            Err(e) => {
                warn!(conversation_id, error = %e, "active stream lookup failed");
                None
            }
        }
    }

    /// Forget the active stream of `conversation_id` (best effort)
    pub async fn clear_active(&self, conversation_id: &str) {
        let Some(store) = self.store() else {
            return;
        };
        if let Err(e) = store.del(&active_key(conversation_id)).await {
            warn!(conversation_id, error = %e, "failed to clear active stream");
        }
    }

    /// Clear the entry only while it still points at `stream_id`
    ///
    /// A newer turn that overwrote the entry keeps it. The check and the
    /// delete are separate requests, so a write landing in between can
    /// still be removed; the entry then simply expires early.
    pub async fn clear_if_current(&self, conversation_id: &str, stream_id: &str) {
        if self.get_active(conversation_id).await.as_deref() == Some(stream_id) {
            self.clear_active(conversation_id).await;
        }
    }
}

impl std::fmt::Debug for ActiveStreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveStreamRegistry")
            .field("enabled", &self.is_enabled())
            .field("ttl", &self.ttl)
            .finish()
    }
}
