//! Stream Launcher
//!
//! Glue for starting a conversation turn as a resumable stream:
//!
//! 1. get a context (pub/sub unavailable: hand the producer back untouched)
//! 2. relay the producer under a fresh `uuid` v4 stream id
//! 3. record it in the registry when the relay is resumable
//! 4. on completion, clear the registry entry if it still names this stream

use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{RelayedStream, StreamContextFactory};
use crate::registry::ActiveStreamRegistry;

/// A started turn
pub struct LaunchedStream {
    /// Stream id when the turn is resumable
    pub stream_id: Option<String>,
    /// Chunks for the originating client
    pub chunks: RelayedStream,
}

impl LaunchedStream {
    /// Whether other clients can resume this turn
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.stream_id.is_some()
    }
}

impl std::fmt::Debug for LaunchedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedStream")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

/// Starts producers as resumable streams
pub struct StreamLauncher {
    registry: Arc<ActiveStreamRegistry>,
    factory: Arc<StreamContextFactory>,
}

impl StreamLauncher {
    /// Create a launcher over `registry` and `factory`
    pub fn new(registry: Arc<ActiveStreamRegistry>, factory: Arc<StreamContextFactory>) -> Self {
        Self { registry, factory }
    }

    /// Start `producer` as the active turn of `conversation_id`
    pub async fn start<S>(&self, conversation_id: &str, producer: S) -> LaunchedStream
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        let ctx = match self.factory.new_context().await {
            Ok(ctx) => ctx,
            Err(reason) => {
                debug!(conversation_id, reason = %reason, "streaming without resume");
                return LaunchedStream {
                    stream_id: None,
                    chunks: producer.boxed(),
                };
            }
        };

        let stream_id = Uuid::new_v4().to_string();
        let created = ctx.create_stream(&stream_id, producer).await;
        if !created.resumable {
            return LaunchedStream {
                stream_id: None,
                chunks: created.chunks,
            };
        }

        self.registry.set_active(conversation_id, &stream_id).await;
        info!(conversation_id, stream_id = %stream_id, "stream started");

        let registry = self.registry.clone();
        let conversation = conversation_id.to_string();
        let finished = stream_id.clone();
        let completion = created.completion;
        tokio::spawn(async move {
            match completion.await {
                Ok(summary) => {
                    debug!(
                        conversation_id = %conversation,
                        stream_id = %finished,
                        chunks = summary.chunks,
                        resumable = summary.resumable,
                        "stream complete"
                    );
                }
                Err(_) => warn!(stream_id = %finished, "relay task ended without a summary"),
            }
            registry.clear_if_current(&conversation, &finished).await;
        });

        LaunchedStream {
            stream_id: Some(stream_id),
            chunks: created.chunks,
        }
    }
}
