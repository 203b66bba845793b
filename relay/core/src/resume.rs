//! Resume Endpoint
//!
//! The state machine behind `GET /stream/{conversationId}`:
//!
//! ```text
//! registry.get_active(c) ──None──────────────────────────┐
//!        │ Some(s)                                       │
//!        ▼                                               │
//! factory.new_context() ──Unavailable────────────────────┤
//!        │ ctx                                           ├──► NoContent
//!        ▼                                               │
//! ctx.resume_stream(s) ──NotFound / store error──────────┘
//!        │ stream
//!        ▼
//!     Stream(stream)
//! ```
//!
//! Every failure branch yields the same [`ResumeOutcome::NoContent`]:
//! callers cannot tell "never existed" from "expired" from "backend down".

use std::sync::Arc;

use tracing::debug;

use crate::context::{RelayError, RelayedStream, StreamContextFactory};
use crate::registry::ActiveStreamRegistry;

/// Result of a resume attempt
pub enum ResumeOutcome {
    /// Nothing to resume
    NoContent,
    /// The relayed stream, starting from its first chunk
    Stream(RelayedStream),
}

impl ResumeOutcome {
    /// Whether there is nothing to resume
    #[must_use]
    pub fn is_no_content(&self) -> bool {
        matches!(self, Self::NoContent)
    }
}

impl std::fmt::Debug for ResumeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoContent => write!(f, "NoContent"),
            Self::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// Resolves conversations to resumable streams
pub struct ResumeService {
    registry: Arc<ActiveStreamRegistry>,
    factory: Arc<StreamContextFactory>,
}

impl ResumeService {
    /// Create a service over `registry` and `factory`
    pub fn new(registry: Arc<ActiveStreamRegistry>, factory: Arc<StreamContextFactory>) -> Self {
        Self { registry, factory }
    }

    /// Resume the active stream of `conversation_id`
    pub async fn resume(&self, conversation_id: &str) -> ResumeOutcome {
        let Some(stream_id) = self.registry.get_active(conversation_id).await else {
            debug!(conversation_id, "no active stream");
            return ResumeOutcome::NoContent;
        };

        let ctx = match self.factory.new_context().await {
            Ok(ctx) => ctx,
            Err(reason) => {
                debug!(conversation_id, reason = %reason, "pub/sub unavailable");
                return ResumeOutcome::NoContent;
            }
        };

        match ctx.resume_stream(&stream_id).await {
            Ok(stream) => {
                debug!(conversation_id, stream_id = %stream_id, "resuming");
                ResumeOutcome::Stream(stream)
            }
            Err(RelayError::NotFound) => {
                debug!(conversation_id, stream_id = %stream_id, "stream no longer live");
                ResumeOutcome::NoContent
            }
            Err(RelayError::Store(e)) => {
                debug!(conversation_id, stream_id = %stream_id, error = %e, "resume failed");
                ResumeOutcome::NoContent
            }
        }
    }
}
