//! Stream Context Factory
//!
//! Hands out per-request [`StreamContext`]s bound to the supervisor's shared
//! socket pair. A context is cheap: it never opens sockets of its own.
//!
//! # Relay Protocol
//!
//! For stream `s` under prefix `p`:
//!
//! ```text
//! p:rs:sentinel:s   "1" while producing, "DONE" once finished
//! p:rs:chunks:s     list of chunks in production order
//! p:rs:events:s     channel carrying relay frames (see [`frame`])
//! ```
//!
//! ```text
//!  producer ──► relay task ──┬──► RPUSH chunks      (backlog for late joiners)
//!                            ├──► PUBLISH Chunk(n)  (live resumers)
//!                            └──► originator        (local forwarding)
//!
//!  resume:  SUBSCRIBE events ─► GET sentinel ─► LRANGE chunks ─► live frames
//!                                                 (n chunks)      seq >= n
//! ```
//!
//! Subscribing before reading any state means a chunk is always seen either
//! in the backlog or as a live frame. A chunk seen in both is yielded once.
//!
//! A resumed stream is always a prefix of what the originator received. A
//! sequence gap in the live frames is filled from the backlog, or ends the
//! tail when the backlog cannot fill it. A tail that hears nothing for
//! [`RelayConfig::idle_check`] re-reads the sentinel and ends once the
//! stream is finished or gone, so a lost `Done` frame never leaves it hanging.

pub mod frame;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::pubsub::{CappedPublisher, Publisher, StoreError, Subscriber, Subscription};
use crate::supervisor::{BackoffPolicy, ConnectionPair, ConnectionSupervisor, Unavailable};

pub use frame::{Frame, FrameError, MAX_PAYLOAD_SIZE};

/// Record lifetime the relay asks for on every write
///
/// Contexts route writes through a [`CappedPublisher`], so what reaches the
/// store is the configured record TTL instead.
pub const RELAY_DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const SENTINEL_ACTIVE: &[u8] = b"1";
const SENTINEL_DONE: &[u8] = b"DONE";

/// A relayed chunk sequence
pub type RelayedStream = BoxStream<'static, Bytes>;

// ============================================================================
// Configuration
// ============================================================================

/// Relay settings shared by every context
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Lifetime cap applied to every record write
    pub record_ttl: Duration,
    /// Namespace for relay keys and channels
    pub key_prefix: String,
    /// Chunks buffered towards the originating client
    pub channel_capacity: usize,
    /// Silence after which a live tail re-checks whether its stream finished
    pub idle_check: Duration,
    /// Retries for marking a stream finished when the store is briefly down
    pub finish_backoff: BackoffPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            record_ttl: crate::pubsub::capped::DEFAULT_RECORD_TTL,
            key_prefix: "resumable-stream".to_string(),
            channel_capacity: 256,
            idle_check: Duration::from_secs(5),
            finish_backoff: BackoffPolicy::default(),
        }
    }
}

/// Store keys for one stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamKeys {
    /// Production state
    pub sentinel: String,
    /// Chunk backlog
    pub chunks: String,
    /// Frame channel
    pub events: String,
}

impl StreamKeys {
    /// Keys for `stream_id` under `prefix`
    #[must_use]
    pub fn new(prefix: &str, stream_id: &str) -> Self {
        Self {
            sentinel: format!("{prefix}:rs:sentinel:{stream_id}"),
            chunks: format!("{prefix}:rs:chunks:{stream_id}"),
            events: format!("{prefix}:rs:events:{stream_id}"),
        }
    }
}

// ============================================================================
// Errors & Results
// ============================================================================

/// Errors resuming a stream
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// No live stream exists under the id (finished, expired or never started)
    #[error("no live stream")]
    NotFound,

    /// The store failed while attaching
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a chunk could not be relayed to resumers
#[derive(Debug, Error)]
enum PublishError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a finished relay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelaySummary {
    /// Chunks the producer yielded
    pub chunks: u64,
    /// Whether the stream stayed resumable to the end
    pub resumable: bool,
}

/// A newly started relayed stream
pub struct CreatedStream {
    /// Identifier the stream is relayed under
    pub stream_id: String,
    /// Whether other clients can attach to it
    pub resumable: bool,
    /// Chunks for the originating client
    pub chunks: RelayedStream,
    /// Resolves once the producer is exhausted
    pub completion: oneshot::Receiver<RelaySummary>,
}

impl std::fmt::Debug for CreatedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedStream")
            .field("stream_id", &self.stream_id)
            .field("resumable", &self.resumable)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Produces per-request stream contexts over the supervised socket pair
pub struct StreamContextFactory {
    supervisor: Arc<ConnectionSupervisor>,
    config: RelayConfig,
}

impl StreamContextFactory {
    /// Create a factory over `supervisor`
    pub fn new(supervisor: Arc<ConnectionSupervisor>, config: RelayConfig) -> Self {
        Self { supervisor, config }
    }

    /// The supervisor contexts are bound to
    #[must_use]
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// Create a context bound to the shared sockets
    ///
    /// # Errors
    ///
    /// Passes through the supervisor's [`Unavailable`] verdict.
    pub async fn new_context(&self) -> Result<StreamContext, Unavailable> {
        let pair = self.supervisor.get_connections().await?;
        Ok(StreamContext::new(pair, self.config.clone()))
    }
}

// ============================================================================
// Context
// ============================================================================

/// Per-request handle for creating and resuming relayed streams
#[derive(Clone)]
pub struct StreamContext {
    publisher: Arc<dyn Publisher>,
    subscriber: Arc<dyn Subscriber>,
    config: RelayConfig,
}

impl StreamContext {
    /// Bind a context to `pair`, capping record lifetimes at `config.record_ttl`
    #[must_use]
    pub fn new(pair: ConnectionPair, config: RelayConfig) -> Self {
        Self {
            publisher: Arc::new(CappedPublisher::new(pair.publisher, config.record_ttl)),
            subscriber: pair.subscriber,
            config,
        }
    }

    fn keys(&self, stream_id: &str) -> StreamKeys {
        StreamKeys::new(&self.config.key_prefix, stream_id)
    }

    /// Start relaying `producer` under `stream_id`
    ///
    /// Never fails: if the stream cannot be registered with the store it is
    /// still forwarded to the caller, just not resumable.
    pub async fn create_stream<S>(&self, stream_id: &str, producer: S) -> CreatedStream
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        let keys = self.keys(stream_id);
        let resumable = match self
            .publisher
            .set(&keys.sentinel, SENTINEL_ACTIVE, Some(RELAY_DEFAULT_TTL))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(stream_id, error = %e, "cannot register stream; relaying without resume");
                false
            }
        };

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        let relay = Relay {
            publisher: self.publisher.clone(),
            stream_id: stream_id.to_string(),
            keys,
            resumable,
            finish_backoff: self.config.finish_backoff,
        };
        tokio::spawn(async move {
            let summary = relay.run(producer, tx).await;
            let _ = done_tx.send(summary);
        });

        debug!(stream_id, resumable, "stream created");
        CreatedStream {
            stream_id: stream_id.to_string(),
            resumable,
            chunks: ReceiverStream::new(rx).boxed(),
            completion: done_rx,
        }
    }

    /// Attach to the live stream `stream_id`
    ///
    /// Yields every chunk produced so far, then follows the producer until
    /// it finishes. Dropping the returned stream unsubscribes.
    ///
    /// # Errors
    ///
    /// - [`RelayError::NotFound`] if the stream finished, expired or never
    ///   existed
    /// - [`RelayError::Store`] if the store failed while attaching
    pub async fn resume_stream(&self, stream_id: &str) -> Result<RelayedStream, RelayError> {
        let keys = self.keys(stream_id);
        let subscription = self.subscriber.subscribe(&keys.events).await?;

        match self.publisher.get(&keys.sentinel).await? {
            Some(state) if &state[..] != SENTINEL_DONE => {}
            _ => return Err(RelayError::NotFound),
        }

        let backlog = self.publisher.range(&keys.chunks).await?;
        let next = backlog.len() as u64;
        debug!(stream_id, backlog = next, "resuming stream");

        let tail = LiveTail {
            subscription,
            publisher: self.publisher.clone(),
            keys,
            stream_id: stream_id.to_string(),
            next,
            pending: VecDeque::new(),
            ended: false,
            idle_check: self.config.idle_check,
        };
        Ok(stream::iter(backlog).chain(tail.into_stream()).boxed())
    }
}

// ============================================================================
// Live Tail
// ============================================================================

/// Follows a stream's live frames after its backlog was replayed
struct LiveTail {
    subscription: Subscription,
    publisher: Arc<dyn Publisher>,
    keys: StreamKeys,
    stream_id: String,
    /// Sequence of the next chunk owed to the resumer
    next: u64,
    /// Chunks recovered from the backlog, yielded before anything else
    pending: VecDeque<Bytes>,
    ended: bool,
    idle_check: Duration,
}

impl LiveTail {
    fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        stream::unfold(self, |mut tail| async move {
            let chunk = tail.next_chunk().await?;
            Some((chunk, tail))
        })
    }

    async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(chunk);
            }
            if self.ended {
                return None;
            }

            let message =
                match tokio::time::timeout(self.idle_check, self.subscription.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        debug!(stream_id = %self.stream_id, "subscription closed mid-stream");
                        return None;
                    }
                    Err(_) => {
                        self.check_finished().await;
                        continue;
                    }
                };

            match Frame::decode(&message) {
                Ok(Frame::Chunk { sequence, payload }) if sequence == self.next => {
                    self.next += 1;
                    return Some(payload);
                }
                Ok(Frame::Chunk { sequence, .. }) if sequence < self.next => {}
                Ok(Frame::Chunk { sequence, payload }) => {
                    if !self.backfill(Some(sequence)).await {
                        warn!(
                            stream_id = %self.stream_id,
                            expected = self.next,
                            received = sequence,
                            "unrecoverable gap in live frames; ending resumed stream"
                        );
                        return None;
                    }
                    self.pending.push_back(payload);
                    self.next = sequence + 1;
                }
                Ok(Frame::Done { total }) => {
                    if total > self.next {
                        self.backfill(Some(total)).await;
                    }
                    debug!(stream_id = %self.stream_id, total, "resumed stream finished");
                    self.ended = true;
                }
                Err(e) => {
                    warn!(stream_id = %self.stream_id, error = %e, "dropping corrupt frame");
                }
            }
        }
    }

    /// Queue backlog chunks from `next` up to `until` (or the whole backlog)
    ///
    /// Returns false when the backlog is unreadable or too short.
    async fn backfill(&mut self, until: Option<u64>) -> bool {
        let backlog = match self.publisher.range(&self.keys.chunks).await {
            Ok(backlog) => backlog,
            Err(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "cannot read backlog");
                return false;
            }
        };
        let available = backlog.len() as u64;
        let until = until.unwrap_or(available);
        if available < until {
            return false;
        }

        let start = usize::try_from(self.next).unwrap_or(usize::MAX);
        let end = usize::try_from(until).unwrap_or(usize::MAX);
        if start < end {
            self.pending.extend(backlog[start..end].iter().cloned());
            self.next = until;
        }
        true
    }

    /// After a quiet interval, end the tail if the stream is no longer live
    async fn check_finished(&mut self) {
        match self.publisher.get(&self.keys.sentinel).await {
            Ok(Some(state)) if &state[..] != SENTINEL_DONE => {}
            Ok(Some(_)) => {
                debug!(stream_id = %self.stream_id, "stream finished without a done frame");
                self.backfill(None).await;
                self.ended = true;
            }
            Ok(None) => {
                debug!(stream_id = %self.stream_id, "stream record gone");
                self.ended = true;
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "cannot confirm stream is live");
                self.ended = true;
            }
        }
    }
}

// ============================================================================
// Relay Task
// ============================================================================

#[derive(Clone)]
struct Relay {
    publisher: Arc<dyn Publisher>,
    stream_id: String,
    keys: StreamKeys,
    resumable: bool,
    finish_backoff: BackoffPolicy,
}

impl Relay {
    async fn run<S>(mut self, producer: S, tx: mpsc::Sender<Bytes>) -> RelaySummary
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        let mut producer = std::pin::pin!(producer);
        let mut sequence = 0u64;
        let mut forwarding = true;

        while let Some(chunk) = producer.next().await {
            if self.resumable {
                if let Err(e) = self.publish_chunk(sequence, &chunk).await {
                    warn!(
                        stream_id = %self.stream_id,
                        sequence,
                        error = %e,
                        "relay publish failed; continuing without resume"
                    );
                    self.resumable = false;
                    // Release resumers once the store is reachable again
                    let relay = self.clone();
                    tokio::spawn(async move { relay.finish(sequence).await });
                }
            }

            if forwarding && tx.send(chunk).await.is_err() {
                debug!(stream_id = %self.stream_id, "originating client disconnected");
                forwarding = false;
            }
            sequence += 1;

            if !forwarding && !self.resumable {
                break;
            }
        }

        if self.resumable {
            self.finish(sequence).await;
            info!(stream_id = %self.stream_id, chunks = sequence, "stream finished");
        }

        RelaySummary {
            chunks: sequence,
            resumable: self.resumable,
        }
    }

    async fn publish_chunk(&self, sequence: u64, chunk: &Bytes) -> Result<(), PublishError> {
        if chunk.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge(chunk.len()).into());
        }
        self.publisher
            .append(&self.keys.chunks, chunk, Some(RELAY_DEFAULT_TTL))
            .await?;
        let frame = Frame::Chunk {
            sequence,
            payload: chunk.clone(),
        };
        self.publisher
            .publish(&self.keys.events, &frame.encode())
            .await?;
        Ok(())
    }

    /// Mark the stream finished and release live resumers
    ///
    /// Retried per `finish_backoff` so a socket that is being re-established
    /// does not swallow the `Done` frame.
    async fn finish(&self, total: u64) {
        let done = Frame::Done { total }.encode();
        let mut marked = false;
        let mut retry = 0;

        loop {
            if !marked {
                match self
                    .publisher
                    .set(&self.keys.sentinel, SENTINEL_DONE, Some(RELAY_DEFAULT_TTL))
                    .await
                {
                    Ok(()) => marked = true,
                    Err(e) => {
                        warn!(stream_id = %self.stream_id, retry, error = %e, "failed to mark stream done");
                    }
                }
            }
            if marked {
                match self.publisher.publish(&self.keys.events, &done).await {
                    Ok(_) => return,
                    Err(e) => {
                        warn!(stream_id = %self.stream_id, retry, error = %e, "failed to publish done frame");
                    }
                }
            }

            retry += 1;
            let Some(delay) = self.finish_backoff.next_delay(retry) else {
                warn!(stream_id = %self.stream_id, "giving up marking stream done");
                return;
            };
            tokio::time::sleep(delay).await;
        }
    }
}
