//! Connection Supervisor
//!
//! Owns the process-wide (publisher, subscriber) socket pair to the pub/sub
//! store and keeps it alive.
//!
//! # Lifecycle
//!
//! ```text
//!                 get_connections()
//!  Uninitialized ──────────────────► Connecting ──► Connected ◄──┐
//!                                        │              │        │ reconnected
//!                                        │         socket error  │
//!                                        │              ▼        │
//!                                        │        Reconnecting ──┘
//!                                        │              │ retries exhausted
//!                                        ▼              ▼
//!                                      Failed ◄─────────┘   (terminal)
//! ```
//!
//! # Guarantees
//!
//! - **Single flight**: the connect attempt runs under an async mutex, so
//!   callers arriving while it is in flight wait for it and share its result
//!   instead of opening sockets of their own.
//! - **Error containment**: every socket is handed a [`SocketEvents`] handle
//!   before first use. Error and close events are consumed by a watchdog task
//!   per socket and never reach callers.
//! - **Bounded reconnects**: a dropped socket is re-established following the
//!   [`BackoffPolicy`]; once the retry ceiling is hit the pair is marked
//!   failed and every later call short-circuits to [`Unavailable::Failed`].
//! - **Unconfigured is not an error**: without a URL every call returns
//!   [`Unavailable::Unconfigured`] and the condition is logged once.

pub mod backoff;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::pubsub::{Publisher, RedisConnector, StoreError, Subscriber, Subscription};

pub use backoff::BackoffPolicy;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the connection supervisor
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Pub/sub connection URL (`None` disables the supervisor)
    pub url: Option<String>,
    /// Upper bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Reconnect policy for dropped sockets
    pub backoff: BackoffPolicy,
    /// Retry a failed pair once this long after it failed (`None` = never)
    pub reprobe_after: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            reprobe_after: None,
        }
    }
}

impl SupervisorConfig {
    /// Configuration for `url` with default timing
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

// ============================================================================
// Socket Events
// ============================================================================

/// Which half of the pair a socket is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketRole {
    /// The socket used for writes and publishes
    Publisher,
    /// The socket used for channel subscriptions
    Subscriber,
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => write!(f, "publisher"),
            Self::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// Something that happened to a live socket
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// The socket reported an error (idle disconnect, reset, ...)
    Error(String),
    /// The backend closed the socket
    Closed,
}

/// Error handler attached to a socket before its first use
///
/// Connectors hand a clone to whatever task drives the socket. Reporting
/// never fails and never blocks; once the supervisor stops listening the
/// events are discarded.
#[derive(Clone, Debug)]
pub struct SocketEvents {
    role: SocketRole,
    tx: mpsc::UnboundedSender<SocketEvent>,
}

impl SocketEvents {
    fn channel(role: SocketRole) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { role, tx }, rx)
    }

    /// A handle whose events go nowhere (for sockets used outside a supervisor)
    #[must_use]
    pub fn detached(role: SocketRole) -> Self {
        Self::channel(role).0
    }

    /// The role of the socket this handle belongs to
    #[must_use]
    pub fn role(&self) -> SocketRole {
        self.role
    }

    /// Report a socket error
    pub fn error(&self, err: impl fmt::Display) {
        let _ = self.tx.send(SocketEvent::Error(err.to_string()));
    }

    /// Report that the backend closed the socket
    pub fn closed(&self) {
        let _ = self.tx.send(SocketEvent::Closed);
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Opens raw sockets to the pub/sub store
///
/// Implementations must route every asynchronous failure of the returned
/// socket through `events`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a publishing socket
    async fn connect_publisher(
        &self,
        url: &str,
        events: SocketEvents,
    ) -> Result<Arc<dyn Publisher>, StoreError>;

    /// Open a subscribing socket
    async fn connect_subscriber(
        &self,
        url: &str,
        events: SocketEvents,
    ) -> Result<Arc<dyn Subscriber>, StoreError>;
}

// ============================================================================
// Public Types
// ============================================================================

/// The shared socket pair handed to callers
///
/// Both handles stay valid across reconnects: they always delegate to the
/// socket currently installed by the supervisor.
#[derive(Clone)]
pub struct ConnectionPair {
    /// Publishing socket
    pub publisher: Arc<dyn Publisher>,
    /// Subscribing socket
    pub subscriber: Arc<dyn Subscriber>,
}

impl fmt::Debug for ConnectionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPair").finish_non_exhaustive()
    }
}

/// Why the pub/sub pair cannot be used
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Unavailable {
    /// No connection URL was configured
    #[error("pub/sub connection URL is not configured")]
    Unconfigured,
    /// Connecting failed or retries were exhausted
    #[error("pub/sub connections failed permanently")]
    Failed,
}

/// Coarse supervisor state for health reporting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorPhase {
    /// No URL configured
    Unconfigured,
    /// Nobody asked for connections yet
    Uninitialized,
    /// Initial connect in flight
    Connecting,
    /// Both sockets up
    Connected,
    /// A socket dropped and is being re-established
    Reconnecting,
    /// Given up
    Failed,
}

/// Snapshot of supervisor counters
#[derive(Clone, Debug, Serialize)]
pub struct SupervisorStats {
    /// Current phase
    pub phase: SupervisorPhase,
    /// Pair connect attempts (initial connect and re-probes)
    pub connect_attempts: u64,
    /// Successful single-socket reconnects
    pub reconnects: u64,
    /// Error or close events observed
    pub socket_errors: u64,
}

// ============================================================================
// Managed Sockets
// ============================================================================

/// A slot holding the currently installed socket for one role
struct ManagedSocket<T: ?Sized> {
    slot: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> ManagedSocket<T> {
    fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    fn current(&self) -> Result<Arc<T>, StoreError> {
        self.slot.read().clone().ok_or(StoreError::Disconnected)
    }

    fn install(&self, socket: Arc<T>) {
        *self.slot.write() = Some(socket);
    }

    fn detach(&self) {
        self.slot.write().take();
    }
}

#[async_trait]
impl Publisher for ManagedSocket<dyn Publisher> {
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expiry: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.current()?.set(key, value, expiry).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.current()?.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.current()?.delete(key).await
    }

    async fn append(
        &self,
        key: &str,
        value: &[u8],
        expiry: Option<Duration>,
    ) -> Result<u64, StoreError> {
        self.current()?.append(key, value, expiry).await
    }

    async fn range(&self, key: &str) -> Result<Vec<Bytes>, StoreError> {
        self.current()?.range(key).await
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, StoreError> {
        self.current()?.publish(channel, payload).await
    }
}

#[async_trait]
impl Subscriber for ManagedSocket<dyn Subscriber> {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.current()?.subscribe(channel).await
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Lock-free counters
#[derive(Default)]
struct StatsAtomic {
    connect_attempts: AtomicU64,
    reconnects: AtomicU64,
    socket_errors: AtomicU64,
}

/// State shared between the supervisor and its watchdog tasks
struct Shared {
    connector: Arc<dyn Connector>,
    config: SupervisorConfig,
    publisher: Arc<ManagedSocket<dyn Publisher>>,
    subscriber: Arc<ManagedSocket<dyn Subscriber>>,
    phase: RwLock<SupervisorPhase>,
    failed_at: RwLock<Option<Instant>>,
    /// Bumped on every full pair connect; watchdogs of older pairs retire
    epoch: AtomicU64,
    stats: StatsAtomic,
    unconfigured_logged: AtomicBool,
}

impl Shared {
    fn set_phase(&self, phase: SupervisorPhase) {
        *self.phase.write() = phase;
    }

    fn failed_at(&self) -> Option<Instant> {
        *self.failed_at.read()
    }

    fn mark_failed(&self) {
        *self.failed_at.write() = Some(Instant::now());
        self.publisher.detach();
        self.subscriber.detach();
        self.set_phase(SupervisorPhase::Failed);
    }

    fn detach(&self, role: SocketRole) {
        match role {
            SocketRole::Publisher => self.publisher.detach(),
            SocketRole::Subscriber => self.subscriber.detach(),
        }
    }

    fn pair(&self) -> ConnectionPair {
        ConnectionPair {
            publisher: self.publisher.clone(),
            subscriber: self.subscriber.clone(),
        }
    }

    /// Open one socket and install it, returning its event receiver
    async fn connect_role(
        &self,
        role: SocketRole,
        url: &str,
    ) -> Result<mpsc::UnboundedReceiver<SocketEvent>, StoreError> {
        let (events, rx) = SocketEvents::channel(role);
        let timeout = self.config.connect_timeout;

        match role {
            SocketRole::Publisher => {
                let socket =
                    tokio::time::timeout(timeout, self.connector.connect_publisher(url, events))
                        .await
                        .map_err(|_| StoreError::Timeout(timeout))??;
                self.publisher.install(socket);
            }
            SocketRole::Subscriber => {
                let socket =
                    tokio::time::timeout(timeout, self.connector.connect_subscriber(url, events))
                        .await
                        .map_err(|_| StoreError::Timeout(timeout))??;
                self.subscriber.install(socket);
            }
        }

        Ok(rx)
    }
}

// ============================================================================
// Connection Supervisor
// ============================================================================

/// Process-scoped owner of the pub/sub socket pair
///
/// Construct once at startup and share behind an `Arc`.
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
    /// Single-flight guard: held for the whole connect attempt
    connected: Mutex<bool>,
}

impl ConnectionSupervisor {
    /// Create a supervisor that opens sockets through `connector`
    pub fn new(config: SupervisorConfig, connector: Arc<dyn Connector>) -> Self {
        let phase = if config.url.is_some() {
            SupervisorPhase::Uninitialized
        } else {
            SupervisorPhase::Unconfigured
        };

        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                publisher: Arc::new(ManagedSocket::new()),
                subscriber: Arc::new(ManagedSocket::new()),
                phase: RwLock::new(phase),
                failed_at: RwLock::new(None),
                epoch: AtomicU64::new(0),
                stats: StatsAtomic::default(),
                unconfigured_logged: AtomicBool::new(false),
            }),
            connected: Mutex::new(false),
        }
    }

    /// Create a supervisor backed by Redis
    #[must_use]
    pub fn redis(config: SupervisorConfig) -> Self {
        Self::new(config, Arc::new(RedisConnector::new()))
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> SupervisorPhase {
        *self.shared.phase.read()
    }

    /// Snapshot of the supervisor counters
    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        let stats = &self.shared.stats;
        SupervisorStats {
            phase: self.phase(),
            connect_attempts: stats.connect_attempts.load(Ordering::Relaxed),
            reconnects: stats.reconnects.load(Ordering::Relaxed),
            socket_errors: stats.socket_errors.load(Ordering::Relaxed),
        }
    }

    /// Get the shared socket pair, connecting on first use
    ///
    /// # Errors
    ///
    /// - [`Unavailable::Unconfigured`] when no URL is configured
    /// - [`Unavailable::Failed`] when connecting failed or the pair was
    ///   abandoned after exhausting reconnect retries
    pub async fn get_connections(&self) -> Result<ConnectionPair, Unavailable> {
        let shared = &self.shared;
        let Some(url) = shared.config.url.as_deref() else {
            if !shared.unconfigured_logged.swap(true, Ordering::Relaxed) {
                warn!("pub/sub URL not configured; resumable streams disabled");
            }
            return Err(Unavailable::Unconfigured);
        };

        if shared.failed_at().is_some() && !self.reprobe_due() {
            return Err(Unavailable::Failed);
        }

        let mut connected = self.connected.lock().await;

        if let Some(failed_at) = shared.failed_at() {
            // Re-check under the lock: another caller may have re-probed already
            if !self.reprobe_due() {
                return Err(Unavailable::Failed);
            }
            info!(
                failed_for = ?failed_at.elapsed(),
                "re-probing failed pub/sub connections"
            );
            *connected = false;
        }

        if *connected {
            return Ok(shared.pair());
        }

        shared.set_phase(SupervisorPhase::Connecting);
        match self.connect(url).await {
            Ok(()) => {
                *connected = true;
                *shared.failed_at.write() = None;
                shared.set_phase(SupervisorPhase::Connected);
                info!("pub/sub connections established");
                Ok(shared.pair())
            }
            Err(e) => {
                error!(error = %e, "pub/sub connect failed; resumable streams disabled");
                shared.mark_failed();
                Err(Unavailable::Failed)
            }
        }
    }

    fn reprobe_due(&self) -> bool {
        match (self.shared.failed_at(), self.shared.config.reprobe_after) {
            (Some(failed_at), Some(after)) => failed_at.elapsed() >= after,
            _ => false,
        }
    }

    async fn connect(&self, url: &str) -> Result<(), StoreError> {
        let shared = &self.shared;
        shared.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let (publisher_events, subscriber_events) = tokio::try_join!(
            shared.connect_role(SocketRole::Publisher, url),
            shared.connect_role(SocketRole::Subscriber, url),
        )
        .inspect_err(|_| {
            shared.publisher.detach();
            shared.subscriber.detach();
        })?;

        for (role, events) in [
            (SocketRole::Publisher, publisher_events),
            (SocketRole::Subscriber, subscriber_events),
        ] {
            tokio::spawn(watch_socket(
                Arc::downgrade(shared),
                role,
                url.to_string(),
                events,
                epoch,
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Watchdog
// ============================================================================

/// Consume error events for one socket and re-establish it when it drops
///
/// Exits when the socket's event handles are all gone (socket replaced or
/// supervisor dropped), when a newer pair supersedes this one, or after
/// giving up.
async fn watch_socket(
    shared: Weak<Shared>,
    role: SocketRole,
    url: String,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    epoch: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.epoch.load(Ordering::SeqCst) != epoch || shared.failed_at().is_some() {
            return;
        }

        shared.stats.socket_errors.fetch_add(1, Ordering::Relaxed);
        match &event {
            SocketEvent::Error(message) => {
                warn!(role = %role, error = %message, "pub/sub socket error");
            }
            SocketEvent::Closed => warn!(role = %role, "pub/sub socket closed by backend"),
        }

        shared.detach(role);
        shared.set_phase(SupervisorPhase::Reconnecting);

        let mut consecutive_failures = 0u32;
        events = loop {
            let retry = consecutive_failures + 1;
            let Some(delay) = shared.config.backoff.next_delay(retry) else {
                error!(
                    role = %role,
                    failures = consecutive_failures,
                    "abandoning pub/sub socket; resumable streams disabled until restart"
                );
                shared.mark_failed();
                return;
            };

            debug!(role = %role, retry, delay = ?delay, "reconnecting pub/sub socket");
            tokio::time::sleep(delay).await;

            if shared.epoch.load(Ordering::SeqCst) != epoch || shared.failed_at().is_some() {
                return;
            }

            match shared.connect_role(role, &url).await {
                Ok(events) => {
                    shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    shared.set_phase(SupervisorPhase::Connected);
                    info!(role = %role, retry, "pub/sub socket reconnected");
                    break events;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(role = %role, retry, error = %e, "pub/sub reconnect failed");
                }
            }
        };
    }
}
