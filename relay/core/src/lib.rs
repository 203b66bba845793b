//! Relay Core - Resumable Stream Session Manager
//!
//! Lets a request/response backend expose an incrementally produced response
//! as a stream that outlives the client connection: a client that drops, or
//! a different client entirely, can reattach to the same in-progress stream
//! without restarting the producer.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────────────────────────────────┐
//!  GET /stream/c │               ResumeService                  │
//!  ─────────────►│  registry.get_active(c) ─► factory ─► resume │
//!                └───────┬───────────────────────┬──────────────┘
//!                        │                       │
//!          ┌─────────────▼──────────┐  ┌─────────▼──────────────┐
//!          │  ActiveStreamRegistry  │  │  StreamContextFactory  │
//!          │  c -> s   (TTL 600s)   │  │  per-request contexts  │
//!          │  HTTP key-value store  │  └─────────┬──────────────┘
//!          └────────────────────────┘            │
//!                                     ┌──────────▼──────────────┐
//!                                     │ ConnectionSupervisor    │
//!                                     │ single-flight connect,  │
//!                                     │ bounded reconnects      │
//!                                     └──────────┬──────────────┘
//!                                   publisher    │    subscriber
//!                                  (capped TTL)  ▼
//!                                        pub/sub store (Redis)
//! ```
//!
//! # Key Types
//!
//! - [`ConnectionSupervisor`]: owns the shared (publisher, subscriber) pair
//! - [`CappedPublisher`]: caps the lifetime of every record written
//! - [`StreamContextFactory`] / [`StreamContext`]: create and resume streams
//! - [`ActiveStreamRegistry`]: conversation → active stream lookup
//! - [`ResumeService`]: the resume state machine
//! - [`StreamLauncher`]: starts a turn and keeps the registry in sync
//!
//! Every component degrades instead of failing: without a pub/sub URL or
//! registry credentials, streams are served but not resumable.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod launcher;
pub mod memory;
pub mod pubsub;
pub mod registry;
pub mod resume;
pub mod supervisor;

pub use config::{load_config, ConfigError, ConfigOverrides, ConfigSource, RelaySettings};
pub use context::{
    CreatedStream, RelayConfig, RelayError, RelaySummary, RelayedStream, StreamContext,
    StreamContextFactory,
};
pub use launcher::{LaunchedStream, StreamLauncher};
pub use memory::{MemoryBroker, MemoryConnector, MemoryKv};
pub use pubsub::{CappedPublisher, Publisher, StoreError, Subscriber, Subscription};
pub use registry::{ActiveStreamRegistry, KvStore, UpstashKv};
pub use resume::{ResumeOutcome, ResumeService};
pub use supervisor::{
    BackoffPolicy, ConnectionPair, ConnectionSupervisor, Connector, SocketEvents, SocketRole,
    SupervisorConfig, SupervisorPhase, SupervisorStats, Unavailable,
};
