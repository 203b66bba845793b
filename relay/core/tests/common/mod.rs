//! Shared fixtures for relay integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use relay_core::registry::ACTIVE_STREAM_TTL;
use relay_core::{
    ActiveStreamRegistry, BackoffPolicy, ConnectionSupervisor, MemoryBroker, MemoryConnector,
    MemoryKv, RelayConfig, ResumeService, StreamContextFactory, StreamLauncher, SupervisorConfig,
};

/// Every component wired over in-memory backends
pub struct Harness {
    pub broker: MemoryBroker,
    pub connector: Arc<MemoryConnector>,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub kv: Arc<MemoryKv>,
    pub registry: Arc<ActiveStreamRegistry>,
    pub factory: Arc<StreamContextFactory>,
    pub service: ResumeService,
    pub launcher: StreamLauncher,
}

impl Harness {
    /// Components with a configured pub/sub URL
    pub fn new() -> Self {
        Self::build(Some("memory://relay"), BackoffPolicy::default())
    }

    /// Components with no pub/sub URL
    pub fn unconfigured() -> Self {
        Self::build(None, BackoffPolicy::default())
    }

    /// Components with fast reconnects
    pub fn fast_backoff() -> Self {
        Self::build(
            Some("memory://relay"),
            BackoffPolicy {
                step: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_retries: 5,
            },
        )
    }

    fn build(url: Option<&str>, backoff: BackoffPolicy) -> Self {
        let broker = MemoryBroker::new();
        let connector = Arc::new(MemoryConnector::new(broker.clone()));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            SupervisorConfig {
                url: url.map(str::to_string),
                backoff,
                ..Default::default()
            },
            connector.clone(),
        ));
        let kv = Arc::new(MemoryKv::new());
        let registry = Arc::new(ActiveStreamRegistry::new(
            Some(kv.clone()),
            ACTIVE_STREAM_TTL,
        ));
        let factory = Arc::new(StreamContextFactory::new(
            supervisor.clone(),
            RelayConfig::default(),
        ));

        Self {
            service: ResumeService::new(registry.clone(), factory.clone()),
            launcher: StreamLauncher::new(registry.clone(), factory.clone()),
            broker,
            connector,
            supervisor,
            kv,
            registry,
            factory,
        }
    }
}

/// A producer fed by the returned sender
pub fn producer() -> (mpsc::Sender<Bytes>, ReceiverStream<Bytes>) {
    let (tx, rx) = mpsc::channel(64);
    (tx, ReceiverStream::new(rx))
}

/// A chunk from a string
pub fn chunk(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Drain a stream into strings
pub async fn collect_text(stream: impl Stream<Item = Bytes>) -> Vec<String> {
    stream
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .collect()
        .await
}

/// Poll `condition` until it holds (panics after ~2s)
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

/// Wait until the registry no longer has an entry for `conversation_id`
pub async fn registry_cleared(registry: &ActiveStreamRegistry, conversation_id: &str) {
    for _ in 0..400 {
        if registry.get_active(conversation_id).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("registry entry for {conversation_id} never cleared");
}
