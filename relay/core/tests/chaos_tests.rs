//! Chaos Tests for Connection Supervision
//!
//! Verify behavior under adverse conditions:
//! - Cold-start stampedes on the supervisor
//! - Socket error and close events mid-stream
//! - Reconnect retries running out
//!
//! All failures are injected through the in-memory connector.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio::task::JoinSet;

use common::{chunk, collect_text, eventually, producer, Harness};
use relay_core::{ResumeOutcome, SocketRole, SupervisorPhase, Unavailable};

// =============================================================================
// Single Flight
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_cold_start_stampede_connects_once() {
    let h = Arc::new(Harness::new());
    h.connector
        .set_connect_delay(Duration::from_millis(25));

    let mut tasks = JoinSet::new();
    for _ in 0..100 {
        let h = h.clone();
        tasks.spawn(async move { h.supervisor.get_connections().await.is_ok() });
    }

    while let Some(result) = tasks.join_next().await {
        assert!(result.unwrap());
    }
    assert_eq!(h.connector.publisher_connects(), 1);
    assert_eq!(h.connector.subscriber_connects(), 1);
    assert_eq!(h.supervisor.stats().connect_attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_cold_start_stampede_of_resumes() {
    let h = Arc::new(Harness::new());
    h.connector
        .set_connect_delay(Duration::from_millis(25));
    for i in 0..50 {
        h.registry.set_active(&format!("t{i}"), "missing").await;
    }

    let mut tasks = JoinSet::new();
    for i in 0..50 {
        let h = h.clone();
        tasks.spawn(async move { h.service.resume(&format!("t{i}")).await.is_no_content() });
    }

    while let Some(result) = tasks.join_next().await {
        assert!(result.unwrap());
    }
    assert_eq!(h.connector.connect_attempts(), 2);
}

// =============================================================================
// Socket Errors
// =============================================================================

#[tokio::test]
async fn chaos_subscriber_error_interrupts_then_recovers() {
    let h = Harness::fast_backoff();
    let (tx, rx) = producer();
    let mut launched = h.launcher.start("t1", rx).await;

    tx.send(chunk("a")).await.unwrap();
    launched.chunks.next().await;

    let ResumeOutcome::Stream(mut resumed) = h.service.resume("t1").await else {
        panic!("expected a stream");
    };
    assert_eq!(resumed.next().await, Some(chunk("a")));

    assert!(h.connector.inject_error(SocketRole::Subscriber, "idle connection closed"));
    // The live tail is interrupted, never an error
    assert_eq!(resumed.next().await, None);

    eventually(|| h.supervisor.stats().reconnects == 1).await;
    assert_eq!(h.supervisor.phase(), SupervisorPhase::Connected);

    tx.send(chunk("b")).await.unwrap();
    launched.chunks.next().await;

    let ResumeOutcome::Stream(resumed) = h.service.resume("t1").await else {
        panic!("expected the stream after reconnect");
    };
    tx.send(chunk("c")).await.unwrap();
    drop(tx);
    assert_eq!(collect_text(resumed).await, vec!["a", "b", "c"]);
    assert_eq!(h.supervisor.stats().socket_errors, 1);
}

#[tokio::test]
async fn chaos_publisher_close_keeps_originator_whole() {
    let h = Harness::fast_backoff();
    let (tx, rx) = producer();
    let launched = h.launcher.start("t1", rx).await;

    tx.send(chunk("a")).await.unwrap();
    assert!(h.connector.inject_close(SocketRole::Publisher));
    tx.send(chunk("b")).await.unwrap();
    tx.send(chunk("c")).await.unwrap();
    drop(tx);

    // Whatever happens to the relay, the originating client gets everything
    assert_eq!(collect_text(launched.chunks).await, vec!["a", "b", "c"]);

    eventually(|| h.supervisor.stats().reconnects == 1).await;
    let next = h
        .launcher
        .start("t2", futures::stream::iter(vec![chunk("z")]))
        .await;
    assert!(next.is_resumable());
}

#[tokio::test]
async fn chaos_publisher_close_mid_stream_releases_resumers() {
    let h = Harness::fast_backoff();
    let (tx, rx) = producer();
    let mut launched = h.launcher.start("t1", rx).await;

    tx.send(chunk("a")).await.unwrap();
    launched.chunks.next().await;
    let ResumeOutcome::Stream(resumed) = h.service.resume("t1").await else {
        panic!("expected a stream");
    };

    assert!(h.connector.inject_close(SocketRole::Publisher));
    tx.send(chunk("b")).await.unwrap();
    drop(tx);
    eventually(|| h.supervisor.stats().reconnects == 1).await;

    // The done frame is delivered once the publisher is back
    let resumed = tokio::time::timeout(Duration::from_secs(3), collect_text(resumed))
        .await
        .expect("resumed stream never ended");
    assert_eq!(resumed, vec!["a"]);
    assert_eq!(collect_text(launched.chunks).await, vec!["b"]);
}

#[tokio::test]
async fn chaos_retries_exhausted_degrades_to_no_content() {
    let h = Harness::fast_backoff();
    let (tx, rx) = producer();
    let _launched = h.launcher.start("t1", rx).await;
    tx.send(chunk("a")).await.unwrap();

    h.connector.refuse_connections(true);
    assert!(h.connector.inject_error(SocketRole::Subscriber, "connection reset"));

    eventually(|| h.supervisor.phase() == SupervisorPhase::Failed).await;
    // Initial connect plus five refused retries
    assert_eq!(h.connector.subscriber_connects(), 6);

    assert_eq!(
        h.supervisor.get_connections().await.unwrap_err(),
        Unavailable::Failed
    );
    assert!(h.service.resume("t1").await.is_no_content());

    // Failure is terminal even once the backend is back
    h.connector.refuse_connections(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.service.resume("t1").await.is_no_content());

    let launched = h
        .launcher
        .start("t2", futures::stream::iter(vec![chunk("still served")]))
        .await;
    assert!(!launched.is_resumable());
    assert_eq!(collect_text(launched.chunks).await, vec!["still served"]);
    assert_eq!(h.connector.subscriber_connects(), 6);
}

#[tokio::test]
async fn chaos_repeated_errors_within_ceiling() {
    let h = Harness::fast_backoff();
    h.supervisor.get_connections().await.unwrap();

    for round in 1..=10u64 {
        let role = if round % 2 == 0 {
            SocketRole::Publisher
        } else {
            SocketRole::Subscriber
        };
        assert!(h.connector.inject_error(role, "blip"));
        eventually(|| h.supervisor.stats().reconnects == round).await;
    }

    let stats = h.supervisor.stats();
    assert_eq!(stats.socket_errors, 10);
    assert_eq!(stats.phase, SupervisorPhase::Connected);
    assert!(h.supervisor.get_connections().await.is_ok());
}
