//! HTTP Server
//!
//! ```text
//!  GET  /stream/{conversation_id}   resume the active stream
//!                                   204 nothing to resume (for any reason)
//!                                   200 text/event-stream relayed chunks
//!
//!  POST /stream/{conversation_id}   relay the request body as a new turn
//!                                   200 text/event-stream, x-stream-id when resumable
//!
//!  GET  /health                     supervisor phase and counters
//! ```

use std::convert::Infallible;
use std::future::ready;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use relay_core::{
    ActiveStreamRegistry, ConnectionSupervisor, RelayedStream, ResumeOutcome, ResumeService,
    StreamContextFactory, StreamLauncher, SupervisorStats,
};

/// Header carrying the id of a newly started resumable stream
pub const STREAM_ID_HEADER: HeaderName = HeaderName::from_static("x-stream-id");

/// Shared handler state
pub struct AppState {
    supervisor: Arc<ConnectionSupervisor>,
    registry: Arc<ActiveStreamRegistry>,
    service: ResumeService,
    launcher: StreamLauncher,
}

impl AppState {
    /// Wire handlers to `supervisor` and `registry`
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        registry: Arc<ActiveStreamRegistry>,
        factory: Arc<StreamContextFactory>,
    ) -> Self {
        Self {
            service: ResumeService::new(registry.clone(), factory.clone()),
            launcher: StreamLauncher::new(registry.clone(), factory),
            supervisor,
            registry,
        }
    }
}

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream/{conversation_id}", get(resume).post(start))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn resume(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.service.resume(&conversation_id).await {
        ResumeOutcome::NoContent => StatusCode::NO_CONTENT.into_response(),
        ResumeOutcome::Stream(chunks) => event_stream(chunks, None),
    }
}

async fn start(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    body: Body,
) -> Response {
    let producer = body
        .into_data_stream()
        .take_while(|chunk| ready(chunk.is_ok()))
        .filter_map(|chunk| ready(chunk.ok().filter(|bytes| !bytes.is_empty())));

    let launched = state.launcher.start(&conversation_id, producer).await;
    debug!(
        conversation_id = %conversation_id,
        resumable = launched.is_resumable(),
        "turn started"
    );
    event_stream(launched.chunks, launched.stream_id.as_deref())
}

fn event_stream(chunks: RelayedStream, stream_id: Option<&str>) -> Response {
    let mut response = Response::new(Body::from_stream(chunks.map(Ok::<_, Infallible>)));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    if let Some(value) = stream_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(STREAM_ID_HEADER, value);
    }
    response
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    pubsub: SupervisorStats,
    registry_enabled: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        pubsub: state.supervisor.stats(),
        registry_enabled: state.registry.is_enabled(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use relay_core::registry::ACTIVE_STREAM_TTL;
    use relay_core::{
        MemoryBroker, MemoryConnector, MemoryKv, RelayConfig, SupervisorConfig,
    };
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        registry: Arc<ActiveStreamRegistry>,
        factory: Arc<StreamContextFactory>,
    }

    fn app(url: Option<&str>) -> TestApp {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            SupervisorConfig {
                url: url.map(str::to_string),
                ..Default::default()
            },
            Arc::new(MemoryConnector::new(MemoryBroker::new())),
        ));
        let registry = Arc::new(ActiveStreamRegistry::new(
            Some(Arc::new(MemoryKv::new())),
            ACTIVE_STREAM_TTL,
        ));
        let factory = Arc::new(StreamContextFactory::new(
            supervisor.clone(),
            RelayConfig::default(),
        ));
        let state = Arc::new(AppState::new(supervisor, registry.clone(), factory.clone()));
        TestApp {
            router: router(state),
            registry,
            factory,
        }
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_204() {
        let app = app(Some("memory://"));
        let response = app.router.oneshot(get_request("/stream/t1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_unconfigured_backend_is_204() {
        let app = app(None);
        app.registry.set_active("t1", "s1").await;

        for id in ["t1", "t2"] {
            let response = app
                .router
                .clone()
                .oneshot(get_request(&format!("/stream/{id}")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
    }

    #[tokio::test]
    async fn test_live_stream_is_200_event_stream() {
        let app = app(Some("memory://"));
        let ctx = app.factory.new_context().await.unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let mut created = ctx
            .create_stream("s1", tokio_stream::wrappers::ReceiverStream::new(rx))
            .await;
        app.registry.set_active("t1", "s1").await;

        tx.send(bytes::Bytes::from_static(b"data: one\n\n")).await.unwrap();
        created.chunks.next().await;

        let response = app.router.oneshot(get_request("/stream/t1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[CACHE_CONTROL], "no-cache");

        tx.send(bytes::Bytes::from_static(b"data: two\n\n")).await.unwrap();
        drop(tx);
        assert_eq!(body_text(response).await, "data: one\n\ndata: two\n\n");
    }

    #[tokio::test]
    async fn test_post_relays_body_and_registers_turn() {
        let app = app(Some("memory://"));
        let request = Request::builder()
            .method("POST")
            .uri("/stream/t1")
            .body(Body::from("data: hello\n\n"))
            .unwrap();

        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stream_id = response.headers()[STREAM_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(body_text(response).await, "data: hello\n\n");
        assert!(!stream_id.is_empty());

        // Finished turns are not resumable
        for _ in 0..100 {
            if app.registry.get_active("t1").await.is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let response = app.router.oneshot(get_request("/stream/t1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_post_without_backend_streams_without_id() {
        let app = app(None);
        let request = Request::builder()
            .method("POST")
            .uri("/stream/t1")
            .body(Body::from("plain"))
            .unwrap();

        let response = app.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(STREAM_ID_HEADER).is_none());
        assert_eq!(body_text(response).await, "plain");
    }

    #[tokio::test]
    async fn test_health_reports_phase() {
        let app = app(None);
        let response = app.router.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["pubsub"]["phase"], "unconfigured");
        assert_eq!(json["pubsub"]["connect_attempts"], 0);
        assert_eq!(json["registry_enabled"], true);
    }
}
