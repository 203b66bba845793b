//! Upstash-style REST key-value client
//!
//! Each command is one stateless HTTPS request: the command and its
//! arguments are POSTed as a JSON array to the base URL with a bearer token,
//! and the reply is `{"result": ...}` or `{"error": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::KvStore;
use crate::pubsub::StoreError;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// REST client for the active-stream registry
#[derive(Clone)]
pub struct UpstashKv {
    client: Client,
    url: String,
    token: String,
    timeout: Duration,
}

impl UpstashKv {
    /// Create a client for `url` authenticated with `token`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the HTTP client cannot be built.
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout,
        })
    }

    async fn command(&self, args: &[&str]) -> Result<Value, StoreError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(args)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        let reply: CommandReply = response
            .json()
            .await
            .map_err(|e| StoreError::Protocol(format!("HTTP {status}: {e}")))?;

        if let Some(error) = reply.error {
            return Err(StoreError::Command(error));
        }
        if !status.is_success() {
            return Err(StoreError::Command(format!("HTTP {status}")));
        }
        Ok(reply.result)
    }

    fn transport_error(&self, err: &reqwest::Error) -> StoreError {
        if err.is_timeout() {
            StoreError::Timeout(self.timeout)
        } else {
            StoreError::Connection(err.to_string())
        }
    }
}

#[async_trait]
impl KvStore for UpstashKv {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let secs = ttl.as_secs().max(1).to_string();
        self.command(&["SET", key, value, "EX", &secs]).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.command(&["GET", key]).await? {
            Value::Null => Ok(None),
            Value::String(value) => Ok(Some(value)),
            other => Err(StoreError::Protocol(format!("unexpected GET result: {other}"))),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.command(&["DEL", key]).await?;
        Ok(())
    }
}

impl std::fmt::Debug for UpstashKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstashKv")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A server answering every command POST with `status` and `reply`
    async fn store_replying(status: u16, reply: Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(status).set_body_json(reply))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_set_posts_command_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!(["SET", "stream:active:t1", "s1", "EX", "600"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "OK" })))
            .expect(1)
            .mount(&server)
            .await;
        let kv = UpstashKv::new(server.uri(), "secret", DEFAULT_REQUEST_TIMEOUT).unwrap();

        kv.set_ex("stream:active:t1", "s1", Duration::from_secs(600))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_maps_null_to_absent() {
        let server = store_replying(200, json!({ "result": null })).await;
        let kv = UpstashKv::new(server.uri(), "t", DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert_eq!(kv.get("missing").await.unwrap(), None);

        let server = store_replying(200, json!({ "result": "s1" })).await;
        let kv = UpstashKv::new(server.uri(), "t", DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_unexpected_result_is_protocol_error() {
        let server = store_replying(200, json!({ "result": 42 })).await;
        let kv = UpstashKv::new(server.uri(), "t", DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert!(matches!(
            kv.get("k").await.unwrap_err(),
            StoreError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn test_error_reply_is_command_error() {
        let server = store_replying(401, json!({ "error": "WRONGPASS invalid token" })).await;
        let kv = UpstashKv::new(server.uri(), "bad", DEFAULT_REQUEST_TIMEOUT).unwrap();

        assert_eq!(
            kv.del("k").await.unwrap_err(),
            StoreError::Command("WRONGPASS invalid token".to_string())
        );
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "result": "OK" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;
        let timeout = Duration::from_millis(100);
        let kv = UpstashKv::new(server.uri(), "t", timeout).unwrap();

        assert_eq!(kv.get("k").await.unwrap_err(), StoreError::Timeout(timeout));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_connection_error() {
        let kv = UpstashKv::new("http://127.0.0.1:1", "t", DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert!(kv.get("k").await.unwrap_err().is_connection());
    }
}
