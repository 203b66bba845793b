//! Relay Configuration
//!
//! Loads settings from a TOML file at
//! `$XDG_CONFIG_HOME/resumable-relay/relay.toml`, the environment and CLI
//! overrides.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! A missing URL or token is not an error: it disables the component that
//! needs it. Empty strings count as missing.
//!
//! # Example Configuration
//!
//! ```toml
//! [pubsub]
//! url = "redis://localhost:6379"
//! connect_timeout_ms = 5000
//! retry_step_ms = 200
//! max_retry_delay_ms = 2000
//! max_retries = 5
//! # reprobe_after_secs = 60
//!
//! [registry]
//! rest_url = "https://example.upstash.io"
//! rest_token = "..."
//! ttl_secs = 600
//! request_timeout_ms = 5000
//!
//! [relay]
//! record_ttl_secs = 600
//! key_prefix = "resumable-stream"
//! channel_capacity = 256
//!
//! [server]
//! listen_addr = "127.0.0.1:8787"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::RelayConfig;
use crate::pubsub::StoreError;
use crate::registry::{ActiveStreamRegistry, KvStore, UpstashKv};
use crate::supervisor::{BackoffPolicy, SupervisorConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in default
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Structures
// =============================================================================

/// `[pubsub]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PubsubToml {
    /// Pub/sub connection URL
    pub url: Option<String>,
    /// Initial connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Backoff step in milliseconds
    pub retry_step_ms: Option<u64>,
    /// Backoff ceiling in milliseconds
    pub max_retry_delay_ms: Option<u64>,
    /// Consecutive reconnect failures before giving up
    pub max_retries: Option<u32>,
    /// Re-probe a failed pair after this many seconds
    pub reprobe_after_secs: Option<u64>,
}

/// `[registry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryToml {
    /// REST endpoint of the key-value store
    pub rest_url: Option<String>,
    /// Bearer token for the REST endpoint
    pub rest_token: Option<String>,
    /// Active-stream entry lifetime in seconds
    pub ttl_secs: Option<u64>,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: Option<u64>,
}

/// `[relay]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Record lifetime cap in seconds
    pub record_ttl_secs: Option<u64>,
    /// Key namespace
    pub key_prefix: Option<String>,
    /// Originator buffer size in chunks
    pub channel_capacity: Option<usize>,
    /// Quiet seconds before a resumed stream re-checks whether it finished
    pub idle_check_secs: Option<u64>,
}

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// HTTP listen address
    pub listen_addr: Option<String>,
}

/// Top-level TOML document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigToml {
    /// Pub/sub connection settings
    pub pubsub: PubsubToml,
    /// Registry settings
    pub registry: RegistryToml,
    /// Relay settings
    pub relay: RelayToml,
    /// Server settings
    pub server: ServerToml,
}

// =============================================================================
// Effective Configuration
// =============================================================================

/// Pub/sub connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubsubSettings {
    /// Connection URL (`None` disables resumable streams)
    pub url: Option<String>,
    /// Initial connect timeout
    pub connect_timeout: Duration,
    /// Reconnect policy
    pub backoff: BackoffPolicy,
    /// Re-probe interval after permanent failure
    pub reprobe_after: Option<Duration>,
}

/// Registry settings
#[derive(Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    /// REST endpoint
    pub rest_url: Option<String>,
    /// Bearer token
    pub rest_token: Option<String>,
    /// Entry lifetime
    pub ttl: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl std::fmt::Debug for RegistrySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrySettings")
            .field("rest_url", &self.rest_url)
            .field("rest_token", &self.rest_token.as_ref().map(|_| "<redacted>"))
            .field("ttl", &self.ttl)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Fully resolved relay configuration
#[derive(Clone, Debug)]
pub struct RelaySettings {
    /// Pub/sub connection settings
    pub pubsub: PubsubSettings,
    /// Registry settings
    pub registry: RegistrySettings,
    /// Relay settings
    pub relay: RelayConfig,
    /// HTTP listen address
    pub listen_addr: String,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            pubsub: PubsubSettings {
                url: None,
                connect_timeout: Duration::from_millis(5000),
                backoff: BackoffPolicy::default(),
                reprobe_after: None,
            },
            registry: RegistrySettings {
                rest_url: None,
                rest_token: None,
                ttl: crate::registry::ACTIVE_STREAM_TTL,
                request_timeout: crate::registry::upstash::DEFAULT_REQUEST_TIMEOUT,
            },
            relay: RelayConfig::default(),
            listen_addr: "127.0.0.1:8787".to_string(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelaySettings {
    /// Where the highest-priority value came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Supervisor configuration derived from the pub/sub settings
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            url: self.pubsub.url.clone(),
            connect_timeout: self.pubsub.connect_timeout,
            backoff: self.pubsub.backoff,
            reprobe_after: self.pubsub.reprobe_after,
        }
    }

    /// Build the active-stream registry (disabled without credentials)
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn build_registry(&self) -> Result<ActiveStreamRegistry, StoreError> {
        let store: Option<Arc<dyn KvStore>> =
            match (&self.registry.rest_url, &self.registry.rest_token) {
                (Some(url), Some(token)) => Some(Arc::new(UpstashKv::new(
                    url.clone(),
                    token.clone(),
                    self.registry.request_timeout,
                )?)),
                _ => None,
            };
        Ok(ActiveStreamRegistry::new(store, self.registry.ttl))
    }

    /// Parsed listen address
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an unparsable address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr.parse().map_err(|e| {
            ConfigError::ValidationError(format!("listen_addr '{}': {e}", self.listen_addr))
        })
    }

    /// Check invariants between values
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.relay.record_ttl.is_zero() {
            return invalid("relay.record_ttl_secs must be greater than zero");
        }
        if self.registry.ttl.is_zero() {
            return invalid("registry.ttl_secs must be greater than zero");
        }
        if self.relay.channel_capacity == 0 {
            return invalid("relay.channel_capacity must be greater than zero");
        }
        if self.relay.idle_check.is_zero() {
            return invalid("relay.idle_check_secs must be greater than zero");
        }
        if self.relay.key_prefix.is_empty() {
            return invalid("relay.key_prefix must not be empty");
        }
        if self.pubsub.backoff.max_delay < self.pubsub.backoff.step {
            return invalid("pubsub.max_retry_delay_ms must be at least pubsub.retry_step_ms");
        }
        self.socket_addr().map(|_| ())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file location
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("resumable-relay").join("relay.toml"))
}

/// Load configuration from the default file location and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read, parsed or
/// validated. A missing file is not an error.
pub fn load_config() -> Result<RelaySettings, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from `path` (if any) and the process environment
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config_from_path(path: Option<&Path>) -> Result<RelaySettings, ConfigError> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Load configuration reading environment variables through `env`
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_with_env(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<RelaySettings, ConfigError> {
    let mut config = RelaySettings::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;
            let toml: ConfigToml = toml::from_str(&content)?;
            apply_toml_config(&mut config, &toml);
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn apply_toml_config(config: &mut RelaySettings, toml: &ConfigToml) {
    let pubsub = &toml.pubsub;
    if let Some(url) = non_empty(pubsub.url.clone()) {
        config.pubsub.url = Some(url);
    }
    if let Some(ms) = pubsub.connect_timeout_ms {
        config.pubsub.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = pubsub.retry_step_ms {
        config.pubsub.backoff.step = Duration::from_millis(ms);
    }
    if let Some(ms) = pubsub.max_retry_delay_ms {
        config.pubsub.backoff.max_delay = Duration::from_millis(ms);
    }
    if let Some(n) = pubsub.max_retries {
        config.pubsub.backoff.max_retries = n;
    }
    if let Some(secs) = pubsub.reprobe_after_secs {
        config.pubsub.reprobe_after = Some(Duration::from_secs(secs));
    }

    let registry = &toml.registry;
    if let Some(url) = non_empty(registry.rest_url.clone()) {
        config.registry.rest_url = Some(url);
    }
    if let Some(token) = non_empty(registry.rest_token.clone()) {
        config.registry.rest_token = Some(token);
    }
    if let Some(secs) = registry.ttl_secs {
        config.registry.ttl = Duration::from_secs(secs);
    }
    if let Some(ms) = registry.request_timeout_ms {
        config.registry.request_timeout = Duration::from_millis(ms);
    }

    if let Some(secs) = toml.relay.record_ttl_secs {
        config.relay.record_ttl = Duration::from_secs(secs);
    }
    if let Some(prefix) = &toml.relay.key_prefix {
        config.relay.key_prefix.clone_from(prefix);
    }
    if let Some(capacity) = toml.relay.channel_capacity {
        config.relay.channel_capacity = capacity;
    }
    if let Some(secs) = toml.relay.idle_check_secs {
        config.relay.idle_check = Duration::from_secs(secs);
    }

    if let Some(addr) = non_empty(toml.server.listen_addr.clone()) {
        config.listen_addr = addr;
    }
}

/// First non-empty value among `names`
fn first_env(env: &impl Fn(&str) -> Option<String>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| non_empty(env(name)))
}

fn apply_env_config(config: &mut RelaySettings, env: impl Fn(&str) -> Option<String>) {
    if let Some(url) = first_env(&env, &["REDIS_URL", "KV_URL"]) {
        config.pubsub.url = Some(url);
        config.source = ConfigSource::Env;
    }
    if let Some(url) = first_env(&env, &["UPSTASH_REDIS_REST_URL", "KV_REST_API_URL"]) {
        config.registry.rest_url = Some(url);
        config.source = ConfigSource::Env;
    }
    if let Some(token) = first_env(&env, &["UPSTASH_REDIS_REST_TOKEN", "KV_REST_API_TOKEN"]) {
        config.registry.rest_token = Some(token);
        config.source = ConfigSource::Env;
    }
    if let Some(addr) = first_env(&env, &["RELAY_LISTEN_ADDR"]) {
        config.listen_addr = addr;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Pub/sub URL override
    pub pubsub_url: Option<String>,
    /// Listen address override
    pub listen_addr: Option<String>,
    /// Re-probe interval override (seconds)
    pub reprobe_after_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pub/sub URL override
    #[must_use]
    pub fn with_pubsub_url(mut self, url: String) -> Self {
        self.pubsub_url = Some(url);
        self
    }

    /// Set the listen address override
    #[must_use]
    pub fn with_listen_addr(mut self, addr: String) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Set the re-probe interval override
    #[must_use]
    pub fn with_reprobe_after_secs(mut self, secs: u64) -> Self {
        self.reprobe_after_secs = Some(secs);
        self
    }

    /// Apply overrides to `config` and re-validate
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if an override is invalid.
    pub fn apply(&self, config: &mut RelaySettings) -> Result<(), ConfigError> {
        let mut applied = false;
        if let Some(url) = non_empty(self.pubsub_url.clone()) {
            config.pubsub.url = Some(url);
            applied = true;
        }
        if let Some(addr) = non_empty(self.listen_addr.clone()) {
            config.listen_addr = addr;
            applied = true;
        }
        if let Some(secs) = self.reprobe_after_secs {
            config.pubsub.reprobe_after = Some(Duration::from_secs(secs));
            applied = true;
        }
        if applied {
            config.source = ConfigSource::Cli;
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
