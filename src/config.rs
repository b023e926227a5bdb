//! Gateway configuration module
//! Handles the runtime parameters for the order gateway

use crate::constants::{
    DEFAULT_APP_PREFIX, DEFAULT_BROKER_PREFIX, DEFAULT_BUFFER_SIZE,
    DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_HANDLER_TIMEOUT_MS, DEFAULT_HOST,
    DEFAULT_INDEX_FILE, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_PING_INTERVAL_SECS, DEFAULT_POLL_TIMEOUT_SECS, DEFAULT_PORT, DEFAULT_STATIC_DIR,
    WS_PATH,
};
use crate::error::{GatewayError, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Gateway configuration parameters
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Path segment of the connection endpoint (no slashes)
    pub ws_path: String,
    /// Destinations under this prefix are routed to handlers
    pub app_prefix: String,
    /// Destinations under this prefix are broker topics
    pub broker_prefix: String,
    pub max_connections: usize,
    /// Outbound frames buffered per connection before deliveries fail
    pub buffer_size: usize,
    pub connection_timeout: Duration,
    pub ping_interval: Duration,
    pub handler_timeout: Duration,
    /// How long a fallback poll request waits for frames
    pub poll_timeout: Duration,
    pub max_frame_size: usize,
    pub static_dir: PathBuf,
    pub index_file: String,
}

impl GatewayConfig {
    /// Create a test configuration with short timeouts
    pub fn for_testing() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            ws_path: WS_PATH.to_string(),
            app_prefix: DEFAULT_APP_PREFIX.to_string(),
            broker_prefix: DEFAULT_BROKER_PREFIX.to_string(),
            max_connections: 100,
            buffer_size: 64,
            connection_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            handler_timeout: Duration::from_millis(500),
            poll_timeout: Duration::from_millis(200),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            index_file: DEFAULT_INDEX_FILE.to_string(),
        }
    }

    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let host = env::var("ORDER_GATEWAY_HOST").unwrap_or(DEFAULT_HOST.to_string());
        let port = parse_var("ORDER_GATEWAY_PORT", DEFAULT_PORT)?;
        let ws_path = env::var("ORDER_GATEWAY_WS_PATH").unwrap_or(WS_PATH.to_string());

        let app_prefix =
            env::var("ORDER_GATEWAY_APP_PREFIX").unwrap_or(DEFAULT_APP_PREFIX.to_string());
        let broker_prefix =
            env::var("ORDER_GATEWAY_BROKER_PREFIX").unwrap_or(DEFAULT_BROKER_PREFIX.to_string());

        let max_connections = parse_var("ORDER_GATEWAY_MAX_CONN", DEFAULT_MAX_CONNECTIONS)?;
        let buffer_size = parse_var("ORDER_GATEWAY_BUFFER", DEFAULT_BUFFER_SIZE)?;
        let timeout_secs = parse_var("ORDER_GATEWAY_TIMEOUT", DEFAULT_CONNECTION_TIMEOUT_SECS)?;
        let ping_secs = parse_var("ORDER_GATEWAY_PING", DEFAULT_PING_INTERVAL_SECS)?;
        let handler_ms = parse_var("ORDER_GATEWAY_HANDLER_TIMEOUT_MS", DEFAULT_HANDLER_TIMEOUT_MS)?;
        let poll_secs = parse_var("ORDER_GATEWAY_POLL_TIMEOUT", DEFAULT_POLL_TIMEOUT_SECS)?;
        let max_frame_size = parse_var("ORDER_GATEWAY_MAX_FRAME_SIZE", DEFAULT_MAX_FRAME_SIZE)?;

        let static_dir = env::var("ORDER_GATEWAY_STATIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATIC_DIR));
        let index_file =
            env::var("ORDER_GATEWAY_INDEX_FILE").unwrap_or(DEFAULT_INDEX_FILE.to_string());

        let config = Self {
            host,
            port,
            ws_path: ws_path.trim_matches('/').to_string(),
            app_prefix: normalize_prefix(&app_prefix),
            broker_prefix: normalize_prefix(&broker_prefix),
            max_connections,
            buffer_size,
            connection_timeout: Duration::from_secs(timeout_secs),
            ping_interval: Duration::from_secs(ping_secs),
            handler_timeout: Duration::from_millis(handler_ms),
            poll_timeout: Duration::from_secs(poll_secs),
            max_frame_size,
            static_dir,
            index_file,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ws_path.is_empty() || self.ws_path.contains('/') {
            return Err(GatewayError::ConfigError(format!(
                "Endpoint path must be a single non-empty segment, got '{}'",
                self.ws_path
            )));
        }

        for (name, prefix) in [("application", &self.app_prefix), ("broker", &self.broker_prefix)] {
            if prefix.is_empty() {
                return Err(GatewayError::ConfigError(format!(
                    "The {} destination prefix must not be empty",
                    name
                )));
            }
        }

        if self.app_prefix == self.broker_prefix
            || self.app_prefix.starts_with(&format!("{}/", self.broker_prefix))
            || self.broker_prefix.starts_with(&format!("{}/", self.app_prefix))
        {
            return Err(GatewayError::ConfigError(format!(
                "Application prefix '{}' and broker prefix '{}' must not overlap",
                self.app_prefix, self.broker_prefix
            )));
        }

        if self.buffer_size == 0 || self.max_connections == 0 || self.max_frame_size == 0 {
            return Err(GatewayError::ConfigError(
                "Buffer size, connection limit and frame size must be greater than zero".to_string(),
            ));
        }

        if self.handler_timeout.is_zero() || self.poll_timeout.is_zero() || self.ping_interval.is_zero() {
            return Err(GatewayError::ConfigError(
                "Handler, poll and ping intervals must be greater than zero".to_string(),
            ));
        }

        if self.connection_timeout <= self.ping_interval {
            return Err(GatewayError::ConfigError(format!(
                "Connection timeout ({}s) must exceed the ping interval ({}s)",
                self.connection_timeout.as_secs(),
                self.ping_interval.as_secs()
            )));
        }

        Ok(())
    }

    /// Socket address string the server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full path of the entry document served for client-side routes
    pub fn index_path(&self) -> PathBuf {
        self.static_dir.join(&self.index_file)
    }
}

/// Parse an optional environment variable, falling back to a default when unset
fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            GatewayError::ConfigError(format!("{} has an invalid value: '{}'", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

/// Prefixes are compared literally, so only a trailing slash is dropped
fn normalize_prefix(prefix: &str) -> String {
    prefix.trim().trim_end_matches('/').to_string()
}
