//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `JOBGW_API_KEY`, `JOBGW_LISTEN`,
//!    `JOBGW_BACKEND_URL`
//! 2. **Config file** — path via `--config <path>`, or `jobgw.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:4100"
//!
//! [backend]
//! url = "http://localhost:8000"
//! api_key = "your-service-key"
//! connect_timeout_secs = 10
//! request_timeout_secs = 30
//! upstream_connect_timeout_secs = 10
//!
//! [ratelimit]
//! window_secs = 60
//! max_requests = 60
//! ban_secs = 300
//! sweep_interval_secs = 60
//!
//! [relay]
//! subscriber_queue = 64
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:4100`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Execution backend endpoint and service credential.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend base URL (default `http://localhost:8000`).
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Service credential sent on every backend call. Override with
    /// `JOBGW_API_KEY`. Defaults to `"change-me"` which triggers a startup
    /// warning. Never exposed to browsers.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// TCP connect timeout for backend REST calls in seconds (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Overall request timeout for backend REST calls in seconds (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Handshake timeout for the upstream event-source WebSocket (default 10).
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout_secs: u64,
}

/// Fixed-window rate limit settings, applied per source address.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Window width in seconds (default 60).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Maximum requests per window before a ban is applied (default 60).
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Ban duration in seconds once the cap is exceeded (default 300).
    #[serde(default = "default_ban_secs")]
    pub ban_secs: u64,
    /// Interval of the background sweep that evicts expired entries (default 60).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Relay fan-out settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Per-subscriber outbound queue depth. A subscriber that falls this far
    /// behind is dropped rather than allowed to stall the room (default 64).
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:4100".to_string()
}
fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_upstream_connect_timeout() -> u64 {
    10
}
fn default_window_secs() -> u64 {
    60
}
fn default_max_requests() -> u32 {
    60
}
fn default_ban_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_subscriber_queue() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            api_key: default_api_key(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            upstream_connect_timeout_secs: default_upstream_connect_timeout(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
            ban_secs: default_ban_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `jobgw.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("jobgw.toml").exists() {
            let content =
                std::fs::read_to_string("jobgw.toml").expect("Failed to read jobgw.toml");
            toml::from_str(&content).expect("Failed to parse jobgw.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                backend: BackendConfig::default(),
                ratelimit: RateLimitConfig::default(),
                relay: RelayConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(key) = std::env::var("JOBGW_API_KEY") {
            config.backend.api_key = key;
        }
        if let Ok(listen) = std::env::var("JOBGW_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("JOBGW_BACKEND_URL") {
            config.backend.url = url;
        }

        config
    }
}
