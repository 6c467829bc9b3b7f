//! Configuration loading for jobwatch.
//!
//! The gateway URL comes from `--gateway` or the `JOBWATCH_URL` environment
//! variable. Reconnect and polling policy has compiled defaults (documented
//! on [`WatchConfig`]) with a couple of CLI overrides; none of it changes at
//! runtime.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI arguments parsed by `clap`.
#[derive(Parser)]
#[command(name = "jobwatch", version, about = "Watch job status over a jobgw gateway")]
pub struct Cli {
    /// Gateway base URL (e.g. http://localhost:4100). Falls back to JOBWATCH_URL.
    #[arg(long)]
    pub gateway: Option<String>,

    /// Maximum streaming reconnect attempts before falling back to polling.
    #[arg(long)]
    pub reconnect_attempts: Option<u32>,

    /// Maximum polling attempts before giving up.
    #[arg(long)]
    pub poll_attempts: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream live status for a job, falling back to polling when streaming
    /// exhausts its retry budget.
    Watch { job_id: String },
    /// Poll status on an increasing interval without streaming.
    Poll { job_id: String },
    /// Submit a source file for execution, then watch the job.
    Submit {
        /// Source file to execute.
        file: PathBuf,
        /// Language the backend should execute the file as.
        #[arg(long)]
        language: String,
        /// Filename presented to the backend (defaults to the file's name).
        #[arg(long)]
        filename: Option<String>,
    },
}

/// Validated configuration for the watcher and the polling fallback.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Gateway base URL, without trailing slash.
    pub gateway_url: String,
    /// First reconnect delay in milliseconds (default 1000).
    pub reconnect_base_ms: u64,
    /// Reconnect attempts before the streaming budget is exhausted (default 5).
    pub reconnect_attempts: u32,
    /// Backoff multiplier applied per attempt (default 1.5).
    pub backoff_multiplier: f64,
    /// Ceiling for a single reconnect delay in milliseconds (default 10000).
    pub backoff_cap_ms: u64,
    /// Liveness probe interval in seconds; silence for twice this long marks
    /// the connection stale (default 30).
    pub keepalive_secs: u64,
    /// WebSocket handshake timeout in seconds (default 10).
    pub connect_timeout_secs: u64,
    /// Polling attempts before reporting `Exhausted` (default 25).
    pub poll_max_attempts: u32,
    /// First polling delay in milliseconds (default 1000).
    pub poll_base_delay_ms: u64,
    /// Multiplier applied to the polling delay per attempt (default 1.3).
    pub poll_backoff_factor: f64,
    /// Ceiling for a single polling delay in milliseconds (default 8000).
    pub poll_delay_cap_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            gateway_url: String::new(),
            reconnect_base_ms: 1000,
            reconnect_attempts: 5,
            backoff_multiplier: 1.5,
            backoff_cap_ms: 10_000,
            keepalive_secs: 30,
            connect_timeout_secs: 10,
            poll_max_attempts: 25,
            poll_base_delay_ms: 1000,
            poll_backoff_factor: 1.3,
            poll_delay_cap_ms: 8000,
        }
    }
}

/// Resolve and validate configuration from CLI args and environment.
pub fn load_config(cli: &Cli) -> Result<WatchConfig, String> {
    let gateway_url = cli
        .gateway
        .clone()
        .or_else(|| std::env::var("JOBWATCH_URL").ok())
        .ok_or("No gateway URL: pass --gateway or set JOBWATCH_URL")?;

    if gateway_url.is_empty() {
        return Err("Gateway URL is empty".into());
    }
    if !gateway_url.starts_with("http://") && !gateway_url.starts_with("https://") {
        return Err(format!(
            "Gateway URL must start with http:// or https:// (got '{gateway_url}')"
        ));
    }

    let mut config = WatchConfig {
        gateway_url: gateway_url.trim_end_matches('/').to_string(),
        ..WatchConfig::default()
    };
    if let Some(n) = cli.reconnect_attempts {
        config.reconnect_attempts = n;
    }
    if let Some(n) = cli.poll_attempts {
        config.poll_max_attempts = n.max(1);
    }
    Ok(config)
}
