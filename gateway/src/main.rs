#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # jobgw
//!
//! Job-status streaming gateway for remote code execution.
//!
//! jobgw sits between browsers and the execution backend. Browsers fetch a
//! job-scoped token, open a WebSocket, and receive live status updates for
//! their job; the gateway keeps exactly one upstream subscription per job no
//! matter how many browsers watch it, rate-limits every inbound attempt, and
//! verifies every token against the backend before upgrading.
//!
//! ## API surface
//!
//! | Method | Path                      | Rate-limited | Description                   |
//! |--------|---------------------------|--------------|-------------------------------|
//! | GET    | `/api/health`             | No           | Liveness probe                |
//! | GET    | `/api/ws_token/{job_id}`  | Yes          | Issue a streaming token       |
//! | POST   | `/api/jobs`               | Yes          | Submit code for execution     |
//! | GET    | `/api/jobs/{job_id}`      | Yes          | Current status (polling path) |
//! | GET    | `/api/ws/jobs/{job_id}`   | Yes          | WebSocket status stream       |
//!
//! WebSocket auth is via `?token=<token>` query param (no `Authorization`
//! header available during the upgrade handshake).
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, clap subcommand, router setup, graceful shutdown
//! config.rs     — TOML + env-var configuration
//! state.rs      — shared AppState wiring
//! backend.rs    — REST + event-source client for the execution backend
//! auth.rs       — token issuance and fail-closed verification
//! ratelimit.rs  — fixed-window limiter with temporary bans + sweep
//! relay.rs      — per-job rooms, one upstream subscription each, fan-out
//! ws.rs         — WebSocket upgrade and per-connection event loop
//! routes/
//!   health.rs   — GET /api/health
//!   token.rs    — GET /api/ws_token/{job_id}
//!   jobs.rs     — POST /api/jobs, GET /api/jobs/{job_id}
//! ```

use std::net::SocketAddr;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use jobgw::config::Config;
use jobgw::state::AppState;
use jobgw::{routes, ws};

/// Job-status streaming gateway for remote code execution.
#[derive(Parser)]
#[command(name = "jobgw", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("jobgw v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Backend: {}", config.backend.url);
    info!("Listening on {}", config.server.listen);

    if config.backend.api_key == "change-me" {
        warn!("Using default service key — set JOBGW_API_KEY or update config");
    }

    let state = AppState::new(config);

    // Build router: health is open, everything else sits behind the limiter.
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let limited_routes = Router::new()
        .route("/api/ws_token/{job_id}", get(routes::token::ws_token))
        .route("/api/jobs", post(routes::jobs::submit))
        .route("/api/jobs/{job_id}", get(routes::jobs::get_job))
        .route("/api/ws/jobs/{job_id}", get(ws::ws_upgrade))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            routes::rate_limit,
        ));

    let app = Router::new()
        .merge(public_routes)
        .merge(limited_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: evict expired rate-limit windows and lifted bans
    let limiter = state.rate_limiter.clone();
    let sweep_interval = state.config.ratelimit.sweep_interval_secs;
    let sweep_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(sweep_interval.max(1)));
        loop {
            interval.tick().await;
            let (windows, bans) = limiter.sweep().await;
            if windows > 0 || bans > 0 {
                tracing::debug!(windows, bans, "Rate limit sweep");
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("Server error");

    info!("Shutting down...");
    sweep_task.abort();
    info!("Goodbye");
}
