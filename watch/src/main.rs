//! # jobwatch
//!
//! CLI consumer for the jobgw gateway. Streams live status updates for a
//! remote code execution job over a reconnecting WebSocket, and falls back to
//! bounded polling when streaming is unavailable or its retry budget runs out.
//!
//! ## Architecture
//!
//! ```text
//! main.rs     — entry point, clap subcommands, wiring, exit codes
//! config.rs   — flag/env configuration loading
//! client.rs   — HTTP client for the gateway REST endpoints
//! job.rs      — JobStatus / JobUpdate wire types, result normalization
//! watcher.rs  — reconnecting WebSocket client (state machine, backoff)
//! poll.rs     — bounded polling fallback
//! ```
//!
//! ## Exit codes
//!
//! - `0` — job completed
//! - `1` — job failed, or the watch could not run at all
//! - `2` — stopped watching without a terminal status (polling exhausted)

mod client;
mod config;
mod job;
mod poll;
mod watcher;

use clap::Parser;
use tracing::warn;

use client::GatewayClient;
use config::{Cli, Commands, WatchConfig};
use job::JobStatus;
use poll::PollOutcome;
use watcher::{JobView, JobWatcher, WatchOutcome};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let cli = Cli::parse();
    let config = match config::load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("jobwatch: configuration error: {e}");
            std::process::exit(1);
        }
    };

    let client = GatewayClient::new(config.gateway_url.clone());

    let code = match cli.command {
        Commands::Watch { job_id } => run_watch(&config, &client, &job_id).await,
        Commands::Poll { job_id } => run_poll(&config, &client, &job_id).await,
        Commands::Submit {
            file,
            language,
            filename,
        } => run_submit(&config, &client, &file, &language, filename.as_deref()).await,
    };
    std::process::exit(code);
}

/// Stream one job's status; on streaming exhaustion, fall back to polling.
async fn run_watch(config: &WatchConfig, client: &GatewayClient, job_id: &str) -> i32 {
    let watcher = JobWatcher::new(config.clone(), client.clone(), job_id.to_string());
    let mut view_rx = watcher.subscribe();

    // Print connection/status transitions as they happen.
    let progress_job = job_id.to_string();
    let progress = tokio::spawn(async move {
        let mut last = None;
        while view_rx.changed().await.is_ok() {
            let view = view_rx.borrow().clone();
            let snapshot = (view.connection, view.status);
            if last != Some(snapshot) {
                println!(
                    "job {progress_job}: {} [{}]",
                    view.status, view.connection
                );
                last = Some(snapshot);
            }
        }
    });

    let outcome = watcher.run().await;
    let _ = progress.await;

    match outcome {
        WatchOutcome::Finished(view) => print_final(&view),
        WatchOutcome::AuthFailed(reason) => {
            eprintln!("jobwatch: {reason}");
            1
        }
        WatchOutcome::Exhausted {
            attempts,
            last_error,
        } => {
            warn!(attempts, error = %last_error, "Streaming exhausted, falling back to polling");
            run_poll(config, client, job_id).await
        }
    }
}

/// Poll one job's status without streaming.
async fn run_poll(config: &WatchConfig, client: &GatewayClient, job_id: &str) -> i32 {
    let outcome = poll::poll_job(client, config, job_id, |status, _view| {
        println!("job {job_id}: {status}");
    })
    .await;

    match outcome {
        Ok(PollOutcome::Terminal(view)) => print_final(&view),
        Ok(PollOutcome::Exhausted { attempts }) => {
            eprintln!(
                "jobwatch: no terminal status after {attempts} polls — stopped watching \
                 (the job may still be running)"
            );
            2
        }
        Err(e) => {
            eprintln!("jobwatch: polling failed: {e}");
            1
        }
    }
}

/// Submit a source file, then watch the resulting job.
async fn run_submit(
    config: &WatchConfig,
    client: &GatewayClient,
    file: &std::path::Path,
    language: &str,
    filename: Option<&str>,
) -> i32 {
    let code = match tokio::fs::read_to_string(file).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("jobwatch: failed to read {}: {e}", file.display());
            return 1;
        }
    };
    let filename = filename.map(ToString::to_string).unwrap_or_else(|| {
        file.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string())
    });

    match client.submit(&code, language, &filename).await {
        Ok(job_id) => {
            println!("submitted: job {job_id}");
            run_watch(config, client, &job_id).await
        }
        Err(e) => {
            eprintln!("jobwatch: submit failed: {e}");
            1
        }
    }
}

/// Print the terminal view and derive the exit code.
fn print_final(view: &JobView) -> i32 {
    match view.status {
        JobStatus::Completed => {
            println!("completed");
            if let Some(result) = &view.result {
                match serde_json::to_string_pretty(result) {
                    Ok(pretty) => println!("{pretty}"),
                    Err(_) => println!("{result}"),
                }
            }
            if let Some(parse_error) = &view.parse_error {
                eprintln!("jobwatch: {parse_error}");
            }
            0
        }
        JobStatus::Failed => {
            eprintln!(
                "failed: {}",
                view.error.as_deref().unwrap_or("Job execution failed")
            );
            1
        }
        other => {
            eprintln!("jobwatch: watch ended with non-terminal status '{other}'");
            1
        }
    }
}
