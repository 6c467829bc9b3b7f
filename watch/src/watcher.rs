//! Reconnecting job-status client.
//!
//! [`JobWatcher`] drives one job's status stream end to end: fetch a token,
//! connect the WebSocket, send liveness probes, detect staleness, and
//! reconnect with exponential backoff. Authentication rejections discard the
//! held token so the next attempt re-authenticates; transport failures back
//! off and retry; a terminal job status ends the watch for good.
//!
//! Connection state is a single tagged value — there is no way to be
//! `connected` with a reconnect timer pending, because timers live inside the
//! one active attempt. A watcher is consumed by [`JobWatcher::run`], so
//! switching jobs means dropping the old run future (cancelling its timers
//! and transport with it) and building a new watcher.
//!
//! Observable state is published on a `tokio::sync::watch` channel; UIs keep
//! only the latest [`JobView`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::client::GatewayClient;
use crate::config::WatchConfig;
use crate::job::{normalize_result, parse_update, JobStatus, JobUpdate};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection lifecycle of a [`JobWatcher`]. Exactly one state is active at
/// any time; `Disconnected` is both the initial and the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Authenticating,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a UI can observe about one watched job.
#[derive(Debug, Clone, Default)]
pub struct JobView {
    pub connection: ConnectionState,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Set when a payload failed to decode; independent of `status` and of
    /// the connection — a malformed message never drops the transport.
    pub parse_error: Option<String>,
}

/// How a watch ended.
#[derive(Debug)]
pub enum WatchOutcome {
    /// A terminal job status was observed; the final view is attached.
    Finished(JobView),
    /// A token could not be obtained. Not retried automatically — new job
    /// interest restarts from authentication.
    AuthFailed(String),
    /// The reconnect budget ran out before a terminal status.
    Exhausted { attempts: u32, last_error: String },
}

/// Why one connection (or connection attempt) ended.
enum ConnEnd {
    /// Terminal job status observed — the success path.
    Terminal,
    /// The gateway rejected the token (HTTP 401/403 on the handshake).
    AuthRejected(String),
    /// No inbound traffic for two keepalive intervals.
    Stale(String),
    /// Network-level failure.
    Transport(String),
}

/// Reconnecting watcher for one job's status stream.
pub struct JobWatcher {
    config: WatchConfig,
    client: GatewayClient,
    job_id: String,
    view_tx: watch::Sender<JobView>,
    view: JobView,
    token: Option<String>,
    attempts: u32,
}

impl JobWatcher {
    pub fn new(config: WatchConfig, client: GatewayClient, job_id: String) -> Self {
        let (view_tx, _) = watch::channel(JobView::default());
        Self {
            config,
            client,
            job_id,
            view_tx,
            view: JobView::default(),
            token: None,
            attempts: 0,
        }
    }

    /// Receiver for view snapshots. Holds only the latest value.
    pub fn subscribe(&self) -> watch::Receiver<JobView> {
        self.view_tx.subscribe()
    }

    fn push_view(&self) {
        let _ = self.view_tx.send_replace(self.view.clone());
    }

    fn set_connection(&mut self, state: ConnectionState) {
        self.view.connection = state;
        self.push_view();
    }

    /// Run the watch to completion. Consumes the watcher — one transport
    /// attempt and one set of timers exist at a time, and dropping the
    /// returned future cancels all of it.
    pub async fn run(mut self) -> WatchOutcome {
        loop {
            // (Re-)authenticate whenever no token is held.
            if self.token.is_none() {
                self.set_connection(ConnectionState::Authenticating);
                match self.client.fetch_token(&self.job_id).await {
                    Ok(token) => self.token = Some(token),
                    Err(e) => {
                        let reason = if e.is_auth() {
                            format!("token issuance rejected: {e}")
                        } else if e.is_rate_limited() {
                            format!("gateway rate limited the token request: {e}")
                        } else {
                            format!("token fetch failed: {e}")
                        };
                        warn!(job_id = %self.job_id, error = %e, "Authentication failed");
                        self.view.error = Some(reason.clone());
                        self.set_connection(ConnectionState::Disconnected);
                        return WatchOutcome::AuthFailed(reason);
                    }
                }
            }

            self.set_connection(ConnectionState::Connecting);
            let token = self.token.clone().unwrap_or_default();
            let url = self.client.job_stream_url(&self.job_id, &token);
            let connect = tokio_tungstenite::connect_async(&url);
            let end = match timeout(
                Duration::from_secs(self.config.connect_timeout_secs),
                connect,
            )
            .await
            {
                Ok(Ok((stream, _response))) => {
                    self.attempts = 0;
                    self.view.error = None;
                    self.set_connection(ConnectionState::Connected);
                    info!(job_id = %self.job_id, "Connected");
                    self.run_connection(stream).await
                }
                Ok(Err(e)) => classify_connect_error(&e),
                Err(_) => ConnEnd::Transport("connect timed out".to_string()),
            };

            match end {
                ConnEnd::Terminal => {
                    self.set_connection(ConnectionState::Disconnected);
                    return WatchOutcome::Finished(self.view.clone());
                }
                ConnEnd::AuthRejected(reason) => {
                    // Discard the token — the next cycle re-authenticates.
                    self.token = None;
                    debug!(job_id = %self.job_id, "Token discarded after rejection");
                    if let Some(outcome) = self.backoff_or_exhaust(&reason).await {
                        return outcome;
                    }
                }
                ConnEnd::Stale(reason) | ConnEnd::Transport(reason) => {
                    if let Some(outcome) = self.backoff_or_exhaust(&reason).await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Sleep out the backoff before the next attempt, or end the watch when
    /// the retry budget is spent.
    async fn backoff_or_exhaust(&mut self, reason: &str) -> Option<WatchOutcome> {
        self.attempts += 1;
        if self.attempts > self.config.reconnect_attempts {
            let last_error = format!(
                "retry budget exhausted after {} attempts: {reason}",
                self.config.reconnect_attempts
            );
            warn!(job_id = %self.job_id, "{last_error}");
            self.view.error = Some(last_error.clone());
            self.set_connection(ConnectionState::Disconnected);
            return Some(WatchOutcome::Exhausted {
                attempts: self.config.reconnect_attempts,
                last_error,
            });
        }

        let delay = reconnect_delay(
            self.config.reconnect_base_ms,
            self.config.backoff_multiplier,
            self.config.backoff_cap_ms,
            self.attempts,
        );
        info!(
            job_id = %self.job_id,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Reconnecting after backoff"
        );
        self.set_connection(ConnectionState::Reconnecting);
        tokio::time::sleep(delay).await;
        None
    }

    /// One established connection: dispatch inbound frames, probe liveness,
    /// detect staleness. Returns how the connection ended.
    async fn run_connection(&mut self, stream: WsStream) -> ConnEnd {
        let (mut sink, mut stream) = stream.split();
        let keepalive = Duration::from_secs(self.config.keepalive_secs.max(1));
        let mut probe = interval(keepalive);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        if let Some(end) = self.handle_text(&text) {
                            return end;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_inbound = Instant::now();
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return ConnEnd::Transport("pong send failed".to_string());
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_inbound = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "connection closed".to_string(),
                            |f| format!("connection closed: {} {}", u16::from(f.code), f.reason),
                        );
                        return ConnEnd::Transport(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return ConnEnd::Transport(e.to_string()),
                    None => return ConnEnd::Transport("stream ended".to_string()),
                },
                _ = probe.tick() => {
                    // Half-open detection: an open socket that has delivered
                    // nothing for two probe intervals is treated as dead.
                    if last_inbound.elapsed() > keepalive * 2 {
                        warn!(job_id = %self.job_id, "Connection stale, cycling");
                        return ConnEnd::Stale(
                            "no inbound traffic for two keepalive intervals".to_string(),
                        );
                    }
                    if sink
                        .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
                        .await
                        .is_err()
                    {
                        return ConnEnd::Transport("ping send failed".to_string());
                    }
                }
            }
        }
    }

    /// Apply one inbound frame. Returns `Some(Terminal)` once a terminal job
    /// status is observed. Malformed payloads are recorded as parse errors
    /// and never end the connection.
    fn handle_text(&mut self, text: &str) -> Option<ConnEnd> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(job_id = %self.job_id, error = %e, "Malformed frame");
                self.view.parse_error = Some(format!("malformed message: {e}"));
                self.push_view();
                return None;
            }
        };

        if value["type"].as_str() == Some("pong") {
            return None;
        }

        let update = match parse_update(&value) {
            Ok(update) => update,
            Err(e) => {
                debug!(job_id = %self.job_id, error = %e, "Malformed job update");
                self.view.parse_error = Some(e);
                self.push_view();
                return None;
            }
        };
        if !update.is_for(&self.job_id) {
            debug!(job_id = %self.job_id, "Ignoring update tagged for another job");
            return None;
        }
        debug!(
            job_id = %self.job_id,
            status = %update.status,
            timestamp = ?update.timestamp,
            "Update received"
        );

        let terminal = apply_update(&mut self.view, update);
        self.push_view();
        terminal.then_some(ConnEnd::Terminal)
    }
}

/// Fold one update into the view. Returns whether the update carried a
/// terminal status.
///
/// A `result` payload that fails to decode sets `parse_error` while the
/// status still takes effect — a finished job with a mangled payload is still
/// finished.
pub(crate) fn apply_update(view: &mut JobView, update: JobUpdate) -> bool {
    view.status = update.status;
    if let Some(result) = update.result {
        let (normalized, parse_error) = normalize_result(result);
        view.result = Some(normalized);
        view.parse_error = parse_error;
    }
    if update.status == JobStatus::Failed {
        view.error = Some(
            update
                .error
                .unwrap_or_else(|| "Job execution failed".to_string()),
        );
    } else if let Some(error) = update.error {
        view.error = Some(error);
    }

    update.status.is_terminal()
}

/// Backoff delay before reconnect attempt `attempt` (1-based):
/// `min(base * multiplier^(attempt-1), cap)`.
pub(crate) fn reconnect_delay(base_ms: u64, multiplier: f64, cap_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let ms = (base_ms as f64) * multiplier.powi(exponent as i32);
    Duration::from_millis((ms as u64).min(cap_ms))
}

/// Split handshake failures into authentication rejections (token is stale,
/// re-authenticate) and everything else (back off and retry). A 429 lands in
/// the transport class on purpose: a fresh token would not lift a ban, while
/// backing off might.
fn classify_connect_error(e: &tungstenite::Error) -> ConnEnd {
    match e {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                ConnEnd::AuthRejected(format!("handshake rejected: HTTP {status}"))
            } else {
                ConnEnd::Transport(format!("handshake failed: HTTP {status}"))
            }
        }
        other => ConnEnd::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(gateway_url: &str) -> WatchConfig {
        WatchConfig {
            gateway_url: gateway_url.to_string(),
            reconnect_base_ms: 1,
            reconnect_attempts: 1,
            backoff_multiplier: 1.5,
            backoff_cap_ms: 10,
            keepalive_secs: 30,
            connect_timeout_secs: 2,
            ..WatchConfig::default()
        }
    }

    #[test]
    fn backoff_sequence_matches_formula() {
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| reconnect_delay(1000, 1.5, 10_000, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 1500, 2250, 3375, 5062]);
    }

    #[test]
    fn backoff_caps_and_never_decreases() {
        let mut previous = 0;
        for attempt in 1..=12 {
            let delay = reconnect_delay(1000, 1.5, 10_000, attempt).as_millis() as u64;
            assert!(delay >= previous);
            assert!(delay <= 10_000);
            previous = delay;
        }
        assert_eq!(previous, 10_000);
    }

    #[test]
    fn handshake_auth_codes_are_auth_class() {
        for status in [401u16, 403] {
            let response = tungstenite::http::Response::builder()
                .status(status)
                .body(None)
                .unwrap();
            match classify_connect_error(&tungstenite::Error::Http(response)) {
                ConnEnd::AuthRejected(_) => {}
                _ => panic!("HTTP {status} should classify as auth rejection"),
            }
        }
    }

    #[test]
    fn handshake_other_codes_are_transport_class() {
        for status in [429u16, 500, 502] {
            let response = tungstenite::http::Response::builder()
                .status(status)
                .body(None)
                .unwrap();
            match classify_connect_error(&tungstenite::Error::Http(response)) {
                ConnEnd::Transport(_) => {}
                _ => panic!("HTTP {status} should classify as transport failure"),
            }
        }
    }

    #[test]
    fn completed_with_malformed_result_still_completes() {
        let mut view = JobView::default();
        let update =
            parse_update(&json!({"status": "completed", "result": "not {json"})).unwrap();
        assert!(apply_update(&mut view, update));
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.result, Some(json!("not {json")));
        assert!(view.parse_error.is_some());
    }

    #[test]
    fn failed_without_detail_gets_default_error() {
        let mut view = JobView::default();
        let update = parse_update(&json!({"status": "failed"})).unwrap();
        assert!(apply_update(&mut view, update));
        assert_eq!(view.error.as_deref(), Some("Job execution failed"));
    }

    #[tokio::test]
    async fn token_fetch_failure_ends_disconnected_without_connecting() {
        let config = test_config("http://127.0.0.1:9");
        let client = GatewayClient::new(config.gateway_url.clone());
        let watcher = JobWatcher::new(config, client, "job-1".to_string());

        let mut view_rx = watcher.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_task = {
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                while view_rx.changed().await.is_ok() {
                    let connection = view_rx.borrow().connection;
                    seen.lock().unwrap().push(connection);
                }
            })
        };

        let outcome = watcher.run().await;
        match outcome {
            WatchOutcome::AuthFailed(reason) => assert!(reason.contains("token fetch failed")),
            other => panic!("expected AuthFailed, got {other:?}"),
        }

        let _ = seen_task.await;
        let seen = seen.lock().unwrap();
        assert!(!seen.contains(&ConnectionState::Connecting));
        assert_eq!(seen.last(), Some(&ConnectionState::Disconnected));
    }

    /// Minimal canned-response gateway: token requests succeed (and are
    /// counted), WebSocket upgrades are refused with 401.
    async fn spawn_reject_gateway(token_fetches: Arc<AtomicU32>) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 2048];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let response = if request.starts_with("GET /api/ws_token/") {
                    token_fetches.fetch_add(1, Ordering::SeqCst);
                    let body = r#"{"token":"stub-token"}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                } else {
                    "HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                        .to_string()
                };
                let _ = sock.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn auth_rejection_discards_token_and_reauthenticates() {
        let token_fetches = Arc::new(AtomicU32::new(0));
        let addr = spawn_reject_gateway(Arc::clone(&token_fetches)).await;
        let config = test_config(&format!("http://{addr}"));
        let client = GatewayClient::new(config.gateway_url.clone());
        let watcher = JobWatcher::new(config, client, "job-1".to_string());

        match watcher.run().await {
            WatchOutcome::Exhausted { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        // One fetch for the initial attempt, one after the 401 discarded the
        // token — the retry re-entered authenticating before connecting.
        assert_eq!(token_fetches.load(Ordering::SeqCst), 2);
    }
}
