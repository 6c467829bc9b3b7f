//! HTTP and event-source client for the execution backend.
//!
//! [`BackendClient`] wraps `reqwest::Client` and provides typed methods for
//! each backend endpoint the gateway consumes. All responses are returned as
//! `serde_json::Value` — the route layer decides what to pass through to
//! browsers.
//!
//! ## Authentication
//!
//! Every call carries the service credential in the `X-API-Key` header (or as
//! a `token` query parameter on the event-source WebSocket, where headers are
//! not available). The credential never leaves the gateway process in any
//! other direction.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `error` field in the JSON body. If
//! parsing fails, the raw response body is returned as the error message.

use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::BackendConfig;

/// Upstream event-source WebSocket stream type.
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// HTTP + WebSocket client for the execution backend.
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    upstream_connect_timeout: Duration,
}

impl BackendClient {
    /// Create a new client for the configured backend.
    pub fn new(config: &BackendConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("Failed to build HTTP client");
        // Strip trailing slash for consistent URL construction
        let base_url = config.url.trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            api_key: config.api_key.clone(),
            upstream_connect_timeout: Duration::from_secs(config.upstream_connect_timeout_secs),
        }
    }

    /// The backend's base URL (without trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /api/ws_token/{job_id}` — request a short-lived, job-scoped token.
    pub async fn issue_token(&self, job_id: &str) -> Result<String, BackendError> {
        let resp = self
            .http
            .get(format!("{}/api/ws_token/{}", self.base_url, job_id))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(BackendError::Request)?;
        let body = Self::handle_response(resp).await?;
        body["token"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| BackendError::Protocol("token missing from issuance response".into()))
    }

    /// `POST /api/verify_token` — check a browser-presented token against the
    /// backend. Returns the backend's verdict; callers decide how to treat
    /// transport failures (the authenticator fails closed).
    pub async fn verify_token(&self, token: &str, job_id: &str) -> Result<bool, BackendError> {
        let resp = self
            .http
            .post(format!("{}/api/verify_token", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&serde_json::json!({ "token": token, "job_id": job_id }))
            .send()
            .await
            .map_err(BackendError::Request)?;
        let body = Self::handle_response(resp).await?;
        body["valid"]
            .as_bool()
            .ok_or_else(|| BackendError::Protocol("valid missing from verify response".into()))
    }

    /// `GET /api/get_result/{job_id}` — current status and (if finished) the
    /// result payload for a job.
    pub async fn get_result(&self, job_id: &str) -> Result<Value, BackendError> {
        let resp = self
            .http
            .get(format!("{}/api/get_result/{}", self.base_url, job_id))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(BackendError::Request)?;
        Self::handle_response(resp).await
    }

    /// `POST /api/submit_code` — submit code for execution, returning the
    /// backend's `{job_id}` response.
    pub async fn submit(
        &self,
        code: &str,
        language: &str,
        filename: &str,
    ) -> Result<Value, BackendError> {
        let resp = self
            .http
            .post(format!("{}/api/submit_code", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&serde_json::json!({
                "code": code,
                "language": language,
                "filename": filename,
            }))
            .send()
            .await
            .map_err(BackendError::Request)?;
        Self::handle_response(resp).await
    }

    /// The per-job event-source URL, with the service credential as a query
    /// parameter (no headers on WebSocket upgrades).
    fn event_source_url(&self, job_id: &str) -> Result<String, BackendError> {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(BackendError::Protocol(format!(
                "Invalid backend URL scheme: {}",
                self.base_url
            )));
        };
        Ok(format!("{ws_base}/ws/jobs/{job_id}?token={}", self.api_key))
    }

    /// Open the upstream event-source subscription for one job.
    ///
    /// Bounded by the configured handshake timeout so a dead backend cannot
    /// wedge a room's first join.
    pub async fn subscribe(&self, job_id: &str) -> Result<UpstreamStream, BackendError> {
        let url = self.event_source_url(job_id)?;
        let connect = tokio_tungstenite::connect_async(&url);
        match tokio::time::timeout(self.upstream_connect_timeout, connect).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(BackendError::Upstream(e.to_string())),
            Err(_) => Err(BackendError::Upstream(format!(
                "connect timed out after {}s",
                self.upstream_connect_timeout.as_secs()
            ))),
        }
    }

    /// Parse an HTTP response — returns the JSON body on success, or a
    /// [`BackendError`] with the error message on failure.
    async fn handle_response(resp: reqwest::Response) -> Result<Value, BackendError> {
        let status = resp.status();
        let body = resp.text().await.map_err(BackendError::Request)?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| BackendError::Protocol(format!("Invalid JSON from backend: {e}")))
        } else {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or(body);
            Err(BackendError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Errors returned by [`BackendClient`] methods.
#[derive(Debug)]
pub enum BackendError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The backend returned a non-2xx HTTP status.
    Status { status: u16, message: String },
    /// The response body was not in the expected shape.
    Protocol(String),
    /// The event-source WebSocket could not be established.
    Upstream(String),
}

impl BackendError {
    /// Returns `true` if the error is an HTTP 404 Not Found response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::Status { status: 404, .. })
    }

    /// Returns `true` if the backend explicitly rejected the credential.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BackendError::Status { status: 401 | 403, .. })
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Request(e) => write!(f, "HTTP request failed: {e}"),
            BackendError::Status { status, message } => {
                write!(f, "Backend error (HTTP {status}): {message}")
            }
            BackendError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            BackendError::Upstream(msg) => write!(f, "Upstream subscription failed: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn client_for(url: &str) -> BackendClient {
        BackendClient::new(&BackendConfig {
            url: url.to_string(),
            api_key: "service-key".to_string(),
            connect_timeout_secs: 1,
            request_timeout_secs: 1,
            upstream_connect_timeout_secs: 1,
        })
    }

    #[test]
    fn event_source_url_converts_scheme() {
        let client = client_for("http://backend:8000/");
        assert_eq!(
            client.event_source_url("job-1").unwrap(),
            "ws://backend:8000/ws/jobs/job-1?token=service-key"
        );

        let client = client_for("https://backend.example.com");
        assert_eq!(
            client.event_source_url("job-1").unwrap(),
            "wss://backend.example.com/ws/jobs/job-1?token=service-key"
        );
    }

    #[test]
    fn event_source_url_rejects_unknown_scheme() {
        let client = client_for("ftp://backend");
        assert!(client.event_source_url("job-1").is_err());
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_request_error() {
        let client = client_for("http://127.0.0.1:9");
        match client.get_result("job-1").await {
            Err(BackendError::Request(_)) => {}
            other => panic!("expected Request error, got {other:?}"),
        }
    }
}
