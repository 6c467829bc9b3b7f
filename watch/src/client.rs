//! HTTP client for the gateway's REST endpoints.
//!
//! [`GatewayClient`] wraps `reqwest::Client` and provides typed methods for
//! the endpoints jobwatch consumes: token issuance, job submission, and the
//! polling path. No credential is held here — the gateway's REST surface is
//! the browser-facing one, and tokens are fetched per job.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `error` field in the JSON body. If
//! parsing fails, the raw response body is returned as the error message.

use std::time::Duration;

use serde_json::Value;

/// HTTP client for one jobgw gateway.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    /// Create a new client for the gateway at the given URL.
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        // Strip trailing slash for consistent URL construction
        let base_url = base_url.trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    /// `GET /api/ws_token/{job_id}` — fetch a streaming token for one job.
    pub async fn fetch_token(&self, job_id: &str) -> Result<String, ClientError> {
        let resp = self
            .http
            .get(format!("{}/api/ws_token/{}", self.base_url, job_id))
            .send()
            .await
            .map_err(ClientError::Request)?;
        let body = Self::handle_response(resp).await?;
        body["token"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| ClientError::Protocol("token missing from response".into()))
    }

    /// `GET /api/jobs/{job_id}` — current status/result for a job.
    pub async fn get_job(&self, job_id: &str) -> Result<Value, ClientError> {
        let resp = self
            .http
            .get(format!("{}/api/jobs/{}", self.base_url, job_id))
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await
    }

    /// `POST /api/jobs` — submit code for execution. Returns the job id.
    pub async fn submit(
        &self,
        code: &str,
        language: &str,
        filename: &str,
    ) -> Result<String, ClientError> {
        let resp = self
            .http
            .post(format!("{}/api/jobs", self.base_url))
            .json(&serde_json::json!({
                "code": code,
                "language": language,
                "filename": filename,
            }))
            .send()
            .await
            .map_err(ClientError::Request)?;
        let body = Self::handle_response(resp).await?;
        body["job_id"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| ClientError::Protocol("job_id missing from response".into()))
    }

    /// The WebSocket URL for one job's status stream, carrying the token as a
    /// query parameter.
    pub fn job_stream_url(&self, job_id: &str, token: &str) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            let rest = self.base_url.strip_prefix("http://").unwrap_or(&self.base_url);
            format!("ws://{rest}")
        };
        format!("{ws_base}/api/ws/jobs/{job_id}?token={token}")
    }

    /// Parse an HTTP response — returns the JSON body on success, or a
    /// [`ClientError`] with the error message on failure.
    async fn handle_response(resp: reqwest::Response) -> Result<Value, ClientError> {
        let status = resp.status();
        let body = resp.text().await.map_err(ClientError::Request)?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| ClientError::Protocol(format!("Invalid JSON from gateway: {e}")))
        } else {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or(body);
            Err(ClientError::Gateway {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Errors returned by [`GatewayClient`] methods.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The gateway returned a non-2xx HTTP status.
    Gateway { status: u16, message: String },
    /// The response body was not in the expected shape.
    Protocol(String),
}

impl ClientError {
    /// Returns `true` if the gateway explicitly rejected authentication.
    pub fn is_auth(&self) -> bool {
        matches!(self, ClientError::Gateway { status: 401 | 403, .. })
    }

    /// Returns `true` if the gateway rate-limited the request.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClientError::Gateway { status: 429, .. })
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {e}"),
            ClientError::Gateway { status, message } => {
                write!(f, "Gateway error (HTTP {status}): {message}")
            }
            ClientError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_converts_scheme_and_carries_token() {
        let client = GatewayClient::new("http://localhost:4100/".to_string());
        assert_eq!(
            client.job_stream_url("job-1", "tok"),
            "ws://localhost:4100/api/ws/jobs/job-1?token=tok"
        );

        let client = GatewayClient::new("https://gw.example.com".to_string());
        assert_eq!(
            client.job_stream_url("job-1", "tok"),
            "wss://gw.example.com/api/ws/jobs/job-1?token=tok"
        );
    }

    #[test]
    fn auth_classification() {
        let auth = ClientError::Gateway {
            status: 403,
            message: String::new(),
        };
        let limited = ClientError::Gateway {
            status: 429,
            message: String::new(),
        };
        assert!(auth.is_auth());
        assert!(!auth.is_rate_limited());
        assert!(limited.is_rate_limited());
        assert!(!limited.is_auth());
    }
}
