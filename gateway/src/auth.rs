//! Token issuance and verification, delegated to the execution backend.
//!
//! The gateway never mints or caches tokens. Issuance proxies the backend's
//! token endpoint with the service credential; verification round-trips to the
//! backend on every upgrade and **fails closed** — a backend outage, a
//! malformed response, and an explicit rejection all read as "invalid".

use std::sync::Arc;

use tracing::warn;

use crate::backend::{BackendClient, BackendError};

/// Validates and issues the short-lived, job-scoped tokens browsers present
/// at upgrade time.
#[derive(Clone)]
pub struct TokenAuthenticator {
    backend: Arc<BackendClient>,
}

impl TokenAuthenticator {
    pub fn new(backend: Arc<BackendClient>) -> Self {
        Self { backend }
    }

    /// Request a token for `job_id` from the backend.
    pub async fn issue(&self, job_id: &str) -> Result<String, AuthError> {
        match self.backend.issue_token(job_id).await {
            Ok(token) => Ok(token),
            Err(e) if e.is_rejection() => Err(AuthError::Invalid),
            Err(e) => Err(AuthError::BackendUnavailable(e.to_string())),
        }
    }

    /// Check a browser-presented token for `job_id`.
    ///
    /// Any outcome other than an explicit "valid" verdict from the backend —
    /// including network errors and unparsable responses — is `false`.
    pub async fn verify(&self, token: &str, job_id: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        match self.backend.verify_token(token, job_id).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Token verification failed closed");
                false
            }
        }
    }
}

/// Errors surfaced by token issuance.
#[derive(Debug)]
pub enum AuthError {
    /// The backend rejected the issuance request (bad service credential or
    /// unknown job).
    Invalid,
    /// The backend could not be reached or answered garbage. Treated the same
    /// as `Invalid` wherever a verdict is needed.
    BackendUnavailable(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Invalid => write!(f, "token issuance rejected"),
            AuthError::BackendUnavailable(msg) => {
                write!(f, "token backend unavailable: {msg}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn authenticator_for(url: &str) -> TokenAuthenticator {
        TokenAuthenticator::new(Arc::new(BackendClient::new(&BackendConfig {
            url: url.to_string(),
            api_key: "service-key".to_string(),
            connect_timeout_secs: 1,
            request_timeout_secs: 1,
            upstream_connect_timeout_secs: 1,
        })))
    }

    #[tokio::test]
    async fn verify_fails_closed_when_backend_unreachable() {
        let auth = authenticator_for("http://127.0.0.1:9");
        assert!(!auth.verify("some-token", "job-1").await);
    }

    #[tokio::test]
    async fn verify_rejects_empty_token_without_backend_call() {
        let auth = authenticator_for("http://127.0.0.1:9");
        assert!(!auth.verify("", "job-1").await);
    }

    #[tokio::test]
    async fn issue_maps_unreachable_backend_to_unavailable() {
        let auth = authenticator_for("http://127.0.0.1:9");
        match auth.issue("job-1").await {
            Err(AuthError::BackendUnavailable(_)) => {}
            other => panic!("expected BackendUnavailable, got {other:?}"),
        }
    }
}
