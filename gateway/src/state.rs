//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::TokenAuthenticator;
use crate::backend::BackendClient;
use crate::config::Config;
use crate::ratelimit::RateLimiter;
use crate::relay::JobRelay;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// REST + event-source client for the execution backend.
    pub backend: Arc<BackendClient>,
    /// Token issuance and fail-closed verification.
    pub authenticator: TokenAuthenticator,
    /// Per-address fixed-window limiter shared by every inbound route.
    pub rate_limiter: RateLimiter,
    /// Per-job rooms fanning backend events out to subscribers.
    pub relay: JobRelay,
}

impl AppState {
    /// Wire up all components from a loaded configuration.
    pub fn new(config: Config) -> Self {
        let backend = Arc::new(BackendClient::new(&config.backend));
        Self {
            authenticator: TokenAuthenticator::new(backend.clone()),
            rate_limiter: RateLimiter::new(&config.ratelimit),
            relay: JobRelay::new(backend.clone()),
            backend,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }
}
