//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, and relay occupancy. No authentication
/// and no rate limiting, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "relay": {
            "rooms": state.relay.room_count().await,
            "subscribers": state.relay.total_subscribers().await,
            "upstream_opens": state.relay.upstream_opens(),
            "upstream_closes": state.relay.upstream_closes(),
        },
        "ratelimit": {
            "tracked": state.rate_limiter.tracked_addresses().await,
            "banned": state.rate_limiter.banned_addresses().await,
        },
    }))
}
