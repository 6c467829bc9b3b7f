//! WebSocket transport toward browsers.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws/jobs/{job_id}?token=<token>`. The rate
//!    limiter and then the token check both run *before* the upgrade
//!    completes; a connection that fails either never touches the relay.
//! 2. On upgrade the connection joins the job's relay room and receives every
//!    `job.update` the room publishes, starting with the synthetic current
//!    status.
//! 3. On disconnect — clean close, transport error, or task cancellation —
//!    the room membership is released.
//!
//! ## Rejection status codes (upgrade time)
//!
//! | Status | Meaning                                   |
//! |--------|-------------------------------------------|
//! | 429    | Source address is rate-limited or banned  |
//! | 401    | Token missing                             |
//! | 403    | Token invalid (or verification failed closed) |
//!
//! ## Message types
//!
//! | Direction        | Type         | Fields                                     |
//! |------------------|--------------|--------------------------------------------|
//! | client → gateway | `ping`       | —                                          |
//! | gateway → client | `pong`       | —                                          |
//! | gateway → client | `job.update` | `job_id`, `status`, `result?`, `error?`, `timestamp` |
//! | gateway → client | `error`      | `code`, `message`                          |

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::relay::{JobRelay, SubscriberId};
use crate::state::AppState;
use crate::util;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// Job-scoped token passed as a query parameter (browsers can't set
    /// headers on WebSocket upgrades).
    pub token: Option<String>,
}

/// `GET /api/ws/jobs/{job_id}?token=<token>` — WebSocket upgrade handler.
///
/// The route sits behind the rate-limit layer (429 happens there, before this
/// handler runs); token verification gates the upgrade here. Rejection always
/// happens with an explicit status before any relay join.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let addr = util::client_addr(&headers, peer);

    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        debug!(addr = %addr, job_id = %job_id, "Upgrade rejected: missing token");
        return (StatusCode::UNAUTHORIZED, "Missing token").into_response();
    };

    if !state.authenticator.verify(&token, &job_id).await {
        warn!(addr = %addr, job_id = %job_id, "Upgrade rejected: invalid token");
        return (StatusCode::FORBIDDEN, "Invalid token").into_response();
    }

    info!(addr = %addr, job_id = %job_id, "WebSocket upgrade authorized");
    ws.on_upgrade(move |socket| handle_ws(socket, state, job_id))
}

/// Room membership that releases itself on drop.
///
/// `leave` runs from `Drop`, so the room is cleaned up on every exit path of
/// the connection handler, including cancellation and a crashed write path.
struct RelaySubscription {
    relay: JobRelay,
    job_id: String,
    subscriber: SubscriberId,
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        let relay = self.relay.clone();
        let job_id = std::mem::take(&mut self.job_id);
        let subscriber = self.subscriber;
        tokio::spawn(async move {
            relay.leave(&job_id, subscriber).await;
        });
    }
}

/// Main per-connection event loop.
///
/// Relay events arrive on a bounded mpsc channel and are forwarded to the
/// socket by a dedicated send task, so the relay never writes to the socket
/// directly. The read half answers liveness probes.
async fn handle_ws(socket: axum::extract::ws::WebSocket, state: AppState, job_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Value>(state.config.relay.subscriber_queue);
    let subscriber = Uuid::new_v4();

    state.relay.join(&job_id, subscriber, tx.clone()).await;
    let _subscription = RelaySubscription {
        relay: state.relay.clone(),
        job_id: job_id.clone(),
        subscriber,
    };

    // Task: forward channel messages to the WebSocket sink
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    warn!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            axum::extract::ws::Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    let _ = tx
                        .try_send(json!({
                            "type": "error",
                            "code": "INVALID_JSON",
                            "message": "Failed to parse JSON message"
                        }));
                    continue;
                };

                match parsed["type"].as_str().unwrap_or("") {
                    "ping" => {
                        let _ = tx.try_send(json!({"type": "pong"}));
                    }
                    other => {
                        let _ = tx.try_send(json!({
                            "type": "error",
                            "code": "UNKNOWN_TYPE",
                            "message": format!("Unknown message type: {other}")
                        }));
                    }
                }
            }
            axum::extract::ws::Message::Close(_) => break,
            _ => {}
        }
    }

    debug!(job_id = %job_id, subscriber = %subscriber, "WebSocket disconnected");
    send_task.abort();
    // _subscription drops here and leaves the room.
}
