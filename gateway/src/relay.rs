//! Per-job fan-out of execution backend events.
//!
//! A *room* is the set of client connections watching one job. Each room owns
//! exactly one upstream event-source subscription to the backend, shared by
//! every member — joins reuse it, and the last leave tears it down. The first
//! event published into a fresh room is synthesized from the backend's current
//! status, so a subscriber arriving after the job already finished still sees
//! a terminal update.
//!
//! Delivery is per-subscriber and non-blocking: every member has a bounded
//! queue and a subscriber whose queue overflows is dropped from the room (and
//! logged) instead of stalling the others. A terminal update does not evict
//! subscribers — each connection decides for itself when to leave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::BackendClient;
use crate::util::now_ms;

/// Identifies one joined connection within a room.
pub type SubscriberId = Uuid;

/// One job's subscriber set plus its upstream subscription task.
struct Room {
    subscribers: HashMap<SubscriberId, mpsc::Sender<Value>>,
    upstream: tokio::task::JoinHandle<()>,
}

struct RelayInner {
    /// Rooms keyed by job id. The map lock is held only for membership
    /// bookkeeping, never across subscriber sends.
    rooms: Mutex<HashMap<String, Room>>,
    backend: Arc<BackendClient>,
    upstream_opens: AtomicU64,
    upstream_closes: AtomicU64,
}

/// Shared relay handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct JobRelay {
    inner: Arc<RelayInner>,
}

impl JobRelay {
    pub fn new(backend: Arc<BackendClient>) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                rooms: Mutex::new(HashMap::new()),
                backend,
                upstream_opens: AtomicU64::new(0),
                upstream_closes: AtomicU64::new(0),
            }),
        }
    }

    /// Add a connection to `job_id`'s room, creating the room (and its
    /// upstream subscription) if this is the first member.
    ///
    /// The room map lock is held across room creation, so concurrent first
    /// joins for the same job still open exactly one upstream subscription.
    pub async fn join(&self, job_id: &str, subscriber: SubscriberId, tx: mpsc::Sender<Value>) {
        let mut rooms = self.inner.rooms.lock().await;
        let room = rooms.entry(job_id.to_string()).or_insert_with(|| {
            self.inner.upstream_opens.fetch_add(1, Ordering::Relaxed);
            info!(job_id = %job_id, "Room opened, subscribing upstream");
            Room {
                subscribers: HashMap::new(),
                upstream: tokio::spawn(upstream_task(self.clone(), job_id.to_string())),
            }
        });
        room.subscribers.insert(subscriber, tx);
        debug!(
            job_id = %job_id,
            subscriber = %subscriber,
            members = room.subscribers.len(),
            "Subscriber joined"
        );
    }

    /// Remove a connection from `job_id`'s room. When the last member leaves,
    /// the upstream subscription is cancelled and the room removed.
    ///
    /// A no-op for unknown rooms or already-removed subscribers (the relay
    /// may have dropped a subscriber for backpressure before its connection
    /// handler got around to leaving).
    pub async fn leave(&self, job_id: &str, subscriber: SubscriberId) {
        let mut rooms = self.inner.rooms.lock().await;
        let Some(room) = rooms.get_mut(job_id) else {
            return;
        };
        if room.subscribers.remove(&subscriber).is_none() {
            return;
        }
        debug!(
            job_id = %job_id,
            subscriber = %subscriber,
            members = room.subscribers.len(),
            "Subscriber left"
        );
        if room.subscribers.is_empty() {
            if let Some(room) = rooms.remove(job_id) {
                room.upstream.abort();
            }
            self.inner.upstream_closes.fetch_add(1, Ordering::Relaxed);
            info!(job_id = %job_id, "Room empty, upstream subscription closed");
        }
    }

    /// Fan an update out to every member of `job_id`'s room.
    ///
    /// Sends are `try_send` against each member's bounded queue: a full queue
    /// means the subscriber is too slow and gets dropped from the room; a
    /// closed queue means its connection already died. Either way the rest of
    /// the room is unaffected.
    pub async fn publish(&self, job_id: &str, update: Value) {
        let targets: Vec<(SubscriberId, mpsc::Sender<Value>)> = {
            let rooms = self.inner.rooms.lock().await;
            let Some(room) = rooms.get(job_id) else {
                return;
            };
            room.subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(update.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        job_id = %job_id,
                        subscriber = %id,
                        "Subscriber queue full, dropping subscriber"
                    );
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(job_id = %job_id, subscriber = %id, "Subscriber channel closed");
                    dead.push(id);
                }
            }
        }
        for id in dead {
            self.leave(job_id, id).await;
        }
    }

    /// Number of open rooms.
    pub async fn room_count(&self) -> usize {
        self.inner.rooms.lock().await.len()
    }

    /// Number of members in `job_id`'s room (0 if no such room).
    pub async fn subscriber_count(&self, job_id: &str) -> usize {
        self.inner
            .rooms
            .lock()
            .await
            .get(job_id)
            .map_or(0, |room| room.subscribers.len())
    }

    /// Total members across all rooms.
    pub async fn total_subscribers(&self) -> usize {
        self.inner
            .rooms
            .lock()
            .await
            .values()
            .map(|room| room.subscribers.len())
            .sum()
    }

    /// Upstream subscriptions opened since startup.
    pub fn upstream_opens(&self) -> u64 {
        self.inner.upstream_opens.load(Ordering::Relaxed)
    }

    /// Upstream subscriptions closed since startup.
    pub fn upstream_closes(&self) -> u64 {
        self.inner.upstream_closes.load(Ordering::Relaxed)
    }
}

/// One room's upstream subscription: fetch current status as a synthetic
/// first event, then republish every live event until the stream ends.
///
/// Ends without tearing the room down — subscribers keep their connections
/// and decide independently when to leave. Aborted by the last `leave`.
async fn upstream_task(relay: JobRelay, job_id: String) {
    match relay.inner.backend.get_result(&job_id).await {
        Ok(result) => {
            let update = synthesize_update(&job_id, &result);
            relay.publish(&job_id, update).await;
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Initial status fetch failed");
        }
    }

    let mut stream = match relay.inner.backend.subscribe(&job_id).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Upstream subscription failed");
            return;
        }
    };
    info!(job_id = %job_id, "Upstream subscription established");

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                let Ok(mut update) = serde_json::from_str::<Value>(&text) else {
                    warn!(job_id = %job_id, "Malformed upstream event, skipping");
                    continue;
                };
                tag_update(&mut update, &job_id);
                relay.publish(&job_id, update).await;
            }
            Ok(tokio_tungstenite::tungstenite::Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Upstream stream error");
                break;
            }
        }
    }
    debug!(job_id = %job_id, "Upstream stream ended");
}

/// Build a `job.update` message from the backend's `getResult` response.
fn synthesize_update(job_id: &str, result: &Value) -> Value {
    let mut update = serde_json::json!({
        "type": "job.update",
        "job_id": job_id,
        "status": result["status"].as_str().unwrap_or("unknown"),
        "timestamp": now_ms(),
    });
    if !result["result"].is_null() {
        update["result"] = result["result"].clone();
    }
    if !result["error"].is_null() {
        update["error"] = result["error"].clone();
    }
    update
}

/// Ensure an upstream event carries `type` and `job_id` tags. Fields the
/// backend already set are passed through untouched.
fn tag_update(update: &mut Value, job_id: &str) {
    if let Value::Object(map) = update {
        map.entry("type").or_insert_with(|| "job.update".into());
        map.entry("job_id").or_insert_with(|| job_id.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use serde_json::json;
    use std::time::Duration;

    /// Relay pointed at an unreachable backend: upstream tasks fail their
    /// fetch and subscribe quickly and exit, which is fine — these tests
    /// exercise room bookkeeping and fan-out, not the upstream path.
    fn test_relay() -> JobRelay {
        JobRelay::new(Arc::new(BackendClient::new(&BackendConfig {
            url: "http://127.0.0.1:9".to_string(),
            api_key: "test-key".to_string(),
            connect_timeout_secs: 1,
            request_timeout_secs: 1,
            upstream_connect_timeout_secs: 1,
        })))
    }

    #[tokio::test]
    async fn upstream_opened_once_per_room() {
        let relay = test_relay();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        let (tx3, _rx3) = mpsc::channel(8);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        tokio::join!(
            relay.join("job-1", a, tx1),
            relay.join("job-1", b, tx2),
            relay.join("job-1", c, tx3),
        );

        assert_eq!(relay.upstream_opens(), 1);
        assert_eq!(relay.subscriber_count("job-1").await, 3);

        relay.leave("job-1", a).await;
        relay.leave("job-1", b).await;
        assert_eq!(relay.upstream_closes(), 0);

        relay.leave("job-1", c).await;
        assert_eq!(relay.upstream_closes(), 1);
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn second_room_opens_second_upstream() {
        let relay = test_relay();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        relay.join("job-1", Uuid::new_v4(), tx1).await;
        relay.join("job-2", Uuid::new_v4(), tx2).await;
        assert_eq!(relay.upstream_opens(), 2);
        assert_eq!(relay.room_count().await, 2);
    }

    #[tokio::test]
    async fn blocked_subscriber_does_not_stall_fanout() {
        let relay = test_relay();
        let (blocked_tx, _blocked_rx) = mpsc::channel(1);
        let (healthy_tx, mut healthy_rx) = mpsc::channel(8);
        let blocked = Uuid::new_v4();
        let healthy = Uuid::new_v4();
        relay.join("job-1", blocked, blocked_tx).await;
        relay.join("job-1", healthy, healthy_tx).await;

        // The blocked member's queue holds one update; the second overflow
        // drops it from the room. The healthy member sees every update.
        for seq in 0..3 {
            relay.publish("job-1", json!({"seq": seq})).await;
        }

        for seq in 0..3 {
            let update = tokio::time::timeout(Duration::from_secs(1), healthy_rx.recv())
                .await
                .expect("fanout should not block on the stalled subscriber")
                .expect("channel open");
            assert_eq!(update["seq"], seq);
        }
        assert_eq!(relay.subscriber_count("job-1").await, 1);
    }

    #[tokio::test]
    async fn terminal_update_does_not_evict_subscribers() {
        let relay = test_relay();
        let (tx, mut rx) = mpsc::channel(8);
        relay.join("job-1", Uuid::new_v4(), tx).await;

        relay
            .publish("job-1", json!({"status": "completed", "job_id": "job-1"}))
            .await;

        let update = rx.recv().await.unwrap();
        assert_eq!(update["status"], "completed");
        assert_eq!(relay.subscriber_count("job-1").await, 1);
        assert_eq!(relay.room_count().await, 1);
    }

    #[tokio::test]
    async fn leave_unknown_room_is_a_noop() {
        let relay = test_relay();
        relay.leave("missing", Uuid::new_v4()).await;
        assert_eq!(relay.upstream_closes(), 0);
    }

    #[test]
    fn synthesized_update_carries_status_and_payload() {
        let result = json!({"status": "completed", "result": "[\"out\", \"\"]"});
        let update = synthesize_update("job-9", &result);
        assert_eq!(update["type"], "job.update");
        assert_eq!(update["job_id"], "job-9");
        assert_eq!(update["status"], "completed");
        assert_eq!(update["result"], "[\"out\", \"\"]");
        assert!(update["error"].is_null());
    }

    #[test]
    fn tagging_preserves_existing_fields() {
        let mut update = json!({"job_id": "original", "status": "queued"});
        tag_update(&mut update, "other");
        assert_eq!(update["job_id"], "original");
        assert_eq!(update["type"], "job.update");
    }
}
