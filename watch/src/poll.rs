//! Bounded polling fallback.
//!
//! The channel of last resort: when streaming cannot be established at all,
//! or the watcher's reconnect budget ran out, job status is fetched on an
//! increasing interval instead. The loop is bounded — running out of attempts
//! is reported as [`PollOutcome::Exhausted`] ("we stopped watching"), which
//! callers must not confuse with the job itself failing.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::client::{ClientError, GatewayClient};
use crate::config::WatchConfig;
use crate::job::{parse_update, JobStatus};
use crate::watcher::{apply_update, JobView};

/// How a polling run ended.
#[derive(Debug)]
pub enum PollOutcome {
    /// A terminal status was observed; the final view is attached.
    Terminal(JobView),
    /// The attempt budget was spent without a terminal status.
    Exhausted { attempts: u32 },
}

/// Poll `job_id` until it reaches a terminal status or the attempt budget is
/// spent. `on_change` fires only when the status differs from the previous
/// attempt, so callers don't repaint identical progress.
///
/// A transport error aborts the loop and propagates — polling has no retry
/// layer of its own.
pub async fn poll_job(
    client: &GatewayClient,
    config: &WatchConfig,
    job_id: &str,
    on_change: impl FnMut(JobStatus, &JobView),
) -> Result<PollOutcome, ClientError> {
    poll_with(config, || client.get_job(job_id), on_change).await
}

/// Polling loop over an arbitrary fetch function (separated from [`poll_job`]
/// so the loop can be exercised without a gateway).
async fn poll_with<F, Fut>(
    config: &WatchConfig,
    mut fetch: F,
    mut on_change: impl FnMut(JobStatus, &JobView),
) -> Result<PollOutcome, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, ClientError>>,
{
    let mut view = JobView::default();
    let mut last_status: Option<JobStatus> = None;
    let mut delay = Duration::from_millis(config.poll_base_delay_ms);

    for attempt in 1..=config.poll_max_attempts {
        let body = fetch().await?;
        match parse_update(&body) {
            Ok(update) => {
                apply_update(&mut view, update);
            }
            Err(e) => {
                debug!(attempt, error = %e, "Malformed polling response");
                view.parse_error = Some(e);
            }
        }

        if last_status != Some(view.status) {
            last_status = Some(view.status);
            on_change(view.status, &view);
        }

        if view.status.is_terminal() {
            return Ok(PollOutcome::Terminal(view));
        }

        if attempt < config.poll_max_attempts {
            tokio::time::sleep(delay).await;
            delay = next_poll_delay(delay, config.poll_backoff_factor, config.poll_delay_cap_ms);
        }
    }

    Ok(PollOutcome::Exhausted {
        attempts: config.poll_max_attempts,
    })
}

/// Multiply the polling delay, clamped to the configured ceiling.
fn next_poll_delay(current: Duration, factor: f64, cap_ms: u64) -> Duration {
    let next = (current.as_millis() as f64 * factor) as u64;
    Duration::from_millis(next.min(cap_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> WatchConfig {
        WatchConfig {
            poll_max_attempts: max_attempts,
            poll_base_delay_ms: 1,
            poll_backoff_factor: 1.3,
            poll_delay_cap_ms: 5,
            ..WatchConfig::default()
        }
    }

    #[tokio::test]
    async fn exhausts_after_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = fast_config(3);
        let outcome = poll_with(
            &config,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!({"status": "processing"})) }
            },
            |_, _| {},
        )
        .await
        .unwrap();

        match outcome {
            PollOutcome::Exhausted { attempts } => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_terminal_status() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = fast_config(10);
        let outcome = poll_with(
            &config,
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Ok(json!({"status": "processing"}))
                    } else {
                        Ok(json!({"status": "completed", "result": "\"done\""}))
                    }
                }
            },
            |_, _| {},
        )
        .await
        .unwrap();

        match outcome {
            PollOutcome::Terminal(view) => {
                assert_eq!(view.status, JobStatus::Completed);
                assert_eq!(view.result, Some(json!("done")));
            }
            other => panic!("expected Terminal, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reports_only_status_changes() {
        let calls = Arc::new(AtomicU32::new(0));
        let changes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let config = fast_config(10);
        let changes_out = Arc::clone(&changes);
        let outcome = poll_with(
            &config,
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match call {
                        0 | 1 => Ok(json!({"status": "queued"})),
                        2 | 3 => Ok(json!({"status": "processing"})),
                        _ => Ok(json!({"status": "completed"})),
                    }
                }
            },
            move |status, _| changes_out.lock().unwrap().push(status),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, PollOutcome::Terminal(_)));
        assert_eq!(
            *changes.lock().unwrap(),
            vec![
                JobStatus::Queued,
                JobStatus::Processing,
                JobStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn fetch_error_propagates() {
        let config = fast_config(5);
        let result = poll_with(
            &config,
            || async { Err(ClientError::Protocol("boom".to_string())) },
            |_, _| {},
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn delay_grows_multiplicatively_to_cap() {
        let mut delay = Duration::from_millis(1000);
        delay = next_poll_delay(delay, 1.3, 8000);
        assert_eq!(delay.as_millis(), 1300);
        delay = next_poll_delay(delay, 1.3, 8000);
        assert_eq!(delay.as_millis(), 1690);
        for _ in 0..20 {
            delay = next_poll_delay(delay, 1.3, 8000);
        }
        assert_eq!(delay.as_millis(), 8000);
    }
}
