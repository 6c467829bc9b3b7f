//! Job status wire types (mirrors the gateway's `job.update` shape).

use serde::Deserialize;
use serde_json::Value;

/// Lifecycle status of a remote execution job.
///
/// The backend has historically also emitted `started`/`finished`; those are
/// accepted as aliases. Anything unrecognized reads as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    #[serde(alias = "started")]
    Processing,
    #[serde(alias = "finished")]
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// Whether this status ends the job's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status update for a job, as received from the gateway (or synthesized
/// from a polling response). Immutable once parsed — consumers replace local
/// state with it, never mutate it.
#[derive(Debug, Clone, Deserialize)]
pub struct JobUpdate {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl JobUpdate {
    /// Whether this update belongs to `job_id`. Untagged updates (e.g.
    /// polling responses, which carry no `job_id`) pass.
    pub fn is_for(&self, job_id: &str) -> bool {
        self.job_id.as_deref().map_or(true, |id| id == job_id)
    }
}

/// Decode one update message (or polling response body).
pub fn parse_update(value: &Value) -> Result<JobUpdate, String> {
    serde_json::from_value(value.clone()).map_err(|e| format!("malformed job update: {e}"))
}

/// Normalize a result payload that may arrive as a JSON-encoded string.
///
/// Returns the normalized value plus a parse-error description when the
/// payload was a string that failed to decode — the raw string is kept so
/// the caller still has something to show.
pub fn normalize_result(result: Value) -> (Value, Option<String>) {
    match result {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed) => (parsed, None),
            Err(e) => {
                let detail = format!("result payload is not valid JSON: {e}");
                (Value::String(s), Some(detail))
            }
        },
        other => (other, None),
    }
}
