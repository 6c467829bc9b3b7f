//! Small helpers shared across modules.

use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Resolve the client's source address for rate limiting.
///
/// Honors the first entry of `X-Forwarded-For` when present (the gateway is
/// expected to sit behind a trusted proxy), otherwise falls back to the peer
/// address of the TCP connection. Only the IP is used — ports churn per
/// connection and would defeat the per-address window.
pub fn client_addr(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.ip().to_string()
}

/// Redact credential-bearing query parameters before a URL reaches a log line.
///
/// `token` and `api_key` values are replaced with `***`; everything else
/// passes through unchanged.
pub fn redact_query(path_and_query: &str) -> String {
    let Some((path, query)) = path_and_query.split_once('?') else {
        return path_and_query.to_string();
    };
    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key.eq_ignore_ascii_case("token") || key.eq_ignore_ascii_case("api_key") => {
                format!("{key}=***")
            }
            _ => pair.to_string(),
        })
        .collect();
    format!("{path}?{}", redacted.join("&"))
}

/// Validate an externally issued job identifier: non-empty, at most 128
/// characters, alphanumeric plus `-` and `_`.
pub fn is_valid_job_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.9:55555".parse().unwrap()
    }

    #[test]
    fn client_addr_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_addr(&headers, peer()), "203.0.113.7");
    }

    #[test]
    fn client_addr_falls_back_to_peer() {
        assert_eq!(client_addr(&HeaderMap::new(), peer()), "10.0.0.9");
    }

    #[test]
    fn client_addr_ignores_empty_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", " , 203.0.113.7".parse().unwrap());
        assert_eq!(client_addr(&headers, peer()), "10.0.0.9");
    }

    #[test]
    fn redact_hides_token_and_api_key() {
        assert_eq!(
            redact_query("/api/ws/jobs/abc?token=secret&foo=1"),
            "/api/ws/jobs/abc?token=***&foo=1"
        );
        assert_eq!(
            redact_query("/x?api_key=sk-live-1234"),
            "/x?api_key=***"
        );
    }

    #[test]
    fn redact_passes_plain_paths_through() {
        assert_eq!(redact_query("/api/health"), "/api/health");
        assert_eq!(redact_query("/api/jobs/a?since=5"), "/api/jobs/a?since=5");
    }

    #[test]
    fn job_id_validation() {
        assert!(is_valid_job_id("job-123_abc"));
        assert!(is_valid_job_id("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!is_valid_job_id(""));
        assert!(!is_valid_job_id("job/../etc"));
        assert!(!is_valid_job_id(&"x".repeat(129)));
    }
}
