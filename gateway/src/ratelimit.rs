//! Per-source-address rate limiting with temporary bans.
//!
//! Fixed-window semantics, deliberately not a token bucket: bursts within a
//! window are fully permitted up to the cap, then hard-cut. Exceeding the cap
//! bans the address for a fixed duration during which every check returns
//! `false` and the window counter is left untouched. Window expiry resets the
//! count to 1 — the request that triggered the reset counts.
//!
//! Both maps are owned here and shared behind async mutexes; a background
//! sweep (spawned in `main.rs`) evicts expired windows and lifted bans so the
//! maps don't grow with one entry per address ever seen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::RateLimitConfig;

/// One address's position in the current window.
struct WindowEntry {
    count: u32,
    window_reset_at: Instant,
}

struct LimiterInner {
    window: Duration,
    max_requests: u32,
    ban_duration: Duration,
    clients: Mutex<HashMap<String, WindowEntry>>,
    banned: Mutex<HashMap<String, Instant>>,
}

/// Shared fixed-window rate limiter. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                window: Duration::from_secs(config.window_secs),
                max_requests: config.max_requests,
                ban_duration: Duration::from_secs(config.ban_secs),
                clients: Mutex::new(HashMap::new()),
                banned: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record one request from `addr` and decide whether it may proceed.
    ///
    /// Called exactly once per inbound connection or upgrade attempt, before
    /// any other work.
    pub async fn check_and_record(&self, addr: &str) -> bool {
        let now = Instant::now();

        // Ban state wins over window state and freezes the counter.
        {
            let mut banned = self.inner.banned.lock().await;
            if let Some(&unban_at) = banned.get(addr) {
                if now < unban_at {
                    return false;
                }
                banned.remove(addr);
                info!(addr = %addr, "Rate limit ban lifted, admitting");
            }
        }

        let mut clients = self.inner.clients.lock().await;
        let entry = clients.entry(addr.to_string()).or_insert(WindowEntry {
            count: 0,
            window_reset_at: now + self.inner.window,
        });

        if now > entry.window_reset_at {
            entry.count = 1;
            entry.window_reset_at = now + self.inner.window;
            return true;
        }

        entry.count += 1;
        if entry.count > self.inner.max_requests {
            drop(clients);
            let mut banned = self.inner.banned.lock().await;
            banned.insert(addr.to_string(), now + self.inner.ban_duration);
            warn!(
                addr = %addr,
                count = self.inner.max_requests + 1,
                ban_secs = self.inner.ban_duration.as_secs(),
                "Rate limit exceeded, ban applied"
            );
            return false;
        }

        true
    }

    /// Evict expired window entries and lifted bans. Returns
    /// `(windows_evicted, bans_lifted)` for the sweep task's log line.
    pub async fn sweep(&self) -> (usize, usize) {
        let now = Instant::now();

        let mut clients = self.inner.clients.lock().await;
        let before_windows = clients.len();
        clients.retain(|_, entry| now <= entry.window_reset_at);
        let windows_evicted = before_windows - clients.len();
        drop(clients);

        let mut banned = self.inner.banned.lock().await;
        let before_bans = banned.len();
        banned.retain(|_, &mut unban_at| now < unban_at);
        let bans_lifted = before_bans - banned.len();

        (windows_evicted, bans_lifted)
    }

    /// Number of addresses currently tracked in the window map.
    pub async fn tracked_addresses(&self) -> usize {
        self.inner.clients.lock().await.len()
    }

    /// Number of addresses currently banned.
    pub async fn banned_addresses(&self) -> usize {
        self.inner.banned.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_secs: u64, max_requests: u32, ban_secs: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            window_secs,
            max_requests,
            ban_secs,
            sweep_interval_secs: 60,
        })
    }

    #[tokio::test]
    async fn allows_up_to_cap_then_bans() {
        let limiter = limiter(60, 3, 300);
        for _ in 0..3 {
            assert!(limiter.check_and_record("1.2.3.4").await);
        }
        // cap+1 trips the ban, and everything after stays banned
        assert!(!limiter.check_and_record("1.2.3.4").await);
        assert!(!limiter.check_and_record("1.2.3.4").await);
        assert_eq!(limiter.banned_addresses().await, 1);
    }

    #[tokio::test]
    async fn addresses_are_independent() {
        let limiter = limiter(60, 2, 300);
        assert!(limiter.check_and_record("1.1.1.1").await);
        assert!(limiter.check_and_record("1.1.1.1").await);
        assert!(!limiter.check_and_record("1.1.1.1").await);
        // A banned neighbor never affects a fresh address
        assert!(limiter.check_and_record("2.2.2.2").await);
    }

    #[tokio::test]
    async fn window_expiry_resets_count_to_one() {
        let limiter = limiter(1, 2, 300);
        assert!(limiter.check_and_record("1.2.3.4").await);
        assert!(limiter.check_and_record("1.2.3.4").await);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        // The window has lapsed: the count restarts at 1, so two more
        // requests fit before the cap. Without the reset the next request
        // would be the third in-window and trip the ban.
        assert!(limiter.check_and_record("1.2.3.4").await);
        assert!(limiter.check_and_record("1.2.3.4").await);
        assert!(!limiter.check_and_record("1.2.3.4").await);
    }

    #[tokio::test]
    async fn ban_expires_after_duration() {
        let limiter = limiter(1, 1, 0);
        assert!(limiter.check_and_record("1.2.3.4").await);
        assert!(!limiter.check_and_record("1.2.3.4").await);
        assert_eq!(limiter.banned_addresses().await, 1);
        // ban_secs=0: the ban lapses immediately; once the window has also
        // expired the next request is admitted and the ban entry removed.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.check_and_record("1.2.3.4").await);
        assert_eq!(limiter.banned_addresses().await, 0);
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries() {
        let limiter = limiter(0, 100, 300);
        assert!(limiter.check_and_record("1.2.3.4").await);
        assert!(limiter.check_and_record("5.6.7.8").await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (windows, _bans) = limiter.sweep().await;
        assert_eq!(windows, 2);
        assert_eq!(limiter.tracked_addresses().await, 0);
    }
}
