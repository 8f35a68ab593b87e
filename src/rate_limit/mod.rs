//! Rate Limiter
//! Mission: fixed-window token buckets, one keyed by user id (30/min) and
//! one keyed by IP address (10/min), checked together so a shared IP can't
//! be used to bypass a per-user limit.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const USER_LIMIT: u32 = 30;
const IP_LIMIT: u32 = 10;
const SWEEP_PROBABILITY: f64 = 0.01;
const STALE_AFTER: Duration = Duration::from_secs(120);

struct Bucket {
    count: u32,
    window_start: Instant,
}

struct Window {
    limit: u32,
    entries: HashMap<String, Bucket>,
}

impl Window {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            entries: HashMap::new(),
        }
    }

    /// Returns seconds-to-retry; 0 means allowed.
    fn check(&mut self, key: &str, now: Instant) -> u64 {
        let bucket = self.entries.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            window_start: now,
        });

        if now.duration_since(bucket.window_start) >= WINDOW {
            bucket.count = 0;
            bucket.window_start = now;
        }

        bucket.count += 1;
        if bucket.count > self.limit {
            let reset_at = bucket.window_start + WINDOW;
            reset_at.saturating_duration_since(now).as_secs().max(1)
        } else {
            0
        }
    }

    fn sweep(&mut self, now: Instant) {
        self.entries.retain(|_, b| now.duration_since(b.window_start) < STALE_AFTER);
    }
}

/// Dual rate limiter: a caller checks both user and IP, the larger
/// seconds-to-retry wins.
pub struct RateLimiter {
    by_user: Mutex<Window>,
    by_ip: Mutex<Window>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            by_user: Mutex::new(Window::new(USER_LIMIT)),
            by_ip: Mutex::new(Window::new(IP_LIMIT)),
        }
    }

    /// Seconds to retry, 0 if allowed. Checks and increments both buckets;
    /// whichever is stricter determines the result for this call.
    pub fn check(&self, user_id: &str, ip: &str) -> u64 {
        let now = Instant::now();
        let user_key = format!("user:{user_id}");
        let ip_key = format!("ip:{ip}");

        let user_wait = self.by_user.lock().check(&user_key, now);
        let ip_wait = self.by_ip.lock().check(&ip_key, now);

        self.maybe_sweep(now);

        user_wait.max(ip_wait)
    }

    fn maybe_sweep(&self, now: Instant) {
        if rand::thread_rng().gen_bool(SWEEP_PROBABILITY) {
            self.by_user.lock().sweep(now);
            self.by_ip.lock().sweep(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_user_limit() {
        // Vary the IP per call so only the user bucket is under test.
        let limiter = RateLimiter::new();
        for i in 0..USER_LIMIT {
            assert_eq!(limiter.check("alice", &format!("10.0.{i}.1")), 0);
        }
    }

    #[test]
    fn thirty_first_request_is_rate_limited() {
        let limiter = RateLimiter::new();
        for i in 0..USER_LIMIT {
            limiter.check("alice", &format!("10.0.{i}.1"));
        }
        let wait = limiter.check("alice", "10.0.99.1");
        assert!(wait > 0);
    }

    #[test]
    fn ip_limit_is_stricter_than_user_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..IP_LIMIT {
            limiter.check("bob", "10.0.0.9");
        }
        let wait = limiter.check("carol", "10.0.0.9");
        assert!(wait > 0, "shared IP should trip the IP bucket even for a different user");
    }

    #[test]
    fn different_users_and_ips_do_not_interfere() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.check("alice", "10.0.0.1"), 0);
        assert_eq!(limiter.check("bob", "10.0.0.2"), 0);
    }
}
