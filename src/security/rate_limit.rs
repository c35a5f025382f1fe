// src/security/rate_limit.rs

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use metrics::increment_counter;

use crate::config::RateLimitConfig;

/// Sliding-window admission control keyed by an arbitrary client key
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    requests: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Admits `limit` requests per `window` per key
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a limiter from configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests, Duration::from_secs(config.window_seconds))
    }

    /// Records and admits a request, or refuses it when the window is full
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// [`allow`](Self::allow) with an explicit clock reading
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        let timestamps = requests.entry(key.to_string()).or_default();

        prune(timestamps, now, self.window);

        if timestamps.len() >= self.limit {
            increment_counter!("agni_rate_limited_total");
            return false;
        }

        timestamps.push_back(now);
        true
    }

    /// Drops keys whose window has emptied; returns how many were removed
    pub fn purge(&self) -> usize {
        self.purge_at(Instant::now())
    }

    /// [`purge`](Self::purge) with an explicit clock reading
    pub fn purge_at(&self, now: Instant) -> usize {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        let before = requests.len();
        requests.retain(|_, timestamps| {
            prune(timestamps, now, self.window);
            !timestamps.is_empty()
        });
        before - requests.len()
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn limit_is_enforced_per_key() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.allow_at("a", now));
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(limiter.allow_at("a", t0));
        assert!(limiter.allow_at("a", t0 + Duration::from_secs(30)));
        assert!(!limiter.allow_at("a", t0 + Duration::from_secs(59)));
        // the first request has left the window
        assert!(limiter.allow_at("a", t0 + Duration::from_secs(60)));
        assert!(!limiter.allow_at("a", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn purge_drops_idle_keys() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        let t0 = Instant::now();
        limiter.allow_at("idle", t0);
        limiter.allow_at("busy", t0 + Duration::from_secs(8));

        assert_eq!(limiter.purge_at(t0 + Duration::from_secs(12)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    proptest! {
        #[test]
        fn never_admits_more_than_limit_per_window(limit in 1usize..10, offsets in prop::collection::vec(0u64..120, 1..60)) {
            let window = Duration::from_secs(30);
            let limiter = RateLimiter::new(limit, window);
            let t0 = Instant::now();

            let mut sorted = offsets;
            sorted.sort_unstable();

            let mut admitted: Vec<u64> = Vec::new();
            for offset in sorted {
                if limiter.allow_at("k", t0 + Duration::from_secs(offset)) {
                    admitted.push(offset);
                }
            }

            for (i, start) in admitted.iter().enumerate() {
                let in_window = admitted[i..].iter().filter(|t| **t < start + 30).count();
                prop_assert!(in_window <= limit);
            }
        }
    }
}
