//! Token-bucket rate limiting
//!
//! One bucket per route, or one per model when per-model mode is enabled.
//! Refill is continuous: `tokens = min(burst, tokens + elapsed * rate)`.
//! Buckets hold fractional tokens so sub-second refill accumulates.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

impl Bucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_update: now,
        }
    }

    fn try_take(&mut self, rate: f64, burst: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct LimiterState {
    global: Bucket,
    per_model: HashMap<String, Bucket>,
}

/// Token-bucket rate limiter for one route
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    per_model: bool,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a limiter with a full initial burst
    pub fn new(requests_per_second: i32, burst_size: i32, per_model: bool) -> Self {
        let burst = burst_size.max(0) as f64;
        Self {
            rate: requests_per_second.max(0) as f64,
            burst,
            per_model,
            state: Mutex::new(LimiterState {
                global: Bucket::new(burst, Instant::now()),
                per_model: HashMap::new(),
            }),
        }
    }

    /// Whether a request for `model` may proceed now
    pub fn allow(&self, model: &str) -> bool {
        self.allow_at(model, Instant::now())
    }

    /// Whether a request may proceed at the given instant.
    ///
    /// Time must be monotonically non-decreasing across calls; tests drive
    /// this directly to avoid sleeping.
    pub fn allow_at(&self, model: &str, now: Instant) -> bool {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let bucket = if self.per_model {
            state
                .per_model
                .entry(model.to_string())
                .or_insert_with(|| Bucket::new(self.burst, now))
        } else {
            &mut state.global
        };
        bucket.try_take(self.rate, self.burst, now)
    }

    /// Whether this limiter was built from the same rate configuration.
    ///
    /// Used on route upsert to decide whether bucket state can be carried
    /// over; resetting a bucket on every config change is observable as a
    /// traffic spike.
    pub fn same_config(&self, requests_per_second: i32, burst_size: i32, per_model: bool) -> bool {
        self.rate == requests_per_second.max(0) as f64
            && self.burst == burst_size.max(0) as f64
            && self.per_model == per_model
    }

    /// The (rate, burst, per-model) configuration this limiter was built with
    pub fn config(&self) -> (f64, f64, bool) {
        (self.rate, self.burst, self.per_model)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .field("per_model", &self.per_model)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn initial_burst_is_available() {
        let limiter = RateLimiter::new(1, 3, false);
        let now = Instant::now();
        assert!(limiter.allow_at("m", now));
        assert!(limiter.allow_at("m", now));
        assert!(limiter.allow_at("m", now));
        assert!(!limiter.allow_at("m", now));
    }

    #[test]
    fn tokens_refill_continuously() {
        let limiter = RateLimiter::new(2, 1, false);
        let t0 = Instant::now();
        assert!(limiter.allow_at("m", t0));
        assert!(!limiter.allow_at("m", t0));

        // 2 rps means half a second buys one token
        assert!(limiter.allow_at("m", t0 + Duration::from_millis(500)));
        assert!(!limiter.allow_at("m", t0 + Duration::from_millis(500)));
    }

    #[test]
    fn refill_caps_at_burst() {
        let limiter = RateLimiter::new(100, 2, false);
        let t0 = Instant::now();

        // A long idle period must not accumulate more than burst
        let later = t0 + Duration::from_secs(60);
        assert!(limiter.allow_at("m", later));
        assert!(limiter.allow_at("m", later));
        assert!(!limiter.allow_at("m", later));
    }

    #[test]
    fn admissions_bounded_by_rate_times_window_plus_burst() {
        let limiter = RateLimiter::new(10, 5, false);
        let t0 = Instant::now();

        // Over a 2-second window, at most rate*2 + burst admissions
        let mut admitted = 0;
        for i in 0u64..100 {
            let t = t0 + Duration::from_millis(i * 20);
            if limiter.allow_at("m", t) {
                admitted += 1;
            }
        }
        assert!(admitted <= 10 * 2 + 5, "admitted {admitted}");
        assert!(admitted >= 20, "admitted {admitted}");
    }

    #[test]
    fn per_model_buckets_are_independent() {
        let limiter = RateLimiter::new(1, 1, true);
        let now = Instant::now();
        assert!(limiter.allow_at("bge-small", now));
        assert!(!limiter.allow_at("bge-small", now));

        // A different model has its own untouched bucket
        assert!(limiter.allow_at("bge-large", now));
    }

    #[test]
    fn global_mode_shares_one_bucket() {
        let limiter = RateLimiter::new(1, 1, false);
        let now = Instant::now();
        assert!(limiter.allow_at("bge-small", now));
        assert!(!limiter.allow_at("bge-large", now));
    }

    #[test]
    fn zero_burst_admits_nothing_until_refill() {
        let limiter = RateLimiter::new(1, 0, false);
        let t0 = Instant::now();
        assert!(!limiter.allow_at("m", t0));
        // With burst 0 the bucket caps at 0 tokens, so nothing ever fits
        assert!(!limiter.allow_at("m", t0 + Duration::from_secs(5)));
    }

    #[test]
    fn same_config_detects_changes() {
        let limiter = RateLimiter::new(10, 20, false);
        assert!(limiter.same_config(10, 20, false));
        assert!(!limiter.same_config(5, 20, false));
        assert!(!limiter.same_config(10, 10, false));
        assert!(!limiter.same_config(10, 20, true));
    }
}
