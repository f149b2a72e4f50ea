use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter keyed by an arbitrary id.
///
/// Used to throttle delegation bursts per originating agent, independent of
/// which chain the delegation belongs to.
pub struct RateLimiter<K = String> {
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    buckets: Mutex<HashMap<K, Bucket>>,
}

impl<K: Hash + Eq + Clone> RateLimiter<K> {
    /// Create a new rate limiter.
    /// - `max_tokens`: maximum burst size
    /// - `refill_rate`: tokens added per second
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            max_tokens,
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to consume one token for the given key.
    /// Returns `true` if allowed, `false` if rate limited.
    pub async fn check(&self, key: &K) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = self.refilled(&mut buckets, key, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Remove expired buckets (no activity for the given duration).
    pub async fn cleanup(&self, max_idle: Duration) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_refill) < max_idle);
    }

    fn refilled<'a>(
        &self,
        buckets: &'a mut HashMap<K, Bucket>,
        key: &K,
        now: Instant,
    ) -> &'a mut Bucket {
        let bucket = buckets.entry(key.clone()).or_insert(Bucket {
            tokens: self.max_tokens,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        bucket.last_refill = now;
        bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_allows_burst() {
        let limiter: RateLimiter = RateLimiter::new(5.0, 1.0);
        let agent = "conductor".to_string();
        for _ in 0..5 {
            assert!(limiter.check(&agent).await);
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_blocks() {
        let limiter: RateLimiter = RateLimiter::new(2.0, 0.1);
        let agent = "conductor".to_string();
        assert!(limiter.check(&agent).await);
        assert!(limiter.check(&agent).await);
        // Third should be blocked (not enough tokens refilled)
        assert!(!limiter.check(&agent).await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter: RateLimiter = RateLimiter::new(1.0, 0.0);
        assert!(limiter.check(&"a".to_string()).await);
        assert!(!limiter.check(&"a".to_string()).await);
        assert!(limiter.check(&"b".to_string()).await);
    }
}
