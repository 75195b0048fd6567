//! Per-tenant backpressure (§5): a leaky-bucket limiter for agent
//! endpoints, and a bounded per-pool-per-minute price-sample buffer that
//! drops the overflow with a counted metric instead of blocking.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Leaky bucket: `capacity` tokens refilled continuously at
/// `capacity / 60s`; a request costs one token.
pub struct RateLimiter {
    capacity: f64,
    buckets: Mutex<HashMap<Uuid, Bucket>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self { capacity: per_minute as f64, buckets: Mutex::new(HashMap::new()) }
    }

    pub fn check(&self, tenant_id: Uuid) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        let bucket = buckets.entry(tenant_id).or_insert_with(|| Bucket { tokens: self.capacity, last_refill: now });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * (self.capacity / 60.0)).min(self.capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct PoolBucket {
    window_start: Instant,
    count: u32,
    dropped: u32,
}

/// Bounds ingestion to `limit` samples per pool per minute; anything
/// past the limit is dropped and counted rather than buffered
/// unboundedly.
pub struct PriceSampleBuffer {
    limit: u32,
    window: Duration,
    pools: Mutex<HashMap<String, PoolBucket>>,
}

impl PriceSampleBuffer {
    pub fn new(limit: u32) -> Self {
        Self { limit, window: Duration::from_secs(60), pools: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` if the sample should be accepted, `false` if it
    /// must be dropped for this pool's current window.
    pub fn admit(&self, pool_id: &str) -> bool {
        let mut pools = self.pools.lock().unwrap();
        let now = Instant::now();
        let bucket = pools
            .entry(pool_id.to_string())
            .or_insert_with(|| PoolBucket { window_start: now, count: 0, dropped: 0 });
        if now.duration_since(bucket.window_start) >= self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        if bucket.count < self.limit {
            bucket.count += 1;
            true
        } else {
            bucket.dropped += 1;
            false
        }
    }

    pub fn dropped_count(&self, pool_id: &str) -> u32 {
        self.pools.lock().unwrap().get(pool_id).map(|b| b.dropped).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_up_to_capacity_then_blocks() {
        let limiter = RateLimiter::new(2);
        let tenant = Uuid::new_v4();
        assert!(limiter.check(tenant));
        assert!(limiter.check(tenant));
        assert!(!limiter.check(tenant));
    }

    #[test]
    fn price_sample_buffer_drops_past_limit() {
        let buffer = PriceSampleBuffer::new(2);
        assert!(buffer.admit("pool-a"));
        assert!(buffer.admit("pool-a"));
        assert!(!buffer.admit("pool-a"));
        assert_eq!(buffer.dropped_count("pool-a"), 1);
    }
}
