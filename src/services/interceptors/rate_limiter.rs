//! Token bucket gate for task creation.
//!
//! Each key (a job id) owns its own bucket of `bucket_size` tokens, refilled
//! one token every `refill_interval_ms`. Refill is discrete: a partially
//! elapsed interval carries over to the next check instead of being lost, and
//! a full bucket does not bank time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use super::Interceptor;
use crate::domain::models::RateLimitConfig;
use crate::domain::ports::Clock;
use crate::services::reconciler::{ChangeAction, ChangeKind, Entity, EntityHolder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TokenBucket {
    tokens: u64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn full(capacity: u64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, capacity: u64, interval_ms: u64, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        let intervals = elapsed / interval_ms;
        self.tokens = self.tokens.saturating_add(intervals).min(capacity);
        if self.tokens == capacity {
            self.last_refill_ms = now_ms;
        } else {
            self.last_refill_ms += intervals * interval_ms;
        }
    }
}

pub struct RateLimiterInterceptor {
    name: String,
    capacity: u64,
    refill_interval_ms: u64,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiterInterceptor {
    pub fn new(name: impl Into<String>, config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            capacity: config.bucket_size,
            refill_interval_ms: config.refill_interval_ms.max(1),
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens currently available for the tree rooted at `holder`, without
    /// consuming any.
    pub fn execution_limits<E: Entity>(&self, holder: &EntityHolder<E>) -> u64 {
        self.available(holder.id())
    }

    pub fn available(&self, key: &str) -> u64 {
        self.with_bucket(key, |bucket| bucket.tokens)
    }

    /// Consume one token for `key`. Returns false when the bucket is empty.
    pub fn try_take(&self, key: &str) -> bool {
        let taken = self.with_bucket(key, |bucket| {
            if bucket.tokens == 0 {
                return false;
            }
            bucket.tokens -= 1;
            true
        });
        trace!(interceptor = %self.name, key, taken, "Rate limiter token request");
        taken
    }

    /// Wrap `action`, charging the bucket of `holder`'s id.
    pub fn apply<K: ChangeKind>(
        self: &Arc<Self>,
        holder: &EntityHolder<K::Entity>,
        action: ChangeAction<K>,
    ) -> ChangeAction<K> {
        action.intercepted_by(Interceptor::RateLimit {
            interceptor: Arc::clone(self),
            key: holder.id().to_string(),
        })
    }

    pub fn release(&self, key: &str) {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn with_bucket<T>(&self, key: &str, f: impl FnOnce(&mut TokenBucket) -> T) -> T {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(self.capacity, now));
        bucket.refill(self.capacity, self.refill_interval_ms, now);
        f(bucket)
    }
}

impl fmt::Debug for RateLimiterInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterInterceptor")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("refill_interval_ms", &self.refill_interval_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::TestClock;

    fn limiter(clock: Arc<TestClock>, bucket_size: u64, refill_interval_ms: u64) -> RateLimiterInterceptor {
        let config = RateLimitConfig {
            bucket_size,
            refill_interval_ms,
        };
        RateLimiterInterceptor::new("taskCreation", &config, clock)
    }

    #[test]
    fn test_starts_full_and_drains() {
        let rl = limiter(Arc::new(TestClock::new(0)), 3, 100);
        assert_eq!(rl.available("job-1"), 3);
        assert!(rl.try_take("job-1"));
        assert!(rl.try_take("job-1"));
        assert!(rl.try_take("job-1"));
        assert!(!rl.try_take("job-1"));
        assert_eq!(rl.available("job-1"), 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let rl = limiter(Arc::new(TestClock::new(0)), 2, 100);
        assert_eq!(rl.available("job-1"), 2);
        assert_eq!(rl.available("job-1"), 2);
    }

    #[test]
    fn test_refills_one_token_per_interval() {
        let clock = Arc::new(TestClock::new(0));
        let rl = limiter(Arc::clone(&clock), 2, 100);
        assert!(rl.try_take("job-1"));
        assert!(rl.try_take("job-1"));

        clock.advance(150);
        assert_eq!(rl.available("job-1"), 1);
        // The leftover 50ms counts toward the next token
        clock.advance(50);
        assert_eq!(rl.available("job-1"), 2);
        // Never above capacity
        clock.advance(10_000);
        assert_eq!(rl.available("job-1"), 2);
    }

    #[test]
    fn test_full_bucket_does_not_bank_time() {
        let clock = Arc::new(TestClock::new(0));
        let rl = limiter(Arc::clone(&clock), 1, 100);
        assert_eq!(rl.available("job-1"), 1);
        clock.advance(1_000);
        assert!(rl.try_take("job-1"));
        assert!(!rl.try_take("job-1"));
        clock.advance(99);
        assert!(!rl.try_take("job-1"));
        clock.advance(1);
        assert!(rl.try_take("job-1"));
    }

    #[test]
    fn test_buckets_are_per_key() {
        let rl = limiter(Arc::new(TestClock::new(0)), 1, 100);
        assert!(rl.try_take("job-1"));
        assert!(rl.try_take("job-2"));
        assert!(!rl.try_take("job-1"));
        rl.release("job-1");
        assert!(rl.try_take("job-1"));
    }
}
