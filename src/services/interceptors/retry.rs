//! Exponential backoff gate for failing actions.
//!
//! The interceptor keeps one retry record per entity id (the root id of the
//! tree it was applied to). Resolvers ask [`RetryActionInterceptor::execution_limits`]
//! before emitting a guarded action; a wrapped action clears the record on
//! success and pushes the next eligible time further out on failure.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::{debug, warn};

use super::Interceptor;
use crate::domain::models::RetryConfig;
use crate::domain::ports::Clock;
use crate::services::reconciler::{ActionError, ChangeAction, ChangeKind, Entity, EntityHolder};

/// Failure bookkeeping for one entity.
#[derive(Debug, Clone)]
pub struct RetryRecord {
    pub attempt_count: u32,
    pub last_attempt_ms: u64,
    /// Delay applied after the last failure
    pub delay: Duration,
}

impl RetryRecord {
    pub fn next_eligible_ms(&self) -> u64 {
        self.last_attempt_ms
            .saturating_add(u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX))
    }
}

pub struct RetryActionInterceptor {
    name: String,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<String, RetryRecord>>,
}

impl RetryActionInterceptor {
    pub fn new(name: impl Into<String>, config: &RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
            multiplier: config.multiplier.max(1.0),
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a new attempt may be scheduled for the entity held by `holder`.
    pub fn execution_limits<E: Entity>(&self, holder: &EntityHolder<E>) -> bool {
        self.is_permitted(holder.id())
    }

    pub fn is_permitted(&self, key: &str) -> bool {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .get(key)
            .is_none_or(|record| self.clock.now_ms() >= record.next_eligible_ms())
    }

    /// Wrap `action`, keyed by the id of `holder`.
    pub fn apply<K: ChangeKind>(
        self: &Arc<Self>,
        holder: &EntityHolder<K::Entity>,
        action: ChangeAction<K>,
    ) -> ChangeAction<K> {
        action.intercepted_by(Interceptor::Retry {
            interceptor: Arc::clone(self),
            key: holder.id().to_string(),
        })
    }

    pub fn retry_record(&self, key: &str) -> Option<RetryRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn record_success(&self, key: &str) {
        let removed = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Some(record) = removed {
            debug!(interceptor = %self.name, key, attempts = record.attempt_count, "Retry record cleared after success");
        }
    }

    pub fn record_failure(&self, key: &str, error: &ActionError) {
        let now = self.clock.now_ms();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.entry(key.to_string()).or_insert_with(|| RetryRecord {
            attempt_count: 0,
            last_attempt_ms: now,
            delay: Duration::ZERO,
        });
        record.attempt_count += 1;
        record.last_attempt_ms = now;
        record.delay = self.delay_for_attempt(record.attempt_count);

        warn!(
            interceptor = %self.name,
            key,
            attempt = record.attempt_count,
            delay_ms = u64::try_from(record.delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Action failed, backing off"
        );
    }

    /// Forget everything about `key`.
    pub fn release(&self, key: &str) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Delay imposed after `attempt` consecutive failures.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut backoff = self.new_backoff();
        let mut delay = Duration::ZERO;
        for _ in 0..attempt {
            delay = backoff.next_backoff().unwrap_or(self.max_delay);
            if delay >= self.max_delay {
                break;
            }
        }
        delay
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

impl fmt::Debug for RetryActionInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryActionInterceptor")
            .field("name", &self.name)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}
