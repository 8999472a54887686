//! Interceptors gating and decorating change actions.
//!
//! A [`ChangeAction`](crate::services::reconciler::ChangeAction) carries an
//! ordered list of interceptors, outermost first. Each one is entered before
//! the action body runs and observes its outcome afterwards.

mod rate_limiter;
mod retry;

use std::sync::Arc;

pub use rate_limiter::RateLimiterInterceptor;
pub use retry::{RetryActionInterceptor, RetryRecord};

use crate::services::reconciler::ActionError;

/// An interceptor bound to the key it guards.
#[derive(Debug, Clone)]
pub enum Interceptor {
    /// Backoff bookkeeping; records success and failure of the wrapped action
    Retry {
        interceptor: Arc<RetryActionInterceptor>,
        key: String,
    },
    /// Consumes one token on entry, refusing entry when none is left
    RateLimit {
        interceptor: Arc<RateLimiterInterceptor>,
        key: String,
    },
}

impl Interceptor {
    pub fn name(&self) -> &str {
        match self {
            Self::Retry { interceptor, .. } => interceptor.name(),
            Self::RateLimit { interceptor, .. } => interceptor.name(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Retry { key, .. } | Self::RateLimit { key, .. } => key,
        }
    }

    /// Called before the wrapped action runs.
    pub fn enter(&self) -> Result<(), ActionError> {
        match self {
            Self::Retry { .. } => Ok(()),
            Self::RateLimit { interceptor, key } => {
                if interceptor.try_take(key) {
                    Ok(())
                } else {
                    Err(ActionError::RateLimited {
                        interceptor: interceptor.name().to_string(),
                        key: key.clone(),
                    })
                }
            }
        }
    }

    /// Called with the outcome of the wrapped action, innermost first.
    ///
    /// A deferral by an outer interceptor never reaches the ones it wraps, but a
    /// deferral from further in is still not counted as a failure.
    pub fn exit(&self, outcome: Result<(), &ActionError>) {
        match (self, outcome) {
            (Self::Retry { interceptor, key }, Ok(())) => interceptor.record_success(key),
            (Self::Retry { interceptor, key }, Err(error)) if !error.is_deferral() => {
                interceptor.record_failure(key, error);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{RateLimitConfig, RetryConfig};
    use crate::domain::ports::{Clock, TestClock};

    fn clock() -> Arc<dyn Clock> {
        Arc::new(TestClock::new(0))
    }

    #[test]
    fn test_rate_limit_refuses_when_empty() {
        let config = RateLimitConfig {
            bucket_size: 1,
            refill_interval_ms: 100,
        };
        let interceptor = Interceptor::RateLimit {
            interceptor: Arc::new(RateLimiterInterceptor::new("taskCreation", &config, clock())),
            key: "job-1".to_string(),
        };
        assert!(interceptor.enter().is_ok());
        let err = interceptor.enter().unwrap_err();
        assert!(err.is_deferral());
        assert_eq!(interceptor.key(), "job-1");
        assert_eq!(interceptor.name(), "taskCreation");
    }

    #[test]
    fn test_retry_ignores_deferrals() {
        let retry = Arc::new(RetryActionInterceptor::new("storeWrite", &RetryConfig::default(), clock()));
        let interceptor = Interceptor::Retry {
            interceptor: Arc::clone(&retry),
            key: "job-1".to_string(),
        };

        let deferral = ActionError::RateLimited {
            interceptor: "taskCreation".to_string(),
            key: "job-1".to_string(),
        };
        interceptor.exit(Err(&deferral));
        assert!(retry.retry_record("job-1").is_none());

        interceptor.exit(Err(&ActionError::Failed("boom".to_string())));
        assert_eq!(retry.retry_record("job-1").map(|r| r.attempt_count), Some(1));

        interceptor.exit(Ok(()));
        assert!(retry.retry_record("job-1").is_none());
    }
}
