use thiserror::Error;

use super::model_update::Model;

/// Failure of a single change action.
///
/// Clonable because the same failure is reported both in the event stream and
/// to the caller awaiting the action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    /// Deferral: the rate limiter had no token left. Not a real failure.
    #[error("Rate limit {interceptor} exhausted for {key}")]
    RateLimited { interceptor: String, key: String },

    #[error("Action failed: {0}")]
    Failed(String),

    #[error("Action did not complete within {0}ms")]
    TimedOut(u64),

    #[error("Invalid change: {0}")]
    InvalidChange(String),

    #[error("Reconciliation engine for {0} is retired")]
    EngineRetired(String),
}

impl ActionError {
    pub fn is_deferral(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// The resolver could not make sense of the trees it was given.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Unexpected entity {id}: expected {expected}")]
    UnexpectedEntity { id: String, expected: &'static str },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

/// A model update could not be applied to its tree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Entity {id} not found in {model} model")]
    EntityNotFound { model: Model, id: String },
}
