//! Errors raised by the external collaborators of the job manager.

use thiserror::Error;

/// Job store failures. Every store call is safe to retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Job not found in store: {0}")]
    JobNotFound(String),

    #[error("Task not found in store: {0}")]
    TaskNotFound(String),
}

/// Scheduling (placement) failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("Task {task_id} rejected by scheduler: {reason}")]
    Rejected { task_id: String, reason: String },

    #[error("No capacity available for capacity group {0}")]
    NoCapacity(String),
}

/// Agent control failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VmError {
    #[error("Launch of task {task_id} failed: {reason}")]
    LaunchFailed { task_id: String, reason: String },

    #[error("Agent unreachable: {0}")]
    Unreachable(String),
}

/// Capacity management failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("Capacity allocation failed for tier {tier}: {reason}")]
    Allocation { tier: String, reason: String },

    #[error("Capacity update did not finish within {0}ms")]
    Timeout(u64),
}

pub type StoreResult<T> = Result<T, StoreError>;
