use crate::domain::errors::SchedulingError;
use crate::domain::models::{Job, Task};
use async_trait::async_trait;

/// Placement of tasks onto agents. Placement itself lives outside this crate.
#[async_trait]
pub trait SchedulingService: Send + Sync {
    /// Hand a task over for placement. Returns once the scheduler accepted it.
    async fn schedule(&self, job: &Job, task: &Task) -> Result<(), SchedulingError>;
}
