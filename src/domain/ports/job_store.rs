use crate::domain::errors::StoreError;
use crate::domain::models::{Job, Task};
use async_trait::async_trait;

/// A persisted job together with its persisted tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    pub job: Job,
    pub tasks: Vec<Task>,
}

/// Durable job and task storage.
///
/// Every call is atomic for the entity it touches and idempotent, so callers
/// retry failed writes without further coordination.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load every persisted job with its tasks
    async fn find_all(&self) -> Result<Vec<StoredJob>, StoreError>;

    /// Insert or replace a job
    async fn write_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Insert or replace a task
    async fn write_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Delete a task; deleting a missing task succeeds
    async fn delete_task(&self, task_id: &str) -> Result<(), StoreError>;

    /// Delete a job and any task still attached to it
    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError>;
}
