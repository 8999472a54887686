use crate::domain::errors::VmError;
use crate::domain::models::{Task, TaskState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Resources offered by an agent and consumed by one task launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineLease {
    pub lease_id: String,
    pub agent_id: String,
    pub hostname: String,
}

/// Task status reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_id: String,
    pub state: TaskState,
    pub reason_code: String,
    pub message: String,
}

/// Agent control. Calls are asynchronous and at-least-once: a kill may be
/// repeated safely.
#[async_trait]
pub trait VirtualMachineMasterService: Send + Sync {
    /// Launch a task on the agent owning `lease`
    async fn launch(&self, task: &Task, lease: &VirtualMachineLease) -> Result<(), VmError>;

    /// Kill a task; killing an unknown task succeeds
    async fn kill(&self, task_id: &str) -> Result<(), VmError>;

    /// Stream of task status reports coming back from agents
    fn status_updates(&self) -> broadcast::Receiver<TaskStatusReport>;
}
