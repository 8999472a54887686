use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::SchedulingError;
use crate::domain::models::{Job, Task};
use crate::domain::ports::{SchedulingService, VirtualMachineLease, VirtualMachineMasterService};

/// Places tasks round-robin on a fixed pool of agents and launches them
/// right away.
pub struct InMemoryScheduler {
    vm: Arc<dyn VirtualMachineMasterService>,
    agents: usize,
    next_agent: AtomicUsize,
    reject: AtomicBool,
}

impl InMemoryScheduler {
    pub fn new(vm: Arc<dyn VirtualMachineMasterService>, agents: usize) -> Self {
        Self {
            vm,
            agents,
            next_agent: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
        }
    }

    /// Reject every placement request.
    pub fn reject_all(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    fn lease(&self) -> VirtualMachineLease {
        let agent = self.next_agent.fetch_add(1, Ordering::SeqCst) % self.agents;
        VirtualMachineLease {
            lease_id: Uuid::new_v4().to_string(),
            agent_id: format!("agent-{agent}"),
            hostname: format!("agent-{agent}.local"),
        }
    }
}

#[async_trait]
impl SchedulingService for InMemoryScheduler {
    async fn schedule(&self, job: &Job, task: &Task) -> Result<(), SchedulingError> {
        if self.agents == 0 {
            return Err(SchedulingError::NoCapacity(job.descriptor.capacity_group.clone()));
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(SchedulingError::Rejected {
                task_id: task.id.clone(),
                reason: "placement disabled".to_string(),
            });
        }
        let lease = self.lease();
        debug!(task_id = %task.id, agent_id = %lease.agent_id, "Task placed");
        self.vm
            .launch(task, &lease)
            .await
            .map_err(|e| SchedulingError::Rejected {
                task_id: task.id.clone(),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for InMemoryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryScheduler")
            .field("agents", &self.agents)
            .finish_non_exhaustive()
    }
}
