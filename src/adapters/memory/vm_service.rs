use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::errors::VmError;
use crate::domain::models::{reason, Task, TaskState};
use crate::domain::ports::{TaskStatusReport, VirtualMachineLease, VirtualMachineMasterService};

/// Agent pool that acknowledges every call immediately.
///
/// A launch reports `Launched`, `StartInitiated` and `Started` in order; a kill
/// reports `Finished`. Reports go out on a broadcast channel, so subscribers
/// must exist before the calls they care about.
#[derive(Debug)]
pub struct SimulatedVmService {
    updates: broadcast::Sender<TaskStatusReport>,
    launched: Mutex<Vec<String>>,
    killed: Mutex<Vec<String>>,
    fail_launches: AtomicBool,
    hold_launches: AtomicBool,
}

impl SimulatedVmService {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            updates,
            launched: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            fail_launches: AtomicBool::new(false),
            hold_launches: AtomicBool::new(false),
        }
    }

    /// Make every launch fail.
    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Report only `Launched` for new launches, leaving tasks stuck there.
    pub fn hold_launches(&self, hold: bool) {
        self.hold_launches.store(hold, Ordering::SeqCst);
    }

    /// Ids of launched tasks, in launch order.
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Ids of killed tasks, in kill order.
    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Report that a task terminated on its own.
    pub fn finish(&self, task_id: &str, reason_code: &str, message: &str) {
        self.report(task_id, TaskState::Finished, reason_code, message);
    }

    pub fn report(&self, task_id: &str, state: TaskState, reason_code: &str, message: &str) {
        // Nobody listening is fine
        let _ = self.updates.send(TaskStatusReport {
            task_id: task_id.to_string(),
            state,
            reason_code: reason_code.to_string(),
            message: message.to_string(),
        });
    }
}

#[async_trait]
impl VirtualMachineMasterService for SimulatedVmService {
    async fn launch(&self, task: &Task, lease: &VirtualMachineLease) -> Result<(), VmError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(VmError::LaunchFailed {
                task_id: task.id.clone(),
                reason: format!("agent {} refused the launch", lease.agent_id),
            });
        }
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task.id.clone());
        debug!(task_id = %task.id, agent_id = %lease.agent_id, "Simulated launch");

        self.report(&task.id, TaskState::Launched, reason::NORMAL, "Launched on agent");
        if !self.hold_launches.load(Ordering::SeqCst) {
            self.report(&task.id, TaskState::StartInitiated, reason::NORMAL, "Container starting");
            self.report(&task.id, TaskState::Started, reason::NORMAL, "Container running");
        }
        Ok(())
    }

    async fn kill(&self, task_id: &str) -> Result<(), VmError> {
        self.killed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task_id.to_string());
        self.finish(task_id, reason::KILLED, "Container killed");
        Ok(())
    }

    fn status_updates(&self) -> broadcast::Receiver<TaskStatusReport> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease() -> VirtualMachineLease {
        VirtualMachineLease {
            lease_id: "l1".to_string(),
            agent_id: "agent-0".to_string(),
            hostname: "agent-0.local".to_string(),
        }
    }

    #[tokio::test]
    async fn test_launch_reports_start_sequence() {
        let vm = SimulatedVmService::new(8);
        let mut updates = vm.status_updates();
        let task = Task::new("job-1", None, 0);

        vm.launch(&task, &lease()).await.unwrap();

        let states: Vec<_> = (0..3).map(|_| updates.try_recv().unwrap().state).collect();
        assert_eq!(states, vec![TaskState::Launched, TaskState::StartInitiated, TaskState::Started]);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_kill_reports_finished() {
        let vm = SimulatedVmService::new(8);
        let mut updates = vm.status_updates();

        vm.kill("t1").await.unwrap();

        let report = updates.try_recv().unwrap();
        assert_eq!(report.state, TaskState::Finished);
        assert_eq!(report.reason_code, reason::KILLED);
        assert_eq!(vm.killed(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_launch_reports_nothing() {
        let vm = SimulatedVmService::new(8);
        let mut updates = vm.status_updates();
        vm.fail_launches(true);

        assert!(vm.launch(&Task::new("job-1", None, 0), &lease()).await.is_err());
        assert!(updates.try_recv().is_err());
        assert!(vm.launched().is_empty());
    }
}
