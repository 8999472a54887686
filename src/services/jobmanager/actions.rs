//! Job and task change actions.
//!
//! Every action a job engine can run is a [`JobAction`] variant. Resolvers and
//! the job manager build them through the constructors below, which also
//! attach the attribution [`Change`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::errors::{SchedulingError, StoreError, VmError};
use crate::domain::models::{reason, Job, JobState, JobStatus, Task, TaskState, TaskStatus};
use crate::domain::ports::{Clock, JobStore, SchedulingService, VirtualMachineMasterService};
use crate::services::reconciler::{
    ActionError, Change, ChangeAction, ChangeKind, ChangeScope, Entity, EntityHolder, Lifecycle, Model,
    ModelUpdateAction, Trigger,
};

/// Node of a job tree: the root holds the job, children hold its tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEntity {
    Job(Job),
    Task(Task),
}

impl JobEntity {
    pub fn as_job(&self) -> Option<&Job> {
        match self {
            Self::Job(job) => Some(job),
            Self::Task(_) => None,
        }
    }

    pub fn as_task(&self) -> Option<&Task> {
        match self {
            Self::Task(task) => Some(task),
            Self::Job(_) => None,
        }
    }
}

impl Entity for JobEntity {
    fn lifecycle(&self) -> Lifecycle {
        match self {
            Self::Job(job) => match job.state() {
                JobState::Accepted => Lifecycle::Active,
                JobState::KillInitiated => Lifecycle::Terminating,
                JobState::Finished => Lifecycle::Finished,
            },
            Self::Task(task) => match task.state() {
                TaskState::Finished => Lifecycle::Finished,
                TaskState::KillInitiated => Lifecycle::Terminating,
                _ => Lifecycle::Active,
            },
        }
    }
}

pub type JobHolder = EntityHolder<JobEntity>;
pub type JobChangeAction = ChangeAction<JobAction>;
pub type JobModelUpdate = ModelUpdateAction<JobEntity>;

/// Build the tree of a job and its tasks.
pub fn job_tree(job: &Job, tasks: &[Task]) -> JobHolder {
    tasks.iter().fold(
        EntityHolder::new(job.id.clone(), JobEntity::Job(job.clone())),
        |root, task| root.with_child(EntityHolder::new(task.id.clone(), JobEntity::Task(task.clone()))),
    )
}

/// Collaborators job actions call into.
#[derive(Clone)]
pub struct JobManagerContext {
    pub store: Arc<dyn JobStore>,
    pub scheduler: Arc<dyn SchedulingService>,
    pub vm: Arc<dyn VirtualMachineMasterService>,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for JobManagerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManagerContext")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl From<StoreError> for ActionError {
    fn from(err: StoreError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<SchedulingError> for ActionError {
    fn from(err: SchedulingError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<VmError> for ActionError {
    fn from(err: VmError) -> Self {
        Self::Failed(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum JobAction {
    /// Persist the reference job
    WriteJob { job: Job },
    /// Persist a reference task
    WriteTask { task: Task },
    /// Add a new task to the job, or replace a finished one
    CreateOrReplaceTask { task: Task, previous: Option<Task> },
    /// Hand an accepted task to the scheduler
    StartNewTask { job: Job, task: Task },
    /// Kill a task. Tasks that never started finish immediately.
    InitiateTaskKill {
        task: Task,
        reason_code: String,
        message: String,
        started: bool,
        /// Job replacing the reference job, when the kill shrinks it
        shrunk_job: Option<Job>,
    },
    /// Force a task stuck in `KillInitiated` to `Finished`
    FinishTask { task: Task, reason_code: String },
    /// Delete a finished task from all trees and the store
    RemoveTask { task: Task, shrunk_job: Option<Job> },
    /// Move a job without remaining work to `Finished`
    CompleteJob { job: Job },
    /// Delete a finished job and its leftover tasks
    RemoveJob { job_id: String, task_ids: Vec<String> },
    /// Change the capacity of a service job
    UpdateJobCapacity { job: Job },
    /// Move a job to `KillInitiated`
    KillJob { job: Job },
    /// Apply a status reported by an agent
    TaskStatusUpdate { task: Task },
}

impl JobAction {
    pub fn write_job(job: Job) -> JobChangeAction {
        let change = Change::new(ChangeScope::Job, Trigger::Reconciler, &job.id, "Writing job to store");
        ChangeAction::new(change, Self::WriteJob { job })
    }

    pub fn write_task(task: Task) -> JobChangeAction {
        let change = Change::new(
            ChangeScope::Task,
            Trigger::Reconciler,
            &task.id,
            format!("Writing task in state {} to store", task.state()),
        );
        ChangeAction::new(change, Self::WriteTask { task })
    }

    pub fn create_task(job: &Job, index: Option<u32>, now_ms: u64) -> JobChangeAction {
        let task = Task::new(job.id.clone(), index, now_ms);
        let change = Change::new(ChangeScope::Task, Trigger::Reconciler, &task.id, "Creating new task");
        ChangeAction::new(change, Self::CreateOrReplaceTask { task, previous: None })
    }

    pub fn replace_task(previous: Task, now_ms: u64) -> JobChangeAction {
        let task = Task::replacing(&previous, now_ms);
        let change = Change::new(
            ChangeScope::Task,
            Trigger::Reconciler,
            &task.id,
            format!(
                "Replacing finished task {} (resubmit {})",
                previous.id, task.resubmit_number
            ),
        );
        ChangeAction::new(
            change,
            Self::CreateOrReplaceTask {
                task,
                previous: Some(previous),
            },
        )
    }

    pub fn start_task(job: Job, task: Task) -> JobChangeAction {
        let change = Change::new(ChangeScope::Task, Trigger::Reconciler, &task.id, "Starting new task");
        ChangeAction::new(change, Self::StartNewTask { job, task })
    }

    pub fn kill_task(
        trigger: Trigger,
        task: Task,
        started: bool,
        reason_code: &str,
        message: impl Into<String>,
    ) -> JobChangeAction {
        let message = message.into();
        let change = Change::new(ChangeScope::Task, trigger, &task.id, format!("Killing task: {message}"));
        ChangeAction::new(
            change,
            Self::InitiateTaskKill {
                task,
                reason_code: reason_code.to_string(),
                message,
                started,
                shrunk_job: None,
            },
        )
    }

    /// Kill a task and lower the desired size of its service job by one.
    pub fn kill_task_and_shrink(task: Task, started: bool, shrunk_job: Job) -> JobChangeAction {
        let change = Change::new(
            ChangeScope::Task,
            Trigger::Api,
            &task.id,
            format!(
                "Killing task and shrinking job to {}",
                shrunk_job.required_size()
            ),
        );
        ChangeAction::new(
            change,
            Self::InitiateTaskKill {
                task,
                reason_code: reason::SCALED_DOWN.to_string(),
                message: "Killed by user with job shrink".to_string(),
                started,
                shrunk_job: Some(shrunk_job),
            },
        )
    }

    pub fn finish_task(task: Task, reason_code: &str) -> JobChangeAction {
        let change = Change::new(
            ChangeScope::Task,
            Trigger::Reconciler,
            &task.id,
            format!("Finishing task stuck in state {}", task.state()),
        );
        ChangeAction::new(
            change,
            Self::FinishTask {
                task,
                reason_code: reason_code.to_string(),
            },
        )
    }

    pub fn remove_task(task: Task, shrunk_job: Option<Job>) -> JobChangeAction {
        let summary = match &shrunk_job {
            Some(job) => format!("Removing task, job shrunk to {}", job.required_size()),
            None => "Removing finished task".to_string(),
        };
        let change = Change::new(ChangeScope::Task, Trigger::Reconciler, &task.id, summary);
        ChangeAction::new(change, Self::RemoveTask { task, shrunk_job })
    }

    pub fn complete_job(job: &Job, now_ms: u64) -> JobChangeAction {
        let finished = job.with_status(JobStatus::new(
            JobState::Finished,
            reason::NORMAL,
            "Job has no more tasks",
            now_ms,
        ));
        let change = Change::new(ChangeScope::Job, Trigger::Reconciler, &job.id, "Completing job");
        ChangeAction::new(change, Self::CompleteJob { job: finished })
    }

    pub fn remove_job(job_id: &str, task_ids: Vec<String>) -> JobChangeAction {
        let change = Change::new(ChangeScope::Close, Trigger::Reconciler, job_id, "Removing job");
        ChangeAction::new(
            change,
            Self::RemoveJob {
                job_id: job_id.to_string(),
                task_ids,
            },
        )
    }

    pub fn update_capacity(job: Job) -> JobChangeAction {
        let change = Change::new(
            ChangeScope::Job,
            Trigger::Api,
            &job.id,
            format!("Changing job capacity to {}", job.required_size()),
        );
        ChangeAction::new(change, Self::UpdateJobCapacity { job })
    }

    pub fn kill_job(job: &Job, now_ms: u64) -> JobChangeAction {
        let killed = job.with_status(JobStatus::new(
            JobState::KillInitiated,
            reason::KILLED,
            "Job killed by user",
            now_ms,
        ));
        let change = Change::new(ChangeScope::Job, Trigger::Api, &job.id, "Killing job");
        ChangeAction::new(change, Self::KillJob { job: killed })
    }

    pub fn task_status_update(task: Task) -> JobChangeAction {
        let change = Change::new(
            ChangeScope::Task,
            Trigger::TaskStatusUpdate,
            &task.id,
            format!("Task moved to {}", task.state()),
        );
        ChangeAction::new(change, Self::TaskStatusUpdate { task })
    }

    /// Task the action is about, if any.
    pub fn task(&self) -> Option<&Task> {
        match self {
            Self::WriteTask { task }
            | Self::CreateOrReplaceTask { task, .. }
            | Self::StartNewTask { task, .. }
            | Self::InitiateTaskKill { task, .. }
            | Self::FinishTask { task, .. }
            | Self::RemoveTask { task, .. }
            | Self::TaskStatusUpdate { task } => Some(task),
            _ => None,
        }
    }
}

fn task_entity(task: &Task) -> JobEntity {
    JobEntity::Task(task.clone())
}

#[async_trait]
impl ChangeKind for JobAction {
    type Entity = JobEntity;
    type Context = JobManagerContext;

    fn name(&self) -> &'static str {
        match self {
            Self::WriteJob { .. } => "WriteJob",
            Self::WriteTask { .. } => "WriteTask",
            Self::CreateOrReplaceTask { .. } => "CreateOrReplaceTask",
            Self::StartNewTask { .. } => "StartNewTask",
            Self::InitiateTaskKill { .. } => "InitiateTaskKill",
            Self::FinishTask { .. } => "FinishTask",
            Self::RemoveTask { .. } => "RemoveTask",
            Self::CompleteJob { .. } => "CompleteJob",
            Self::RemoveJob { .. } => "RemoveJob",
            Self::UpdateJobCapacity { .. } => "UpdateJobCapacity",
            Self::KillJob { .. } => "KillJob",
            Self::TaskStatusUpdate { .. } => "TaskStatusUpdate",
        }
    }

    async fn execute(&self, ctx: &JobManagerContext) -> Result<Vec<JobModelUpdate>, ActionError> {
        match self {
            Self::WriteJob { job } => {
                ctx.store.write_job(job).await?;
                Ok(vec![ModelUpdateAction::replace_entity(
                    Model::Store,
                    &job.id,
                    JobEntity::Job(job.clone()),
                )])
            }
            Self::WriteTask { task } => {
                ctx.store.write_task(task).await?;
                Ok(vec![ModelUpdateAction::add_child(Model::Store, &task.id, task_entity(task))])
            }
            Self::CreateOrReplaceTask { task, previous } => {
                ctx.store.write_task(task).await?;
                let mut updates = Vec::new();
                if let Some(previous) = previous {
                    ctx.store.delete_task(&previous.id).await?;
                    updates.push(ModelUpdateAction::remove(Model::Reference, &previous.id));
                    updates.push(ModelUpdateAction::remove(Model::Running, &previous.id));
                    updates.push(ModelUpdateAction::remove(Model::Store, &previous.id));
                }
                updates.push(ModelUpdateAction::add_child(Model::Reference, &task.id, task_entity(task)));
                updates.push(ModelUpdateAction::add_child(Model::Store, &task.id, task_entity(task)));
                Ok(updates)
            }
            Self::StartNewTask { job, task } => {
                ctx.scheduler.schedule(job, task).await?;
                Ok(vec![ModelUpdateAction::add_child(Model::Running, &task.id, task_entity(task))])
            }
            Self::InitiateTaskKill {
                task,
                reason_code,
                message,
                started,
                shrunk_job,
            } => {
                let now = ctx.clock.now_ms();
                let mut updates = Vec::new();
                if let Some(job) = shrunk_job {
                    updates.push(ModelUpdateAction::replace_entity(
                        Model::Reference,
                        &job.id,
                        JobEntity::Job(job.clone()),
                    ));
                }
                if *started {
                    ctx.vm.kill(&task.id).await?;
                    let killing = task.with_status(TaskStatus::new(
                        TaskState::KillInitiated,
                        reason_code.clone(),
                        message.clone(),
                        now,
                    ));
                    updates.push(ModelUpdateAction::replace_entity(
                        Model::Reference,
                        &task.id,
                        task_entity(&killing),
                    ));
                    updates.push(ModelUpdateAction::replace_entity(Model::Running, &task.id, task_entity(&killing)));
                } else {
                    let finished = task.with_status(TaskStatus::new(
                        TaskState::Finished,
                        reason_code.clone(),
                        message.clone(),
                        now,
                    ));
                    updates.push(ModelUpdateAction::replace_entity(
                        Model::Reference,
                        &task.id,
                        task_entity(&finished),
                    ));
                }
                Ok(updates)
            }
            Self::FinishTask { task, reason_code } => {
                let finished = task.with_status(TaskStatus::new(
                    TaskState::Finished,
                    reason_code.clone(),
                    "Task did not report termination in time",
                    ctx.clock.now_ms(),
                ));
                Ok(vec![
                    ModelUpdateAction::replace_entity(Model::Reference, &task.id, task_entity(&finished)),
                    ModelUpdateAction::replace_entity(Model::Running, &task.id, task_entity(&finished)),
                ])
            }
            Self::RemoveTask { task, shrunk_job } => {
                ctx.store.delete_task(&task.id).await?;
                let mut updates = Vec::new();
                if let Some(job) = shrunk_job {
                    updates.push(ModelUpdateAction::replace_entity(
                        Model::Reference,
                        &job.id,
                        JobEntity::Job(job.clone()),
                    ));
                }
                updates.push(ModelUpdateAction::remove(Model::Reference, &task.id));
                updates.push(ModelUpdateAction::remove(Model::Running, &task.id));
                updates.push(ModelUpdateAction::remove(Model::Store, &task.id));
                Ok(updates)
            }
            Self::CompleteJob { job } => Ok(vec![ModelUpdateAction::replace_entity(
                Model::Reference,
                &job.id,
                JobEntity::Job(job.clone()),
            )]),
            Self::RemoveJob { job_id, task_ids } => {
                for task_id in task_ids {
                    ctx.store.delete_task(task_id).await?;
                }
                ctx.store.delete_job(job_id).await?;
                Ok(vec![ModelUpdateAction::remove(Model::Reference, job_id)])
            }
            Self::UpdateJobCapacity { job } | Self::KillJob { job } => {
                ctx.store.write_job(job).await?;
                Ok(vec![
                    ModelUpdateAction::replace_entity(Model::Reference, &job.id, JobEntity::Job(job.clone())),
                    ModelUpdateAction::replace_entity(Model::Store, &job.id, JobEntity::Job(job.clone())),
                ])
            }
            Self::TaskStatusUpdate { task } => Ok(vec![
                ModelUpdateAction::replace_entity(Model::Reference, &task.id, task_entity(task)),
                ModelUpdateAction::add_child(Model::Running, &task.id, task_entity(task)),
            ]),
        }
    }
}
