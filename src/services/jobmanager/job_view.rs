//! Helpers shared by the service and batch difference resolvers.

use std::sync::Arc;

use crate::domain::models::{reason, Job, JobState, Task, TaskState, TaskTimeoutConfig};
use crate::services::interceptors::RateLimiterInterceptor;
use crate::services::reconciler::{ResolveError, Trigger};

use super::actions::{JobAction, JobChangeAction, JobHolder};

/// Typed view over a job tree.
#[derive(Debug)]
pub struct JobView<'a> {
    holder: &'a JobHolder,
    job: &'a Job,
    tasks: Vec<&'a Task>,
}

impl<'a> JobView<'a> {
    /// Fails when the root is not a job or a child is not a task.
    pub fn new(holder: &'a JobHolder) -> Result<Self, ResolveError> {
        let job = holder.entity().as_job().ok_or_else(|| ResolveError::UnexpectedEntity {
            id: holder.id().to_string(),
            expected: "job",
        })?;
        let tasks = holder
            .children()
            .iter()
            .map(|child| {
                child.entity().as_task().ok_or_else(|| ResolveError::UnexpectedEntity {
                    id: child.id().to_string(),
                    expected: "task",
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { holder, job, tasks })
    }

    pub fn holder(&self) -> &'a JobHolder {
        self.holder
    }

    pub fn job(&self) -> &'a Job {
        self.job
    }

    /// Tasks in tree order.
    pub fn tasks(&self) -> &[&'a Task] {
        &self.tasks
    }

    pub fn task(&self, task_id: &str) -> Option<&'a Task> {
        self.tasks.iter().copied().find(|t| t.id == task_id)
    }

    pub fn terminating_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_terminating()).count()
    }

    pub fn is_job_terminating(&self) -> bool {
        self.job.state() == JobState::KillInitiated
    }
}

/// Whether a replacement may still be created for `task`.
pub fn has_reached_retry_limit(job: &Job, task: &Task) -> bool {
    task.resubmit_number >= job.retry_policy().retries
}

/// Kill every reference task that is not already terminating. Tasks the
/// running tree does not know about never started and are finished directly.
pub fn kill_remaining_tasks(reference: &JobView<'_>, running: &JobView<'_>) -> Vec<JobChangeAction> {
    reference
        .tasks()
        .iter()
        .filter(|task| !task.is_terminating())
        .map(|task| {
            let started = running.task(&task.id).is_some();
            JobAction::kill_task(
                Trigger::Reconciler,
                (*task).clone(),
                started,
                reason::KILLED,
                "Job is being killed",
            )
        })
        .collect()
}

/// Start reference tasks the running tree does not know about, at most as
/// many as the rate limiter currently admits. Each start consumes a token.
pub fn find_missing_running_tasks(
    reference: &JobView<'_>,
    running: &JobView<'_>,
    rate_limiter: &Arc<RateLimiterInterceptor>,
) -> Vec<JobChangeAction> {
    let allowed = usize::try_from(rate_limiter.execution_limits(running.holder())).unwrap_or(usize::MAX);
    reference
        .tasks()
        .iter()
        .filter(|task| !task.is_terminating() && running.task(&task.id).is_none())
        .take(allowed)
        .map(|task| {
            let action = JobAction::start_task(reference.job().clone(), (*task).clone());
            rate_limiter.apply(reference.holder(), action)
        })
        .collect()
}

/// Corrective actions for running tasks stuck in an intermediate state.
pub fn find_task_state_timeouts(running: &JobView<'_>, timeouts: &TaskTimeoutConfig, now_ms: u64) -> Vec<JobChangeAction> {
    running
        .tasks()
        .iter()
        .filter_map(|task| {
            let timeout = match task.state() {
                TaskState::Launched => timeouts.launched_ms,
                TaskState::StartInitiated => timeouts.start_initiated_ms,
                TaskState::KillInitiated => timeouts.kill_initiated_ms,
                _ => return None,
            };
            if now_ms.saturating_sub(task.status.timestamp_ms) <= timeout {
                return None;
            }
            let action = if task.state() == TaskState::KillInitiated {
                JobAction::finish_task((*task).clone(), reason::STUCK_IN_KILLING_STATE)
            } else {
                JobAction::kill_task(
                    Trigger::Reconciler,
                    (*task).clone(),
                    true,
                    reason::STUCK_IN_STATE,
                    format!("Task stuck in state {} for more than {timeout}ms", task.state()),
                )
            };
            Some(action)
        })
        .collect()
}

/// Finish tasks stuck in `KillInitiated`. This is the only timeout that
/// still applies while the job itself is being killed.
pub fn find_stuck_kills(running: &JobView<'_>, timeouts: &TaskTimeoutConfig, now_ms: u64) -> Vec<JobChangeAction> {
    find_task_state_timeouts(running, timeouts, now_ms)
        .into_iter()
        .filter(|action| matches!(action.kind(), JobAction::FinishTask { .. }))
        .collect()
}

/// Final steps of a job: a killed job without tasks becomes finished, and a
/// finished job is removed from the store.
pub fn remove_completed_job(reference: &JobView<'_>, store: &JobView<'_>, now_ms: u64) -> Option<JobChangeAction> {
    match reference.job().state() {
        JobState::KillInitiated if reference.tasks().is_empty() => {
            Some(JobAction::complete_job(reference.job(), now_ms))
        }
        JobState::Finished => {
            let task_ids = store.tasks().iter().map(|t| t.id.clone()).collect();
            Some(JobAction::remove_job(&reference.job().id, task_ids))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Capacity, JobStatus, RetryPolicy, TaskStatus};
    use crate::services::jobmanager::actions::{job_tree, JobEntity};
    use crate::services::reconciler::{ChangeKind, EntityHolder};

    fn job() -> Job {
        Job::service("job-1", "app", Capacity::new(0, 2, 4), RetryPolicy { retries: 2 }, 0)
    }

    fn in_state(task: &Task, state: TaskState, at: u64) -> Task {
        task.with_status(TaskStatus::new(state, reason::NORMAL, "", at))
    }

    #[test]
    fn test_view_rejects_task_root() {
        let root = EntityHolder::new("t1", JobEntity::Task(Task::new("job-1", None, 0)));
        let err = JobView::new(&root).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnexpectedEntity {
                id: "t1".to_string(),
                expected: "job"
            }
        );
    }

    #[test]
    fn test_retry_limit() {
        let job = job();
        let first = Task::new("job-1", None, 0);
        let second = Task::replacing(&first, 0);
        let third = Task::replacing(&second, 0);
        assert!(!has_reached_retry_limit(&job, &first));
        assert!(!has_reached_retry_limit(&job, &second));
        assert!(has_reached_retry_limit(&job, &third));
    }

    #[test]
    fn test_timeouts_per_state() {
        let timeouts = TaskTimeoutConfig {
            launched_ms: 100,
            start_initiated_ms: 200,
            kill_initiated_ms: 300,
        };
        let fresh = || Task::new("job-1", None, 0);
        let launched = in_state(&fresh(), TaskState::Launched, 0);
        let starting = in_state(&fresh(), TaskState::StartInitiated, 0);
        let killing = in_state(&fresh(), TaskState::KillInitiated, 0);
        let started = in_state(&fresh(), TaskState::Started, 0);

        let tree = job_tree(&job(), &[launched, starting, killing, started]);
        let view = JobView::new(&tree).unwrap();

        assert!(find_task_state_timeouts(&view, &timeouts, 100).is_empty());
        let names: Vec<_> = find_task_state_timeouts(&view, &timeouts, 250)
            .iter()
            .map(|a| a.kind().name())
            .collect();
        assert_eq!(names, vec!["InitiateTaskKill", "InitiateTaskKill"]);
        let names: Vec<_> = find_task_state_timeouts(&view, &timeouts, 301)
            .iter()
            .map(|a| a.kind().name())
            .collect();
        assert_eq!(names, vec!["InitiateTaskKill", "InitiateTaskKill", "FinishTask"]);
    }

    #[test]
    fn test_completed_job_removal_steps() {
        let killed = job().with_status(JobStatus::new(JobState::KillInitiated, reason::KILLED, "", 0));
        let tree = job_tree(&killed, &[]);
        let view = JobView::new(&tree).unwrap();
        let action = remove_completed_job(&view, &view, 5).unwrap();
        assert_eq!(action.kind().name(), "CompleteJob");

        let finished = killed.with_status(JobStatus::new(JobState::Finished, reason::NORMAL, "", 5));
        let reference = job_tree(&finished, &[]);
        let leftover = Task::new("job-1", None, 0);
        let store = job_tree(&finished, &[leftover.clone()]);
        let action = remove_completed_job(&JobView::new(&reference).unwrap(), &JobView::new(&store).unwrap(), 6).unwrap();
        let JobAction::RemoveJob { task_ids, .. } = action.kind() else {
            panic!("expected RemoveJob");
        };
        assert_eq!(task_ids, &vec![leftover.id]);

        let active = job_tree(&job(), &[]);
        let view = JobView::new(&active).unwrap();
        assert!(remove_completed_job(&view, &view, 0).is_none());
    }
}
