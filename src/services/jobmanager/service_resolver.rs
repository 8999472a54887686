//! Difference resolver of service jobs.
//!
//! A service job keeps `capacity.desired` tasks running (capped by the SLA of
//! its capacity group). Runtime reconciliation grows or shrinks the reference
//! task set, starts reference tasks missing from the running tree and deals
//! with stuck tasks; store reconciliation persists whatever the store lags
//! behind on and replaces or removes finished tasks.

use std::sync::Arc;

use tracing::debug;

use crate::domain::models::{reason, Job, JobState, TaskTimeoutConfig};
use crate::domain::ports::{ApplicationSlaManagementService, Clock};
use crate::services::interceptors::{RateLimiterInterceptor, RetryActionInterceptor};
use crate::services::reconciler::{DifferenceResolver, ResolveError, Trigger};

use super::actions::{JobAction, JobChangeAction, JobHolder};
use super::job_view::{
    find_missing_running_tasks, find_stuck_kills, find_task_state_timeouts, has_reached_retry_limit, kill_remaining_tasks,
    remove_completed_job, JobView,
};

pub struct ServiceDifferenceResolver {
    sla: Arc<dyn ApplicationSlaManagementService>,
    store_retry: Arc<RetryActionInterceptor>,
    rate_limiter: Arc<RateLimiterInterceptor>,
    timeouts: TaskTimeoutConfig,
    clock: Arc<dyn Clock>,
}

impl ServiceDifferenceResolver {
    pub fn new(
        sla: Arc<dyn ApplicationSlaManagementService>,
        store_retry: Arc<RetryActionInterceptor>,
        rate_limiter: Arc<RateLimiterInterceptor>,
        timeouts: TaskTimeoutConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sla,
            store_retry,
            rate_limiter,
            timeouts,
            clock,
        }
    }

    fn apply_runtime(&self, reference: &JobView<'_>, running: &JobView<'_>, store: &JobHolder) -> Vec<JobChangeAction> {
        match reference.job().state() {
            JobState::KillInitiated => {
                let mut actions = kill_remaining_tasks(reference, running);
                actions.extend(find_stuck_kills(running, &self.timeouts, self.clock.now_ms()));
                return actions;
            }
            JobState::Finished => return Vec::new(),
            JobState::Accepted => {}
        }

        let mut actions = self.find_job_size_inconsistencies(reference, running, store);
        actions.extend(find_missing_running_tasks(reference, running, &self.rate_limiter));
        actions.extend(find_task_state_timeouts(running, &self.timeouts, self.clock.now_ms()));
        actions
    }

    /// Number of tasks the job may grow to.
    fn allowed_size(&self, job: &Job) -> usize {
        let required = job.required_size();
        let capped = self
            .sla
            .get_application_sla(&job.descriptor.capacity_group)
            .map_or(required, |sla| required.min(sla.instance_count));
        usize::try_from(capped).unwrap_or(usize::MAX)
    }

    fn find_job_size_inconsistencies(
        &self,
        reference: &JobView<'_>,
        running: &JobView<'_>,
        store: &JobHolder,
    ) -> Vec<JobChangeAction> {
        let job = reference.job();
        let tasks = reference.tasks();
        let required = usize::try_from(job.required_size()).unwrap_or(usize::MAX);

        if required < tasks.len() {
            let already_terminating = reference.terminating_count();
            let to_remove = (tasks.len() - required).saturating_sub(already_terminating);
            return tasks
                .iter()
                .rev()
                .filter(|task| !task.is_terminating())
                .take(to_remove)
                .map(|task| {
                    JobAction::kill_task(
                        Trigger::Reconciler,
                        (*task).clone(),
                        running.task(&task.id).is_some(),
                        reason::SCALED_DOWN,
                        "Terminating excessive service job task",
                    )
                })
                .collect();
        }

        let missing = self.allowed_size(job).saturating_sub(tasks.len());
        if missing == 0 || !self.store_retry.execution_limits(store) {
            return Vec::new();
        }
        let now = self.clock.now_ms();
        (0..missing)
            .map(|_| self.guard_new_task(reference.holder(), JobAction::create_task(job, None, now)))
            .collect()
    }

    /// New tasks consume a rate limiter token and back off on store failures.
    fn guard_new_task(&self, holder: &JobHolder, action: JobChangeAction) -> JobChangeAction {
        self.rate_limiter
            .apply(holder, self.store_retry.apply(holder, action))
    }

    fn apply_store(&self, reference: &JobView<'_>, store: &JobView<'_>) -> Vec<JobChangeAction> {
        if !self.store_retry.execution_limits(store.holder()) {
            debug!(job_id = %reference.job().id, "Store writes backing off");
            return Vec::new();
        }

        let holder = reference.holder();
        let job = reference.job();
        let mut actions = Vec::new();

        if job != store.job() {
            actions.push(self.store_retry.apply(holder, JobAction::write_job(job.clone())));
        }

        let now = self.clock.now_ms();
        let mut shrunk: Option<Job> = None;
        for reference_task in holder.children() {
            let in_sync = store
                .holder()
                .find_child(reference_task.id())
                .is_some_and(|stored| stored.is_equivalent_to(reference_task));
            let Some(task) = reference.task(reference_task.id()) else {
                continue;
            };

            if !in_sync {
                actions.push(self.store_retry.apply(holder, JobAction::write_task(task.clone())));
                continue;
            }
            if !task.state().is_terminal() {
                continue;
            }

            let action = if reference.is_job_terminating() || task.status.reason_code == reason::SCALED_DOWN {
                JobAction::remove_task(task.clone(), None)
            } else if !has_reached_retry_limit(job, task) {
                actions.push(self.guard_new_task(holder, JobAction::replace_task(task.clone(), now)));
                continue;
            } else {
                // Out of replacements: drop the task and the slot it held
                let base = shrunk.as_ref().unwrap_or(job);
                let next = base.capacity().map_or_else(|| base.clone(), |c| base.with_capacity(c.shrunk_by_one()));
                shrunk = Some(next.clone());
                debug!(job_id = %job.id, task_id = %task.id, "Task retries exhausted");
                JobAction::remove_task(task.clone(), Some(next))
            };
            actions.push(self.store_retry.apply(holder, action));
        }
        actions
    }
}

impl DifferenceResolver<JobAction> for ServiceDifferenceResolver {
    fn resolve(
        &self,
        reference: &JobHolder,
        running: &JobHolder,
        store: &JobHolder,
    ) -> Result<Vec<JobChangeAction>, ResolveError> {
        let reference_view = JobView::new(reference)?;
        let running_view = JobView::new(running)?;
        let store_view = JobView::new(store)?;

        let mut actions = self.apply_runtime(&reference_view, &running_view, store);
        actions.extend(self.apply_store(&reference_view, &store_view));

        if actions.is_empty() && self.store_retry.execution_limits(store) {
            actions.extend(
                remove_completed_job(&reference_view, &store_view, self.clock.now_ms())
                    .map(|action| self.store_retry.apply(reference, action)),
            );
        }
        Ok(actions)
    }
}

impl std::fmt::Debug for ServiceDifferenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDifferenceResolver")
            .field("store_retry", &self.store_retry)
            .field("rate_limiter", &self.rate_limiter)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}
