//! Difference resolver of batch jobs.
//!
//! A batch job has a fixed number of slots, one task per slot index. Slots are
//! never scaled down. A task that finishes normally completes its slot; a
//! failed task is replaced until its retry budget runs out, after which the
//! slot stays finished. Once every slot is finished the job completes.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::domain::models::{reason, JobState, TaskTimeoutConfig};
use crate::domain::ports::Clock;
use crate::services::interceptors::{RateLimiterInterceptor, RetryActionInterceptor};
use crate::services::reconciler::{DifferenceResolver, ResolveError};

use super::actions::{JobAction, JobChangeAction, JobHolder};
use super::job_view::{
    find_missing_running_tasks, find_stuck_kills, find_task_state_timeouts, has_reached_retry_limit, kill_remaining_tasks,
    remove_completed_job, JobView,
};

pub struct BatchDifferenceResolver {
    store_retry: Arc<RetryActionInterceptor>,
    rate_limiter: Arc<RateLimiterInterceptor>,
    timeouts: TaskTimeoutConfig,
    clock: Arc<dyn Clock>,
}

impl BatchDifferenceResolver {
    pub fn new(
        store_retry: Arc<RetryActionInterceptor>,
        rate_limiter: Arc<RateLimiterInterceptor>,
        timeouts: TaskTimeoutConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store_retry,
            rate_limiter,
            timeouts,
            clock,
        }
    }

    fn guard_new_task(&self, holder: &JobHolder, action: JobChangeAction) -> JobChangeAction {
        self.rate_limiter
            .apply(holder, self.store_retry.apply(holder, action))
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

        let mut actions = self.find_missing_slots(reference, store);
        actions.extend(find_missing_running_tasks(reference, running, &self.rate_limiter));
        actions.extend(find_task_state_timeouts(running, &self.timeouts, self.clock.now_ms()));
        actions
    }

    /// Create a task for every slot index without one.
    fn find_missing_slots(&self, reference: &JobView<'_>, store: &JobHolder) -> Vec<JobChangeAction> {
        let job = reference.job();
        let occupied: BTreeSet<u32> = reference.tasks().iter().filter_map(|t| t.index).collect();
        let size = job.required_size();
        if occupied.len() >= usize::try_from(size).unwrap_or(usize::MAX) || !self.store_retry.execution_limits(store) {
            return Vec::new();
        }
        let now = self.clock.now_ms();
        (0..size)
            .filter(|index| !occupied.contains(index))
            .map(|index| self.guard_new_task(reference.holder(), JobAction::create_task(job, Some(index), now)))
            .collect()
    }

    fn apply_store(&self, reference: &JobView<'_>, store: &JobView<'_>) -> Vec<JobChangeAction> {
        if !self.store_retry.execution_limits(store.holder()) {
            return Vec::new();
        }

        let holder = reference.holder();
        let job = reference.job();
        let mut actions = Vec::new();

        if job != store.job() {
            actions.push(self.store_retry.apply(holder, JobAction::write_job(job.clone())));
        }

        let now = self.clock.now_ms();
        for reference_task in holder.children() {
            let Some(task) = reference.task(reference_task.id()) else {
                continue;
            };
            let in_sync = store
                .holder()
                .find_child(reference_task.id())
                .is_some_and(|stored| stored.is_equivalent_to(reference_task));

            if !in_sync {
                actions.push(self.store_retry.apply(holder, JobAction::write_task(task.clone())));
            } else if task.state().is_terminal() {
                if reference.is_job_terminating() {
                    actions.push(self.store_retry.apply(holder, JobAction::remove_task(task.clone(), None)));
                } else if task.status.reason_code != reason::NORMAL && !has_reached_retry_limit(job, task) {
                    actions.push(self.guard_new_task(holder, JobAction::replace_task(task.clone(), now)));
                }
            }
        }
        actions
    }

    /// Every slot holds a finished task that will not be replaced.
    fn all_slots_done(reference: &JobView<'_>) -> bool {
        let size = usize::try_from(reference.job().required_size()).unwrap_or(usize::MAX);
        reference.tasks().len() >= size && reference.tasks().iter().all(|t| t.state().is_terminal())
    }
}

impl DifferenceResolver<JobAction> for BatchDifferenceResolver {
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
            let now = self.clock.now_ms();
            let last_step = if reference_view.job().state() == JobState::Accepted && Self::all_slots_done(&reference_view) {
                Some(JobAction::complete_job(reference_view.job(), now))
            } else {
                remove_completed_job(&reference_view, &store_view, now)
            };
            actions.extend(last_step.map(|action| self.store_retry.apply(reference, action)));
        }
        Ok(actions)
    }
}

impl std::fmt::Debug for BatchDifferenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDifferenceResolver")
            .field("store_retry", &self.store_retry)
            .field("rate_limiter", &self.rate_limiter)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}
