//! Owner of every job's reconciliation engine.
//!
//! The job manager turns API calls into change actions for the engine of the
//! target job, routes agent status reports to the engine owning the task and
//! retires engines once their job is removed from the store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::domain::errors::StoreError;
use crate::domain::models::{Capacity, Config, Job, JobState, Task, TaskState, TaskStatus};
use crate::domain::ports::{ApplicationSlaManagementService, TaskStatusReport};
use crate::services::interceptors::{RateLimiterInterceptor, RetryActionInterceptor};
use crate::services::metrics::{FsmMetrics, MetricsRegistry, TASK_CURRENT_STATE, TASK_UPDATES};
use crate::services::reconciler::{
    ActionError, DifferenceResolver, EngineHandle, EngineState, EventSink, Model, ReconcilerEvent,
    ReconcilerEventType, ReconciliationEngine, ResolveError, Trigger,
};

use super::actions::{job_tree, JobAction, JobChangeAction, JobEntity, JobHolder, JobManagerContext};
use super::batch_resolver::BatchDifferenceResolver;
use super::job_view::JobView;
use super::service_resolver::ServiceDifferenceResolver;

type JobEngines = Arc<RwLock<BTreeMap<String, EngineHandle<JobAction>>>>;

#[derive(Debug, Error)]
pub enum JobManagerError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Job already exists: {0}")]
    JobExists(String),

    #[error("Invalid capacity for job {job_id}: {reason}")]
    InvalidCapacity { job_id: String, reason: String },

    #[error("Job {0} is not active")]
    JobNotActive(String),

    #[error("Task {0} is already terminating")]
    TaskTerminating(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Change rejected: {0}")]
    Action(#[from] ActionError),

    #[error("Job {job_id} cannot be reconciled: {source}")]
    Engine {
        job_id: String,
        #[source]
        source: ResolveError,
    },
}

pub struct JobManager {
    config: Config,
    context: Arc<JobManagerContext>,
    service_resolver: Arc<dyn DifferenceResolver<JobAction>>,
    batch_resolver: Arc<dyn DifferenceResolver<JobAction>>,
    store_retry: Arc<RetryActionInterceptor>,
    rate_limiter: Arc<RateLimiterInterceptor>,
    engines: JobEngines,
    events: broadcast::Sender<ReconcilerEvent<JobEntity>>,
    task_metrics: Arc<FsmMetrics<TaskState>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<JoinSet<()>>,
}

impl JobManager {
    pub fn new(
        config: Config,
        context: JobManagerContext,
        sla: Arc<dyn ApplicationSlaManagementService>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let clock = Arc::clone(&context.clock);
        let store_retry = Arc::new(RetryActionInterceptor::new(
            "storeWrite",
            &config.store_retry,
            Arc::clone(&clock),
        ));
        let rate_limiter = Arc::new(RateLimiterInterceptor::new(
            "newTask",
            &config.rate_limit,
            Arc::clone(&clock),
        ));
        let service_resolver = Arc::new(ServiceDifferenceResolver::new(
            sla,
            Arc::clone(&store_retry),
            Arc::clone(&rate_limiter),
            config.task_timeouts.clone(),
            Arc::clone(&clock),
        ));
        let batch_resolver = Arc::new(BatchDifferenceResolver::new(
            Arc::clone(&store_retry),
            Arc::clone(&rate_limiter),
            config.task_timeouts.clone(),
            clock,
        ));
        let (events, _) = broadcast::channel(config.reconciler.event_channel_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Self {
            context: Arc::new(context),
            service_resolver,
            batch_resolver,
            store_retry,
            rate_limiter,
            engines: Arc::new(RwLock::new(BTreeMap::new())),
            events,
            task_metrics: Arc::new(FsmMetrics::new(TASK_CURRENT_STATE, TASK_UPDATES, metrics)),
            shutdown,
            workers: Mutex::new(JoinSet::new()),
            config,
        }
    }

    /// Start routing agent status reports and recording task metrics.
    /// Call before creating or bootstrapping jobs.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        self.spawn_status_router(&mut workers);
        self.spawn_metrics_recorder(&mut workers);
    }

    /// Stream of the events of every job.
    pub fn events(&self) -> broadcast::Receiver<ReconcilerEvent<JobEntity>> {
        self.events.subscribe()
    }

    /// Persist a new job and start reconciling it.
    pub async fn create_job(&self, job: Job) -> Result<String, JobManagerError> {
        if let Some(capacity) = job.capacity() {
            validate_capacity(&job.id, &capacity)?;
        }
        if self.engines.read().await.contains_key(&job.id) {
            return Err(JobManagerError::JobExists(job.id));
        }

        self.context.store.write_job(&job).await?;
        let tree = job_tree(&job, &[]);
        self.start_engine(tree.clone(), tree.clone(), tree).await?;
        info!(job_id = %job.id, service = job.is_service(), size = job.required_size(), "Job created");
        Ok(job.id)
    }

    /// Load every persisted job into a fresh engine. Tasks that never left
    /// `Accepted` are not considered running.
    pub async fn bootstrap(&self) -> Result<usize, JobManagerError> {
        let stored = self.context.store.find_all().await?;
        let mut started = 0;
        for entry in stored {
            if self.engines.read().await.contains_key(&entry.job.id) {
                debug!(job_id = %entry.job.id, "Job already loaded");
                continue;
            }
            let launched: Vec<Task> = entry
                .tasks
                .iter()
                .filter(|t| t.state() != TaskState::Accepted)
                .cloned()
                .collect();
            let reference = job_tree(&entry.job, &entry.tasks);
            let running = job_tree(&entry.job, &launched);
            self.start_engine(reference.clone(), running, reference).await?;
            started += 1;
        }
        info!(jobs = started, "Jobs loaded from store");
        Ok(started)
    }

    /// Change the capacity of a service job.
    pub async fn update_capacity(&self, job_id: &str, capacity: Capacity) -> Result<(), JobManagerError> {
        validate_capacity(job_id, &capacity)?;
        let (handle, job) = self.active_job(job_id).await?;
        if !job.is_service() {
            return Err(JobManagerError::InvalidCapacity {
                job_id: job_id.to_string(),
                reason: "batch jobs have a fixed size".to_string(),
            });
        }
        // Built from the live job so concurrent shrinks are not lost
        handle
            .apply_change_with(move |reference| {
                let job = reference.entity().as_job()?;
                (job.state() == JobState::Accepted).then(|| JobAction::update_capacity(job.with_capacity(capacity)))
            })
            .await?;
        info!(job_id, desired = capacity.desired, "Job capacity changed");
        Ok(())
    }

    /// Move a job to `KillInitiated`; its engine then kills every task.
    pub async fn kill_job(&self, job_id: &str) -> Result<(), JobManagerError> {
        let (handle, _) = self.active_job(job_id).await?;
        let now = self.context.clock.now_ms();
        handle
            .apply_change_with(move |reference| {
                let job = reference.entity().as_job()?;
                (job.state() == JobState::Accepted).then(|| JobAction::kill_job(job, now))
            })
            .await?;
        info!(job_id, "Job kill initiated");
        Ok(())
    }

    /// Kill one task. With `shrink` the desired size of its service job drops
    /// by one, so the task is not replaced.
    pub async fn kill_task(&self, task_id: &str, shrink: bool) -> Result<(), JobManagerError> {
        let Some(handle) = self.engine_of_task(task_id).await else {
            return Err(JobManagerError::TaskNotFound(task_id.to_string()));
        };
        let snapshot = handle.snapshot();
        let (Some(reference), Some(running)) = (snapshot.reference, snapshot.running) else {
            return Err(JobManagerError::TaskNotFound(task_id.to_string()));
        };
        let view = JobView::new(&reference).map_err(|source| JobManagerError::Engine {
            job_id: handle.job_id().to_string(),
            source,
        })?;
        let task = view
            .task(task_id)
            .ok_or_else(|| JobManagerError::TaskNotFound(task_id.to_string()))?;
        if task.is_terminating() {
            return Err(JobManagerError::TaskTerminating(task_id.to_string()));
        }

        let started = running.find_child(task_id).is_some();
        let action = if shrink {
            let job = view.job();
            let capacity = job
                .capacity()
                .filter(|c| c.desired > c.min)
                .ok_or_else(|| JobManagerError::InvalidCapacity {
                    job_id: job.id.clone(),
                    reason: "cannot shrink below the minimum size".to_string(),
                })?;
            let shrunk = job.with_capacity(Capacity::new(capacity.min, capacity.desired - 1, capacity.max));
            JobAction::kill_task_and_shrink(task.clone(), started, shrunk)
        } else {
            JobAction::kill_task(
                Trigger::Api,
                task.clone(),
                started,
                crate::domain::models::reason::KILLED,
                "Killed by user",
            )
        };
        handle.apply_change_action(action).await?;
        info!(task_id, shrink, "Task kill initiated");
        Ok(())
    }

    /// Ids of every job with a live engine, sorted.
    pub async fn job_ids(&self) -> Vec<String> {
        self.engines.read().await.keys().cloned().collect()
    }

    /// The job and its tasks as the reference tree currently holds them.
    pub async fn reference_view(&self, job_id: &str) -> Option<(Job, Vec<Task>)> {
        let handle = self.engines.read().await.get(job_id).cloned()?;
        let reference = handle.snapshot().reference?;
        let view = JobView::new(&reference).ok()?;
        Some((view.job().clone(), view.tasks().iter().map(|t| (*t).clone()).collect()))
    }

    pub async fn engine(&self, job_id: &str) -> Option<EngineHandle<JobAction>> {
        self.engines.read().await.get(job_id).cloned()
    }

    /// Number of background loops and engine workers still running.
    pub async fn active_workers(&self) -> usize {
        let mut workers = self.workers.lock().await;
        reap_finished(&mut workers);
        workers.len()
    }

    /// Stop every engine and background loop and wait for them.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        let mut count = 0;
        while let Some(result) = workers.join_next().await {
            count += 1;
            if let Err(e) = result {
                warn!(error = %e, "Job manager worker ended abnormally");
            }
        }
        info!(workers = count, "Job manager stopped");
    }

    async fn active_job(&self, job_id: &str) -> Result<(EngineHandle<JobAction>, Job), JobManagerError> {
        let handle = self
            .engine(job_id)
            .await
            .ok_or_else(|| JobManagerError::JobNotFound(job_id.to_string()))?;
        let job = handle
            .snapshot()
            .reference
            .and_then(|r| r.entity().as_job().cloned())
            .ok_or_else(|| JobManagerError::JobNotFound(job_id.to_string()))?;
        if job.state() != JobState::Accepted {
            return Err(JobManagerError::JobNotActive(job_id.to_string()));
        }
        Ok((handle, job))
    }

    async fn engine_of_task(&self, task_id: &str) -> Option<EngineHandle<JobAction>> {
        engine_of_task(&self.engines, task_id).await
    }

    async fn start_engine(
        &self,
        reference: JobHolder,
        running: JobHolder,
        store: JobHolder,
    ) -> Result<EngineHandle<JobAction>, JobManagerError> {
        let job_id = reference.id().to_string();
        let is_service = reference.entity().as_job().is_some_and(Job::is_service);
        let resolver = if is_service {
            Arc::clone(&self.service_resolver)
        } else {
            Arc::clone(&self.batch_resolver)
        };
        let events = EventSink::new(job_id.clone(), self.config.reconciler.event_channel_capacity)
            .with_aggregate(self.events.clone());

        let engine = ReconciliationEngine::new(reference, running, store, resolver, Arc::clone(&self.context), events)
            .map_err(|source| JobManagerError::Engine {
                job_id: job_id.clone(),
                source,
            })?
            .with_action_timeout(Duration::from_millis(self.config.reconciler.action_timeout_ms.max(1)));
        let handle = engine.handle();
        self.engines.write().await.insert(job_id.clone(), handle.clone());

        let engines = Arc::clone(&self.engines);
        let store_retry = Arc::clone(&self.store_retry);
        let rate_limiter = Arc::clone(&self.rate_limiter);
        let shutdown = self.shutdown.subscribe();
        let interval = Duration::from_millis(self.config.reconciler.cycle_interval_ms.max(1));
        let mut workers = self.workers.lock().await;
        reap_finished(&mut workers);
        workers.spawn(async move {
            let state = engine.run(shutdown, interval).await;
            if state == EngineState::Removed {
                engines.write().await.remove(&job_id);
                store_retry.release(&job_id);
                rate_limiter.release(&job_id);
                info!(job_id = %job_id, "Job removed");
            }
        });
        Ok(handle)
    }

    fn spawn_status_router(&self, workers: &mut JoinSet<()>) {
        let mut reports = self.context.vm.status_updates();
        let mut shutdown = self.shutdown.subscribe();
        let engines = Arc::clone(&self.engines);
        let clock = Arc::clone(&self.context.clock);
        workers.spawn(async move {
            loop {
                tokio::select! {
                    received = reports.recv() => match received {
                        Ok(report) => {
                            let now = clock.now_ms();
                            route_status_report(&engines, report, now).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Status router lagged behind agent reports");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Status router stopped");
        });
    }

    fn spawn_metrics_recorder(&self, workers: &mut JoinSet<()>) {
        let mut events = self.events.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let metrics = Arc::clone(&self.task_metrics);
        workers.spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => record_task_metrics(&metrics, &event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Metrics recorder lagged behind events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.config)
            .field("task_metrics", &self.task_metrics)
            .finish_non_exhaustive()
    }
}

fn validate_capacity(job_id: &str, capacity: &Capacity) -> Result<(), JobManagerError> {
    if capacity.is_valid() {
        return Ok(());
    }
    Err(JobManagerError::InvalidCapacity {
        job_id: job_id.to_string(),
        reason: format!(
            "expected min <= desired <= max, got {}/{}/{}",
            capacity.min, capacity.desired, capacity.max
        ),
    })
}

async fn engine_of_task(engines: &JobEngines, task_id: &str) -> Option<EngineHandle<JobAction>> {
    engines
        .read()
        .await
        .values()
        .find(|handle| {
            handle
                .snapshot()
                .reference
                .is_some_and(|r| r.find_child(task_id).is_some())
        })
        .cloned()
}

/// Collect the results of workers that already ended.
fn reap_finished(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.try_join_next() {
        if let Err(e) = result {
            warn!(error = %e, "Job manager worker ended abnormally");
        }
    }
}

/// Queue the report on the owning engine. The router never waits for the
/// engine to apply it, so a stalled job cannot hold up reports of other jobs.
async fn route_status_report(engines: &JobEngines, report: TaskStatusReport, now_ms: u64) {
    let Some(handle) = engine_of_task(engines, &report.task_id).await else {
        debug!(task_id = %report.task_id, state = %report.state, "Status report for unknown task ignored");
        return;
    };
    let job_id = handle.job_id().to_string();
    let task_id = report.task_id.clone();
    let outcome = handle.apply_change_with(move |reference| status_update_action(reference, &report, now_ms));
    tokio::spawn(async move {
        if let Err(e) = outcome.await {
            warn!(job_id = %job_id, task_id = %task_id, error = %e, "Status update not applied");
        }
    });
}

/// The change an agent report causes, if any.
///
/// Reports about finished tasks, repeated states and states the task already
/// moved past are dropped. A task being killed keeps the reason of its kill
/// when it finishes.
pub fn status_update_action(reference: &JobHolder, report: &TaskStatusReport, now_ms: u64) -> Option<JobChangeAction> {
    let task = reference.find_child(&report.task_id)?.entity().as_task()?;
    let current = task.state();
    if current == TaskState::Finished || report.state <= current {
        return None;
    }
    // Only Finished follows KillInitiated
    let status = if current == TaskState::KillInitiated {
        TaskStatus::new(
            TaskState::Finished,
            task.status.reason_code.clone(),
            task.status.reason_message.clone(),
            now_ms,
        )
    } else {
        TaskStatus::new(report.state, report.reason_code.clone(), report.message.clone(), now_ms)
    };
    Some(JobAction::task_status_update(task.with_status(status)))
}

fn record_task_metrics(metrics: &FsmMetrics<TaskState>, event: &ReconcilerEvent<JobEntity>) {
    match event.event_type {
        ReconcilerEventType::ModelInitial => {
            if let Some(root) = &event.current {
                for child in root.children() {
                    if let Some(task) = child.entity().as_task() {
                        metrics.record(&task.id, task.state());
                    }
                }
            }
        }
        ReconcilerEventType::ModelUpdated if event.model == Some(Model::Reference) => {
            match (&event.previous, &event.current) {
                (_, Some(current)) => {
                    if let Some(task) = current.entity().as_task() {
                        metrics.record(&task.id, task.state());
                    }
                }
                (Some(previous), None) => {
                    if previous.entity().as_task().is_some() {
                        metrics.remove(previous.id());
                    }
                }
                (None, None) => {}
            }
        }
        _ => {}
    }
}
