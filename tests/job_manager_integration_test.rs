//! Job manager end to end: real engine loops, simulated agents.

mod common;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use convoy::adapters::memory::{InMemoryJobStore, InMemoryScheduler, InMemorySlaService, SimulatedVmService};
use convoy::domain::models::{reason, Capacity, Config, Job, JobState, RetryPolicy, Task, TaskState, TaskStatus};
use convoy::domain::ports::{JobStore, SystemClock, VirtualMachineMasterService};
use convoy::services::jobmanager::{JobManager, JobManagerContext, JobManagerError};
use convoy::services::metrics::{MetricsRegistry, TASK_CURRENT_STATE};
use convoy::services::reconciler::ActionError;

struct Harness {
    manager: JobManager,
    store: Arc<InMemoryJobStore>,
    vm: Arc<SimulatedVmService>,
    metrics: Arc<MetricsRegistry>,
}

fn config() -> Config {
    let mut config = Config::default();
    config.reconciler.cycle_interval_ms = 10;
    config
}

async fn harness() -> Harness {
    harness_with(config()).await
}

async fn harness_with(config: Config) -> Harness {
    common::setup_test_logging();
    let store = Arc::new(InMemoryJobStore::new());
    let vm = Arc::new(SimulatedVmService::new(1024));
    let scheduler = Arc::new(InMemoryScheduler::new(vm.clone(), 4));
    let metrics = Arc::new(MetricsRegistry::new());
    let context = JobManagerContext {
        store: store.clone(),
        scheduler,
        vm: vm.clone(),
        clock: Arc::new(SystemClock),
    };
    let manager = JobManager::new(config, context, Arc::new(InMemorySlaService::new()), metrics.clone());
    manager.start().await;
    Harness {
        manager,
        store,
        vm,
        metrics,
    }
}

/// Poll `check` every 10ms for up to five seconds.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn web_job(desired: u32) -> Job {
    Job::service("web", "web", Capacity::new(0, desired, 10), RetryPolicy { retries: 3 }, 0)
}

async fn tasks_in(manager: &JobManager, job_id: &str, state: TaskState) -> usize {
    manager
        .reference_view(job_id)
        .await
        .map_or(0, |(_, tasks)| tasks.iter().filter(|t| t.state() == state).count())
}

async fn task_count(manager: &JobManager, job_id: &str) -> usize {
    manager.reference_view(job_id).await.map_or(0, |(_, tasks)| tasks.len())
}

#[tokio::test]
async fn test_service_job_reaches_desired_size() {
    let h = harness().await;
    h.manager.create_job(web_job(3)).await.unwrap();

    assert!(eventually(|| async { tasks_in(&h.manager, "web", TaskState::Started).await == 3 }).await);
    assert_eq!(h.vm.launched().len(), 3);
    assert!(eventually(|| async { h.store.tasks_of("web").len() == 3 }).await);
    assert!(
        eventually(|| async { h.metrics.gauge(TASK_CURRENT_STATE, &[("state", "started")]) == 3 }).await
    );

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_job_is_rejected() {
    let h = harness().await;
    h.manager.create_job(web_job(1)).await.unwrap();

    let err = h.manager.create_job(web_job(1)).await.unwrap_err();
    assert!(matches!(err, JobManagerError::JobExists(id) if id == "web"));

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_invalid_capacity_changes_are_rejected() {
    let h = harness().await;
    h.manager.create_job(web_job(1)).await.unwrap();
    h.manager
        .create_job(Job::batch("report", "report", 1, RetryPolicy::default(), 0))
        .await
        .unwrap();

    let err = h.manager.update_capacity("web", Capacity::new(3, 2, 4)).await.unwrap_err();
    assert!(matches!(err, JobManagerError::InvalidCapacity { .. }));
    let err = h.manager.update_capacity("report", Capacity::new(0, 2, 4)).await.unwrap_err();
    assert!(matches!(err, JobManagerError::InvalidCapacity { .. }));
    let err = h.manager.update_capacity("nope", Capacity::new(0, 2, 4)).await.unwrap_err();
    assert!(matches!(err, JobManagerError::JobNotFound(_)));

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_scale_down_removes_excess_tasks() {
    let h = harness().await;
    h.manager.create_job(web_job(3)).await.unwrap();
    assert!(eventually(|| async { tasks_in(&h.manager, "web", TaskState::Started).await == 3 }).await);

    h.manager.update_capacity("web", Capacity::new(0, 1, 10)).await.unwrap();

    assert!(eventually(|| async { task_count(&h.manager, "web").await == 1 }).await);
    assert_eq!(h.vm.killed().len(), 2);
    let (job, tasks) = h.manager.reference_view("web").await.unwrap();
    assert_eq!(job.required_size(), 1);
    assert_eq!(tasks[0].state(), TaskState::Started);
    assert!(eventually(|| async { h.store.tasks_of("web").len() == 1 }).await);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_kill_task_with_shrink_is_not_replaced() {
    let h = harness().await;
    h.manager.create_job(web_job(2)).await.unwrap();
    assert!(eventually(|| async { tasks_in(&h.manager, "web", TaskState::Started).await == 2 }).await);
    let (_, tasks) = h.manager.reference_view("web").await.unwrap();
    let victim = tasks[0].id.clone();

    h.manager.kill_task(&victim, true).await.unwrap();

    assert!(eventually(|| async { task_count(&h.manager, "web").await == 1 }).await);
    let (job, tasks) = h.manager.reference_view("web").await.unwrap();
    assert_eq!(job.required_size(), 1);
    assert!(tasks.iter().all(|t| t.id != victim));
    assert_eq!(h.vm.launched().len(), 2, "no replacement was launched");

    let err = h.manager.kill_task(&victim, false).await.unwrap_err();
    assert!(matches!(err, JobManagerError::TaskNotFound(_)));

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_task_is_replaced() {
    let h = harness().await;
    h.manager.create_job(web_job(1)).await.unwrap();
    assert!(eventually(|| async { tasks_in(&h.manager, "web", TaskState::Started).await == 1 }).await);
    let (_, tasks) = h.manager.reference_view("web").await.unwrap();
    let original = tasks[0].clone();

    h.vm.finish(&original.id, reason::FAILED, "Crashed");

    let replaced = eventually(|| async {
        h.manager.reference_view("web").await.is_some_and(|(_, tasks)| {
            tasks.len() == 1 && tasks[0].resubmit_of.as_deref() == Some(original.id.as_str())
        })
    })
    .await;
    assert!(replaced);
    let (_, tasks) = h.manager.reference_view("web").await.unwrap();
    assert_eq!(tasks[0].original_id, original.original_id);
    assert_eq!(tasks[0].resubmit_number, 1);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_killed_job_is_removed() {
    let h = harness().await;
    h.manager.create_job(web_job(2)).await.unwrap();
    assert!(eventually(|| async { tasks_in(&h.manager, "web", TaskState::Started).await == 2 }).await);

    h.manager.kill_job("web").await.unwrap();

    assert!(eventually(|| async { h.manager.job_ids().await.is_empty() }).await);
    assert_eq!(h.vm.killed().len(), 2);
    assert!(h.store.job("web").is_none());
    assert!(h.store.tasks_of("web").is_empty());
    assert!(matches!(
        h.manager.kill_job("web").await,
        Err(JobManagerError::JobNotFound(_))
    ));

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_batch_job_completes_when_work_is_done() {
    let h = harness().await;
    let mut reports = h.vm.status_updates();
    let vm = h.vm.clone();
    let agents = tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            if report.state == TaskState::Started {
                vm.finish(&report.task_id, reason::NORMAL, "Done");
            }
        }
    });

    h.manager
        .create_job(Job::batch("report", "report", 2, RetryPolicy::default(), 0))
        .await
        .unwrap();

    assert!(eventually(|| async { h.manager.job_ids().await.is_empty() }).await);
    assert_eq!(h.vm.launched().len(), 2);
    assert!(h.store.job("report").is_none());

    h.manager.shutdown().await;
    agents.abort();
}

#[tokio::test]
async fn test_bootstrap_resumes_stored_jobs() {
    let h = harness().await;
    let job = web_job(2);
    let running = Task::new("web", None, 0).with_status(TaskStatus::new(TaskState::Started, reason::NORMAL, "", 0));
    let accepted = Task::new("web", None, 0);
    h.store.write_job(&job).await.unwrap();
    h.store.write_task(&running).await.unwrap();
    h.store.write_task(&accepted).await.unwrap();

    assert_eq!(h.manager.bootstrap().await.unwrap(), 1);
    assert_eq!(h.manager.bootstrap().await.unwrap(), 0, "already loaded jobs are skipped");

    // Only the task that never left Accepted gets launched
    assert!(eventually(|| async { h.vm.launched() == vec![accepted.id.clone()] }).await);
    let (job, _) = h.manager.reference_view("web").await.unwrap();
    assert_eq!(job.state(), JobState::Accepted);

    h.manager.shutdown().await;
}

fn single_task_job(id: &str) -> Job {
    Job::service(id, id, Capacity::new(0, 1, 10), RetryPolicy { retries: 3 }, 0)
}

async fn only_task(manager: &JobManager, job_id: &str) -> Task {
    let (_, tasks) = manager.reference_view(job_id).await.unwrap();
    tasks[0].clone()
}

async fn replaced(manager: &JobManager, job_id: &str, original: &str) -> bool {
    manager
        .reference_view(job_id)
        .await
        .is_some_and(|(_, tasks)| tasks.iter().any(|t| t.resubmit_of.as_deref() == Some(original)))
}

#[tokio::test]
async fn test_stalled_job_does_not_hold_up_reports_of_other_jobs() {
    let mut config = config();
    config.reconciler.action_timeout_ms = 60_000;
    let h = harness_with(config).await;
    h.manager.create_job(single_task_job("slow")).await.unwrap();
    h.manager.create_job(single_task_job("fast")).await.unwrap();
    for job_id in ["slow", "fast"] {
        assert!(eventually(|| async { tasks_in(&h.manager, job_id, TaskState::Started).await == 1 }).await);
    }
    let slow_task = only_task(&h.manager, "slow").await;
    let fast_task = only_task(&h.manager, "fast").await;

    // The slow engine is now stuck inside a store write it cannot finish
    h.store.stall_writes("slow");
    let pending = tokio::time::timeout(
        Duration::from_millis(200),
        h.manager.update_capacity("slow", Capacity::new(0, 2, 10)),
    )
    .await;
    assert!(pending.is_err(), "the capacity change should still be in flight");

    // Its report is queued first, and must not delay the other job's
    h.vm.finish(&slow_task.id, reason::FAILED, "Crashed");
    h.vm.finish(&fast_task.id, reason::FAILED, "Crashed");

    assert!(eventually(|| async { replaced(&h.manager, "fast", &fast_task.id).await }).await);
    assert!(!replaced(&h.manager, "slow", &slow_task.id).await);

    h.store.resume_writes("slow");
    assert!(eventually(|| async { replaced(&h.manager, "slow", &slow_task.id).await }).await);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_hung_store_write_fails_the_action_and_the_job_recovers() {
    let mut config = config();
    config.reconciler.action_timeout_ms = 200;
    let h = harness_with(config).await;
    h.manager.create_job(single_task_job("slow")).await.unwrap();
    h.manager.create_job(single_task_job("fast")).await.unwrap();
    assert!(eventually(|| async { tasks_in(&h.manager, "slow", TaskState::Started).await == 1 }).await);

    h.store.stall_writes("slow");
    let err = h
        .manager
        .update_capacity("slow", Capacity::new(0, 2, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, JobManagerError::Action(ActionError::TimedOut(200))), "{err}");
    let (job, _) = h.manager.reference_view("slow").await.unwrap();
    assert_eq!(job.required_size(), 1);

    // The other job keeps scaling while the first is stalled
    h.manager.update_capacity("fast", Capacity::new(0, 2, 10)).await.unwrap();
    assert!(eventually(|| async { tasks_in(&h.manager, "fast", TaskState::Started).await == 2 }).await);

    h.store.resume_writes("slow");
    h.manager.update_capacity("slow", Capacity::new(0, 2, 10)).await.unwrap();
    assert!(eventually(|| async { tasks_in(&h.manager, "slow", TaskState::Started).await == 2 }).await);

    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_retired_engine_workers_are_reaped() {
    let h = harness().await;
    let background = h.manager.active_workers().await;
    h.manager.create_job(web_job(1)).await.unwrap();
    assert_eq!(h.manager.active_workers().await, background + 1);

    h.manager.kill_job("web").await.unwrap();

    assert!(eventually(|| async { h.manager.job_ids().await.is_empty() }).await);
    assert!(eventually(|| async { h.manager.active_workers().await == background }).await);

    h.manager.shutdown().await;
}
