//! Common test utilities for integration tests
//!
//! Fixtures that wire the job manager pieces to in-memory collaborators and a
//! manually advanced clock.

#![allow(dead_code)]

use std::sync::Arc;

use convoy::adapters::memory::{InMemoryJobStore, InMemoryScheduler, InMemorySlaService, SimulatedVmService};
use convoy::domain::models::{Capacity, Job, RateLimitConfig, RetryConfig, RetryPolicy, Task, TaskState, TaskStatus, TaskTimeoutConfig};
use convoy::domain::models::reason;
use convoy::domain::ports::TestClock;
use convoy::services::interceptors::{RateLimiterInterceptor, RetryActionInterceptor};
use convoy::services::jobmanager::{BatchDifferenceResolver, JobManagerContext, ServiceDifferenceResolver};

pub const JOB_ID: &str = "job-1";

/// Collaborators of one test, kept so tests can inspect and steer them.
pub struct Fixture {
    pub clock: Arc<TestClock>,
    pub store: Arc<InMemoryJobStore>,
    pub vm: Arc<SimulatedVmService>,
    pub sla: Arc<InMemorySlaService>,
    pub store_retry: Arc<RetryActionInterceptor>,
    pub rate_limiter: Arc<RateLimiterInterceptor>,
    pub context: JobManagerContext,
}

impl Fixture {
    pub fn new(bucket_size: u64) -> Self {
        let clock = Arc::new(TestClock::new(1_000));
        let store = Arc::new(InMemoryJobStore::new());
        let vm = Arc::new(SimulatedVmService::new(256));
        let scheduler = Arc::new(InMemoryScheduler::new(vm.clone(), 4));
        let sla = Arc::new(InMemorySlaService::new());
        let store_retry = Arc::new(RetryActionInterceptor::new(
            "storeWrite",
            &RetryConfig::default(),
            clock.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiterInterceptor::new(
            "newTask",
            &RateLimitConfig {
                bucket_size,
                refill_interval_ms: 100,
            },
            clock.clone(),
        ));
        let context = JobManagerContext {
            store: store.clone(),
            scheduler,
            vm: vm.clone(),
            clock: clock.clone(),
        };
        Self {
            clock,
            store,
            vm,
            sla,
            store_retry,
            rate_limiter,
            context,
        }
    }

    pub fn service_resolver(&self) -> ServiceDifferenceResolver {
        ServiceDifferenceResolver::new(
            self.sla.clone(),
            self.store_retry.clone(),
            self.rate_limiter.clone(),
            TaskTimeoutConfig::default(),
            self.clock.clone(),
        )
    }

    pub fn batch_resolver(&self) -> BatchDifferenceResolver {
        BatchDifferenceResolver::new(
            self.store_retry.clone(),
            self.rate_limiter.clone(),
            TaskTimeoutConfig::default(),
            self.clock.clone(),
        )
    }
}

pub fn service_job(desired: u32, retries: u32) -> Job {
    Job::service(JOB_ID, "app", Capacity::new(0, desired, desired.max(10)), RetryPolicy { retries }, 0)
}

pub fn accepted_tasks(count: usize) -> Vec<Task> {
    (0..count).map(|_| Task::new(JOB_ID, None, 0)).collect()
}

pub fn in_state(task: &Task, state: TaskState, reason_code: &str) -> Task {
    task.with_status(TaskStatus::new(state, reason_code, "", 0))
}

pub fn started(task: &Task) -> Task {
    in_state(task, TaskState::Started, reason::NORMAL)
}

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll `predicate` every 10ms until it holds or `timeout_ms` elapses.
pub async fn wait_for<F>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    predicate()
}
