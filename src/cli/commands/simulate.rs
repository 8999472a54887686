//! `convoy simulate`: drive the job manager against in-memory collaborators.
//!
//! Creates one service job and one batch job, lets simulated agents run their
//! tasks, optionally fails, rescales or kills along the way, and streams every
//! reconciler event to stdout. A summary of the final jobs and metrics closes
//! the run.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::adapters::memory::{
    InMemoryJobStore, InMemoryScheduler, InMemorySlaService, LoggingCapacityAllocator, SimulatedVmService,
};
use crate::cli::output::{list_table, output, render_list, CommandOutput};
use crate::domain::models::{reason, Capacity, Config, Job, RetryPolicy, TaskState};
use crate::domain::ports::{ApplicationSla, Clock, SystemClock, Tier, VirtualMachineMasterService};
use crate::services::jobmanager::{JobEntity, JobManager, JobManagerContext};
use crate::services::metrics::{MetricSample, MetricsRegistry};
use crate::services::{CapacityMonitoringService, ReconcilerEvent};

const SERVICE_JOB_ID: &str = "web";
const BATCH_JOB_ID: &str = "report";
const CAPACITY_GROUP: &str = "default";

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Desired size of the service job
    #[arg(long, default_value = "3")]
    pub service_size: u32,

    /// Number of slots of the batch job
    #[arg(long, default_value = "2")]
    pub batch_size: u32,

    /// Replacements allowed per task
    #[arg(long, default_value = "3")]
    pub retries: u32,

    /// Number of service tasks that fail right after starting
    #[arg(long, default_value = "0")]
    pub fail_tasks: u32,

    /// Rescale the service job to this size halfway through the run
    #[arg(long)]
    pub scale_to: Option<u32>,

    /// Kill the service job before the run ends
    #[arg(long)]
    pub kill: bool,

    /// Length of the run in milliseconds
    #[arg(long, default_value = "2000")]
    pub duration_ms: u64,

    /// Number of simulated agents
    #[arg(long, default_value = "4")]
    pub agents: usize,
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub kind: &'static str,
    pub state: String,
    pub desired: u32,
    pub tasks: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
pub struct SimulationSummary {
    pub events: u64,
    pub jobs: Vec<JobSummary>,
    pub metrics: Vec<MetricSample>,
}

impl CommandOutput for SimulationSummary {
    fn to_human(&self) -> String {
        let mut jobs = list_table(&["job", "kind", "state", "desired", "tasks"]);
        for job in &self.jobs {
            let tasks: Vec<String> = job.tasks.iter().map(|(state, n)| format!("{state}={n}")).collect();
            jobs.add_row(vec![
                job.id.clone(),
                job.kind.to_string(),
                job.state.clone(),
                job.desired.to_string(),
                tasks.join(" "),
            ]);
        }
        let mut metrics = list_table(&["metric", "kind", "value"]);
        for sample in &self.metrics {
            metrics.add_row(vec![
                sample.id.to_string(),
                format!("{:?}", sample.kind).to_lowercase(),
                sample.value.to_string(),
            ]);
        }
        format!(
            "\n{} events published\n\n{}\n\n{}",
            self.events,
            render_list("job", &jobs, self.jobs.len()),
            render_list("metric", &metrics, self.metrics.len())
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: SimulateArgs, config: &Config, json_mode: bool) -> Result<()> {
    let store = Arc::new(InMemoryJobStore::new());
    let vm = Arc::new(SimulatedVmService::new(4096));
    let scheduler = Arc::new(InMemoryScheduler::new(vm.clone(), args.agents));
    let sla = Arc::new(InMemorySlaService::with_slas(vec![ApplicationSla {
        capacity_group: CAPACITY_GROUP.to_string(),
        tier: Tier::Critical,
        instance_count: args.service_size.max(args.scale_to.unwrap_or(0)) + args.batch_size,
    }]));
    let metrics = Arc::new(MetricsRegistry::new());
    let clock = Arc::new(SystemClock);

    let capacity = CapacityMonitoringService::new(
        sla.clone(),
        Arc::new(LoggingCapacityAllocator::new()),
        metrics.clone(),
        config.capacity.clone(),
    );
    capacity.refresh().await.context("Initial capacity refresh failed")?;

    let context = JobManagerContext {
        store,
        scheduler,
        vm: vm.clone(),
        clock: clock.clone(),
    };
    let manager = JobManager::new(config.clone(), context, sla, metrics.clone());
    manager.start().await;

    let printed = Arc::new(AtomicU64::new(0));
    let (stop, stopped) = watch::channel(false);
    let printer = spawn_event_printer(manager.events(), json_mode, Arc::clone(&printed), stopped);
    let workload = spawn_workload(&vm, args.fail_tasks);

    let now = clock.now_ms();
    let policy = RetryPolicy { retries: args.retries };
    let service_max = args.service_size.max(args.scale_to.unwrap_or(0));
    let mut service = Job::service(
        SERVICE_JOB_ID,
        "simulated-web",
        Capacity::new(0, args.service_size, service_max),
        policy,
        now,
    );
    service.descriptor.capacity_group = CAPACITY_GROUP.to_string();
    let mut batch = Job::batch(BATCH_JOB_ID, "simulated-report", args.batch_size, policy, now);
    batch.descriptor.capacity_group = CAPACITY_GROUP.to_string();

    manager.create_job(service).await?;
    manager.create_job(batch).await?;

    let half = Duration::from_millis(args.duration_ms / 2);
    tokio::time::sleep(half).await;
    if let Some(size) = args.scale_to {
        manager
            .update_capacity(SERVICE_JOB_ID, Capacity::new(0, size, service_max))
            .await?;
    }
    if args.kill {
        tokio::time::sleep(half / 2).await;
        manager.kill_job(SERVICE_JOB_ID).await?;
    }
    tokio::time::sleep(half).await;

    let jobs = summarize_jobs(&manager).await;
    manager.shutdown().await;
    workload.abort();
    stop.send_replace(true);
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "Event printer ended abnormally");
    }

    output(
        &SimulationSummary {
            events: printed.load(Ordering::SeqCst),
            jobs,
            metrics: metrics.snapshot(),
        },
        json_mode,
    );
    Ok(())
}

async fn summarize_jobs(manager: &JobManager) -> Vec<JobSummary> {
    let mut jobs = Vec::new();
    for job_id in [SERVICE_JOB_ID, BATCH_JOB_ID] {
        let summary = match manager.reference_view(job_id).await {
            Some((job, tasks)) => {
                let mut by_state = BTreeMap::new();
                for task in &tasks {
                    *by_state.entry(task.state().to_string()).or_insert(0) += 1;
                }
                JobSummary {
                    id: job.id.clone(),
                    kind: if job.is_service() { "service" } else { "batch" },
                    state: job.state().to_string(),
                    desired: job.required_size(),
                    tasks: by_state,
                }
            }
            None => JobSummary {
                id: job_id.to_string(),
                kind: if job_id == SERVICE_JOB_ID { "service" } else { "batch" },
                state: "removed".to_string(),
                desired: 0,
                tasks: BTreeMap::new(),
            },
        };
        jobs.push(summary);
    }
    jobs
}

/// Print every event until `stopped` flips to true, counting into `printed`.
fn spawn_event_printer(
    mut events: broadcast::Receiver<ReconcilerEvent<JobEntity>>,
    json_mode: bool,
    printed: Arc<AtomicU64>,
    mut stopped: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        printed.fetch_add(1, Ordering::SeqCst);
                        if json_mode {
                            if let Ok(line) = serde_json::to_string(&event) {
                                println!("{line}");
                            }
                        } else {
                            println!("{}", event.to_log_string());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event printer lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Agent side behaviour: batch tasks complete once started, and the first
/// `fail_tasks` service tasks crash once started.
fn spawn_workload(vm: &Arc<SimulatedVmService>, fail_tasks: u32) -> JoinHandle<()> {
    let mut reports = vm.status_updates();
    let vm = Arc::clone(vm);
    let failures_left = AtomicU32::new(fail_tasks);
    tokio::spawn(async move {
        loop {
            let report = match reports.recv().await {
                Ok(report) => report,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            if report.state != TaskState::Started {
                continue;
            }
            if report.task_id.starts_with(&format!("{BATCH_JOB_ID}-")) {
                vm.finish(&report.task_id, reason::NORMAL, "Batch work done");
            } else if failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                vm.finish(&report.task_id, reason::FAILED, "Simulated crash");
            }
        }
    })
}
