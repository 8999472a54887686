//! Job domain model.
//!
//! A job is the root entity of every reconciliation tree. Its descriptor
//! carries either a batch extension (fixed number of slots) or a service
//! extension (elastic capacity).

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job accepted and being reconciled toward its desired size
    #[default]
    Accepted,
    /// Job kill requested; its tasks are being terminated
    KillInitiated,
    /// Job has no more work; waiting for store removal
    Finished,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::KillInitiated => "kill_initiated",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub reason_code: String,
    pub reason_message: String,
    /// Wall clock time (ms since epoch) the state was entered
    pub timestamp_ms: u64,
}

impl JobStatus {
    pub fn new(state: JobState, reason_code: impl Into<String>, reason_message: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            state,
            reason_code: reason_code.into(),
            reason_message: reason_message.into(),
            timestamp_ms,
        }
    }
}

/// Number of times a finished task may be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retries: 3 }
    }
}

/// Service job capacity. Invariant: `min <= desired <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub min: u32,
    pub desired: u32,
    pub max: u32,
}

impl Capacity {
    pub fn new(min: u32, desired: u32, max: u32) -> Self {
        Self { min, desired, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.desired && self.desired <= self.max
    }

    /// Capacity with the desired size lowered by one, pulling `min` along.
    pub fn shrunk_by_one(&self) -> Self {
        let desired = self.desired.saturating_sub(1);
        Self {
            min: self.min.min(desired),
            desired,
            max: self.max,
        }
    }
}

/// Batch job extension: a fixed number of task slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJobExt {
    pub size: u32,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// Service job extension: an elastic set of long running tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceJobExt {
    pub capacity: Capacity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

const fn default_enabled() -> bool {
    true
}

/// Job type specific part of the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobExt {
    Batch(BatchJobExt),
    Service(ServiceJobExt),
}

/// What the user submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub application_name: String,
    pub capacity_group: String,
    pub ext: JobExt,
}

/// A job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub version: u64,
    pub status: JobStatus,
    pub descriptor: JobDescriptor,
}

impl Job {
    /// Create an accepted job.
    pub fn new(id: impl Into<String>, descriptor: JobDescriptor, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            version: 0,
            status: JobStatus::new(JobState::Accepted, "normal", "Job accepted", now_ms),
            descriptor,
        }
    }

    /// Convenience constructor for a service job.
    pub fn service(
        id: impl Into<String>,
        application_name: impl Into<String>,
        capacity: Capacity,
        retry_policy: RetryPolicy,
        now_ms: u64,
    ) -> Self {
        let application_name = application_name.into();
        Self::new(
            id,
            JobDescriptor {
                capacity_group: application_name.clone(),
                application_name,
                ext: JobExt::Service(ServiceJobExt {
                    capacity,
                    enabled: true,
                    retry_policy,
                }),
            },
            now_ms,
        )
    }

    /// Convenience constructor for a batch job.
    pub fn batch(
        id: impl Into<String>,
        application_name: impl Into<String>,
        size: u32,
        retry_policy: RetryPolicy,
        now_ms: u64,
    ) -> Self {
        let application_name = application_name.into();
        Self::new(
            id,
            JobDescriptor {
                capacity_group: application_name.clone(),
                application_name,
                ext: JobExt::Batch(BatchJobExt { size, retry_policy }),
            },
            now_ms,
        )
    }

    pub fn state(&self) -> JobState {
        self.status.state
    }

    pub fn is_service(&self) -> bool {
        matches!(self.descriptor.ext, JobExt::Service(_))
    }

    /// Number of tasks the job should have.
    pub fn required_size(&self) -> u32 {
        match &self.descriptor.ext {
            JobExt::Batch(ext) => ext.size,
            JobExt::Service(ext) if ext.enabled => ext.capacity.desired,
            JobExt::Service(_) => 0,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match &self.descriptor.ext {
            JobExt::Batch(ext) => ext.retry_policy,
            JobExt::Service(ext) => ext.retry_policy,
        }
    }

    pub fn capacity(&self) -> Option<Capacity> {
        match &self.descriptor.ext {
            JobExt::Service(ext) => Some(ext.capacity),
            JobExt::Batch(_) => None,
        }
    }

    /// New version of this job with a different status.
    #[must_use]
    pub fn with_status(&self, status: JobStatus) -> Self {
        Self {
            version: self.version + 1,
            status,
            ..self.clone()
        }
    }

    /// New version of this job with a different service capacity.
    /// Batch jobs are returned unchanged.
    #[must_use]
    pub fn with_capacity(&self, capacity: Capacity) -> Self {
        match &self.descriptor.ext {
            JobExt::Service(ext) => {
                let mut descriptor = self.descriptor.clone();
                descriptor.ext = JobExt::Service(ServiceJobExt {
                    capacity,
                    ..ext.clone()
                });
                Self {
                    version: self.version + 1,
                    descriptor,
                    ..self.clone()
                }
            }
            JobExt::Batch(_) => self.clone(),
        }
    }
}
