pub mod config;
pub mod job;
pub mod task;

pub use config::{
    CapacityConfig, Config, LoggingConfig, RateLimitConfig, ReconcilerConfig, RetryConfig,
    TaskTimeoutConfig,
};
pub use job::{
    BatchJobExt, Capacity, Job, JobDescriptor, JobExt, JobState, JobStatus, RetryPolicy,
    ServiceJobExt,
};
pub use task::{reason, Task, TaskState, TaskStatus};
