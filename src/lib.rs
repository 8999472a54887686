//! Convoy - job reconciliation core for a container orchestrator
//!
//! Convoy keeps every job's tasks converging on what the user asked for. Each
//! job is owned by a reconciliation engine that compares three views of the
//! job (reference, running and store), runs the change actions a difference
//! resolver derives from them and publishes every step as an event.
//!
//! # Architecture
//!
//! The crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): Jobs, tasks, configuration and ports
//! - **Service Layer** (`services`): Reconciliation framework, interceptors,
//!   job manager, capacity monitoring and metrics
//! - **Adapters** (`adapters`): In-memory implementations of the ports
//! - **Infrastructure Layer** (`infrastructure`): Configuration and logging
//! - **CLI Layer** (`cli`): Command-line interface
//!
//! # Example
//!
//! ```ignore
//! use convoy::services::JobManager;
//!
//! let manager = JobManager::new(config, context, sla, metrics);
//! manager.start().await;
//! manager.create_job(job).await?;
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::models::{Capacity, Config, Job, JobState, RetryPolicy, Task, TaskState};
pub use domain::ports::{
    Clock, JobStore, SchedulingService, SystemClock, TaskStatusReport, VirtualMachineMasterService,
};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{CapacityMonitoringService, JobManager, JobManagerError, MetricsRegistry};
