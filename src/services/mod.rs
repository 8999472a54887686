//! Service layer: the reconciliation framework, its interceptors, the job
//! manager built on them and the supporting capacity and metrics services.

pub mod capacity_monitor;
pub mod interceptors;
pub mod jobmanager;
pub mod metrics;
pub mod reconciler;

pub use capacity_monitor::CapacityMonitoringService;
pub use jobmanager::{JobManager, JobManagerError};
pub use metrics::{FsmMetrics, MetricsRegistry};
pub use reconciler::{ReconciliationEngine, ReconcilerEvent, ReconcilerEventType};
