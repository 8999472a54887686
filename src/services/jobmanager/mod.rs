//! Job and task reconciliation on top of the generic engine.
//!
//! Jobs come in two flavours. Service jobs keep an elastic number of tasks
//! running; batch jobs run a fixed set of task slots to completion. Each flavour
//! has its own difference resolver, both built from the helpers in
//! [`job_view`].

mod actions;
mod batch_resolver;
mod job_manager;
pub mod job_view;
mod service_resolver;

pub use actions::{job_tree, JobAction, JobChangeAction, JobEntity, JobHolder, JobManagerContext, JobModelUpdate};
pub use batch_resolver::BatchDifferenceResolver;
pub use job_manager::{status_update_action, JobManager, JobManagerError};
pub use service_resolver::ServiceDifferenceResolver;
