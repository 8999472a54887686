//! In-memory collaborators for the job manager.
//!
//! Used by the `simulate` command and by tests. None of them persist anything
//! beyond the process.

mod capacity;
mod job_store;
mod scheduler;
mod vm_service;

pub use capacity::{InMemorySlaService, LoggingCapacityAllocator};
pub use job_store::InMemoryJobStore;
pub use scheduler::InMemoryScheduler;
pub use vm_service::SimulatedVmService;
