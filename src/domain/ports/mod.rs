//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines the interfaces of the collaborators the job manager
//! depends on but does not implement:
//! - JobStore: durable job and task storage
//! - SchedulingService: task placement
//! - VirtualMachineMasterService: agent launch/kill and status reports
//! - ApplicationSlaManagementService / CapacityAllocationService: capacity
//! - Clock: time source
//!
//! In-memory implementations live in `adapters::memory`.

pub mod capacity;
pub mod clock;
pub mod job_store;
pub mod scheduling;
pub mod vm_service;

pub use capacity::{ApplicationSla, ApplicationSlaManagementService, CapacityAllocationService, Tier};
pub use clock::{Clock, SystemClock, TestClock};
pub use job_store::{JobStore, StoredJob};
pub use scheduling::SchedulingService;
pub use vm_service::{TaskStatusReport, VirtualMachineLease, VirtualMachineMasterService};
