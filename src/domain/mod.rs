//! Domain layer for the Convoy job manager
//!
//! Jobs, tasks, configuration and the ports of external collaborators.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{CapacityError, SchedulingError, StoreError, VmError};
