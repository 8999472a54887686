use crate::domain::errors::CapacityError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capacity tier of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Critical,
    Flex,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Flex => "flex",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service level agreement of a capacity group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSla {
    pub capacity_group: String,
    pub tier: Tier,
    /// Maximum number of tasks the group may run
    pub instance_count: u32,
}

/// Per capacity group limits. Lookups are synchronous because difference
/// resolvers consult them while computing a cycle.
pub trait ApplicationSlaManagementService: Send + Sync {
    fn get_application_sla(&self, capacity_group: &str) -> Option<ApplicationSla>;

    fn find_all(&self) -> Vec<ApplicationSla>;
}

/// Instance pool sizing, used by the capacity refresh.
#[async_trait]
pub trait CapacityAllocationService: Send + Sync {
    /// Ensure the pool of `tier` holds at least `min_size` instances
    async fn allocate(&self, tier: Tier, min_size: u32) -> Result<(), CapacityError>;
}
