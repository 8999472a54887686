use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::domain::errors::CapacityError;
use crate::domain::ports::{ApplicationSla, ApplicationSlaManagementService, CapacityAllocationService, Tier};

/// SLA table keyed by capacity group.
#[derive(Debug, Default)]
pub struct InMemorySlaService {
    slas: RwLock<BTreeMap<String, ApplicationSla>>,
}

impl InMemorySlaService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slas(slas: Vec<ApplicationSla>) -> Self {
        let service = Self::new();
        for sla in slas {
            service.upsert(sla);
        }
        service
    }

    pub fn upsert(&self, sla: ApplicationSla) {
        self.slas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sla.capacity_group.clone(), sla);
    }
}

impl ApplicationSlaManagementService for InMemorySlaService {
    fn get_application_sla(&self, capacity_group: &str) -> Option<ApplicationSla> {
        self.slas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(capacity_group)
            .cloned()
    }

    fn find_all(&self) -> Vec<ApplicationSla> {
        self.slas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Allocator that only logs and records what it was asked to do.
#[derive(Debug, Default)]
pub struct LoggingCapacityAllocator {
    delay: Option<Duration>,
    fail: AtomicBool,
    allocations: Mutex<Vec<(Tier, u32)>>,
}

impl LoggingCapacityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose every call takes `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Completed allocations in completion order.
    pub fn allocations(&self) -> Vec<(Tier, u32)> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl CapacityAllocationService for LoggingCapacityAllocator {
    async fn allocate(&self, tier: Tier, min_size: u32) -> Result<(), CapacityError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CapacityError::Allocation {
                tier: tier.to_string(),
                reason: "allocation disabled".to_string(),
            });
        }
        info!(%tier, min_size, "Capacity allocation requested");
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((tier, min_size));
        Ok(())
    }
}
