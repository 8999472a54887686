//! Periodic capacity refresh.
//!
//! Sums the SLA instance counts of every capacity group per tier and asks the
//! allocator to size each tier's pool accordingly. A refresh requested while
//! another is running joins the running one instead of starting a second.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::errors::CapacityError;
use crate::domain::models::CapacityConfig;
use crate::domain::ports::{ApplicationSlaManagementService, CapacityAllocationService, Tier};
use crate::services::metrics::MetricsRegistry;

/// Counter of refresh outcomes, tagged `outcome`.
pub const CAPACITY_REFRESH: &str = "convoy.capacity.refresh";

type RefreshFuture = Shared<BoxFuture<'static, Result<(), CapacityError>>>;

struct Inner {
    sla: Arc<dyn ApplicationSlaManagementService>,
    allocator: Arc<dyn CapacityAllocationService>,
    metrics: Arc<MetricsRegistry>,
    config: CapacityConfig,
    in_flight: Mutex<Option<RefreshFuture>>,
}

#[derive(Clone)]
pub struct CapacityMonitoringService {
    inner: Arc<Inner>,
}

impl CapacityMonitoringService {
    pub fn new(
        sla: Arc<dyn ApplicationSlaManagementService>,
        allocator: Arc<dyn CapacityAllocationService>,
        metrics: Arc<MetricsRegistry>,
        config: CapacityConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sla,
                allocator,
                metrics,
                config,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Instance totals per tier. Both tiers are always present.
    pub fn tier_totals(&self) -> BTreeMap<Tier, u32> {
        let mut totals: BTreeMap<Tier, u32> = BTreeMap::from([(Tier::Critical, 0), (Tier::Flex, 0)]);
        for sla in self.inner.sla.find_all() {
            let total = totals.entry(sla.tier).or_insert(0);
            *total = total.saturating_add(sla.instance_count);
        }
        totals
    }

    /// Run a refresh, or wait for the one already running.
    pub async fn refresh(&self) -> Result<(), CapacityError> {
        let refresh = {
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.as_ref() {
                Some(running) => {
                    debug!("Joining capacity refresh in progress");
                    running.clone()
                }
                None => {
                    let refresh = Self::run_refresh(self.clone()).boxed().shared();
                    *in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };

        let outcome = refresh.await;

        let mut in_flight = self.inner.in_flight.lock().await;
        if in_flight.as_ref().is_some_and(|running| running.peek().is_some()) {
            *in_flight = None;
        }
        outcome
    }

    async fn run_refresh(self) -> Result<(), CapacityError> {
        let totals = self.tier_totals();
        let timeout_ms = self.inner.config.update_timeout_ms;
        let allocations = totals
            .iter()
            .map(|(tier, total)| self.inner.allocator.allocate(*tier, *total));

        let outcome = match tokio::time::timeout(Duration::from_millis(timeout_ms), join_all(allocations)).await {
            Ok(results) => results.into_iter().collect::<Result<Vec<()>, _>>().map(|_| ()),
            Err(_) => Err(CapacityError::Timeout(timeout_ms)),
        };

        let tag = match &outcome {
            Ok(()) => {
                info!(tiers = totals.len(), "Capacity refreshed");
                "success"
            }
            Err(CapacityError::Timeout(_)) => {
                warn!(timeout_ms, "Capacity refresh timed out");
                "timeout"
            }
            Err(e) => {
                warn!(error = %e, "Capacity refresh failed");
                "failure"
            }
        };
        self.inner.metrics.increment_counter(CAPACITY_REFRESH, &[("outcome", tag)]);
        outcome
    }

    /// Refresh periodically until `shutdown` flips to true.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = self.clone();
        let interval = Duration::from_millis(self.inner.config.refresh_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Outcome already logged and counted
                        let _ = service.refresh().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Capacity monitor stopped");
        })
    }
}

impl std::fmt::Debug for CapacityMonitoringService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityMonitoringService")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
