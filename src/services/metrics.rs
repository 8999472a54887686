//! In-process metrics registry and the lifecycle-state recorder built on it.
//!
//! Metrics are identified by a name plus a sorted tag set. The registry is an
//! explicit instance handed to whoever records into it; there is no global.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::domain::models::TaskState;

/// Gauge of tasks currently in a state, tagged `state`.
pub const TASK_CURRENT_STATE: &str = "convoy.task.currentState";
/// Counter of transitions into a state, tagged `state`.
pub const TASK_UPDATES: &str = "convoy.task.updates";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MetricId {
    pub name: String,
    pub tags: BTreeMap<String, String>,
}

impl MetricId {
    pub fn new(name: &str, tags: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            tags: tags.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect(),
        }
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.tags.is_empty() {
            let tags: Vec<String> = self.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "{{{}}}", tags.join(","))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// One metric value at the time of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricSample {
    pub id: MetricId,
    pub kind: MetricKind,
    pub value: i64,
}

#[derive(Debug, Default)]
struct Values {
    counters: BTreeMap<MetricId, u64>,
    gauges: BTreeMap<MetricId, i64>,
}

/// Named counters and gauges.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    values: Mutex<Values>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_values<T>(&self, f: impl FnOnce(&mut Values) -> T) -> T {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut values)
    }

    pub fn increment_counter(&self, name: &str, tags: &[(&str, &str)]) {
        let id = MetricId::new(name, tags);
        self.with_values(|v| *v.counters.entry(id).or_insert(0) += 1);
    }

    pub fn add_to_gauge(&self, name: &str, tags: &[(&str, &str)], delta: i64) {
        let id = MetricId::new(name, tags);
        self.with_values(|v| *v.gauges.entry(id).or_insert(0) += delta);
    }

    pub fn counter(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        let id = MetricId::new(name, tags);
        self.with_values(|v| v.counters.get(&id).copied().unwrap_or(0))
    }

    pub fn gauge(&self, name: &str, tags: &[(&str, &str)]) -> i64 {
        let id = MetricId::new(name, tags);
        self.with_values(|v| v.gauges.get(&id).copied().unwrap_or(0))
    }

    /// All metrics sorted by id, counters first.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.with_values(|v| {
            let counters = v.counters.iter().map(|(id, value)| MetricSample {
                id: id.clone(),
                kind: MetricKind::Counter,
                value: i64::try_from(*value).unwrap_or(i64::MAX),
            });
            let gauges = v.gauges.iter().map(|(id, value)| MetricSample {
                id: id.clone(),
                kind: MetricKind::Gauge,
                value: *value,
            });
            counters.chain(gauges).collect()
        })
    }
}

/// A state machine whose states can be recorded by [`FsmMetrics`].
pub trait MetricState: Copy + Eq + Send + Sync + 'static {
    fn metric_tag(&self) -> &'static str;

    fn is_final(&self) -> bool;
}

impl MetricState for TaskState {
    fn metric_tag(&self) -> &'static str {
        self.as_str()
    }

    fn is_final(&self) -> bool {
        self.is_terminal()
    }
}

/// Tracks the current state of every entity of one kind.
///
/// Each entity contributes one to the gauge of its current state until it
/// reaches a final state. Every transition into a state bumps that state's
/// counter; reporting the state an entity is already in changes nothing.
pub struct FsmMetrics<S: MetricState> {
    gauge_name: String,
    counter_name: String,
    registry: Arc<MetricsRegistry>,
    current: Mutex<HashMap<String, S>>,
}

impl<S: MetricState> FsmMetrics<S> {
    pub fn new(gauge_name: &str, counter_name: &str, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            gauge_name: gauge_name.to_string(),
            counter_name: counter_name.to_string(),
            registry,
            current: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, id: &str, state: S) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = current.get(id).copied();
        if previous == Some(state) {
            return;
        }
        if let Some(previous) = previous {
            self.registry
                .add_to_gauge(&self.gauge_name, &[("state", previous.metric_tag())], -1);
        }
        self.registry
            .increment_counter(&self.counter_name, &[("state", state.metric_tag())]);

        if state.is_final() {
            current.remove(id);
        } else {
            self.registry
                .add_to_gauge(&self.gauge_name, &[("state", state.metric_tag())], 1);
            current.insert(id.to_string(), state);
        }
    }

    /// Forget an entity that disappeared without reaching a final state.
    pub fn remove(&self, id: &str) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.remove(id) {
            self.registry
                .add_to_gauge(&self.gauge_name, &[("state", previous.metric_tag())], -1);
        }
    }

    pub fn tracked(&self) -> usize {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<S: MetricState> fmt::Debug for FsmMetrics<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsmMetrics")
            .field("gauge_name", &self.gauge_name)
            .field("counter_name", &self.counter_name)
            .field("tracked", &self.tracked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_metrics() -> (FsmMetrics<TaskState>, Arc<MetricsRegistry>) {
        let registry = Arc::new(MetricsRegistry::new());
        (FsmMetrics::new(TASK_CURRENT_STATE, TASK_UPDATES, registry.clone()), registry)
    }

    fn gauge(registry: &MetricsRegistry, state: TaskState) -> i64 {
        registry.gauge(TASK_CURRENT_STATE, &[("state", state.as_str())])
    }

    fn updates(registry: &MetricsRegistry, state: TaskState) -> u64 {
        registry.counter(TASK_UPDATES, &[("state", state.as_str())])
    }

    #[test]
    fn test_transitions_move_gauges() {
        let (metrics, registry) = task_metrics();
        metrics.record("t1", TaskState::Accepted);
        metrics.record("t2", TaskState::Accepted);
        metrics.record("t1", TaskState::Launched);

        assert_eq!(gauge(&registry, TaskState::Accepted), 1);
        assert_eq!(gauge(&registry, TaskState::Launched), 1);
        assert_eq!(updates(&registry, TaskState::Accepted), 2);
        assert_eq!(updates(&registry, TaskState::Launched), 1);
    }

    #[test]
    fn test_repeated_state_is_not_counted() {
        let (metrics, registry) = task_metrics();
        metrics.record("t1", TaskState::Started);
        metrics.record("t1", TaskState::Started);
        assert_eq!(updates(&registry, TaskState::Started), 1);
        assert_eq!(gauge(&registry, TaskState::Started), 1);
    }

    #[test]
    fn test_final_state_clears_gauge() {
        let (metrics, registry) = task_metrics();
        metrics.record("t1", TaskState::Started);
        metrics.record("t1", TaskState::Finished);

        assert_eq!(gauge(&registry, TaskState::Started), 0);
        assert_eq!(gauge(&registry, TaskState::Finished), 0);
        assert_eq!(updates(&registry, TaskState::Finished), 1);
        assert_eq!(metrics.tracked(), 0);
    }

    #[test]
    fn test_remove_drops_live_entity() {
        let (metrics, registry) = task_metrics();
        metrics.record("t1", TaskState::Launched);
        metrics.remove("t1");
        metrics.remove("t1");
        assert_eq!(gauge(&registry, TaskState::Launched), 0);
    }

    #[test]
    fn test_snapshot_lists_counters_then_gauges() {
        let registry = MetricsRegistry::new();
        registry.add_to_gauge("g", &[], 3);
        registry.increment_counter("c", &[("k", "v")]);
        let samples = registry.snapshot();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].kind, MetricKind::Counter);
        assert_eq!(samples[0].id.to_string(), "c{k=v}");
        assert_eq!(samples[1].value, 3);
    }
}
