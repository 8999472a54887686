//! Reconciliation event stream.
//!
//! Every engine owns an [`EventSink`] publishing to a per-job broadcast
//! channel and, optionally, to an aggregate channel shared by all jobs.
//! Events carry a per-job sequence number so consumers can detect gaps after
//! lagging behind.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::change_action::Change;
use super::entity_holder::{Entity, EntityHolder};
use super::error::{ActionError, UpdateError};
use super::model_update::{AppliedUpdate, Model, ModelUpdateAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerEventType {
    /// Initial reference model of a freshly started engine
    ModelInitial,
    /// A change action completed
    Changed,
    /// A change action failed
    ChangeError,
    /// A model update was applied to one of the trees
    ModelUpdated,
    /// A model update could not be applied
    ModelUpdateError,
}

impl ReconcilerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelInitial => "model_initial",
            Self::Changed => "changed",
            Self::ChangeError => "change_error",
            Self::ModelUpdated => "model_updated",
            Self::ModelUpdateError => "model_update_error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::ChangeError | Self::ModelUpdateError)
    }
}

impl std::fmt::Display for ReconcilerEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcilerEvent<E> {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: ReconcilerEventType,
    pub job_id: String,
    pub entity_id: String,
    pub change: Change,
    /// Tree touched by a model update
    pub model: Option<Model>,
    pub description: String,
    pub previous: Option<EntityHolder<E>>,
    pub current: Option<EntityHolder<E>>,
    pub error: Option<String>,
}

impl<E: Entity> ReconcilerEvent<E> {
    fn new(event_type: ReconcilerEventType, job_id: &str, change: &Change) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            event_type,
            job_id: job_id.to_string(),
            entity_id: change.id.clone(),
            change: change.clone(),
            model: None,
            description: change.summary.clone(),
            previous: None,
            current: None,
            error: None,
        }
    }

    /// One line summary used by the CLI and logs.
    pub fn to_log_string(&self) -> String {
        let mut line = format!(
            "#{} {} job={} entity={} trigger={}",
            self.sequence, self.event_type, self.job_id, self.entity_id, self.change.trigger
        );
        if let Some(model) = self.model {
            line.push_str(&format!(" model={model}"));
        }
        line.push_str(&format!(": {}", self.description));
        if let Some(error) = &self.error {
            line.push_str(&format!(" error=\"{error}\""));
        }
        line
    }
}

/// Publisher side of a job's event stream.
#[derive(Debug)]
pub struct EventSink<E> {
    job_id: String,
    sequence: AtomicU64,
    sender: broadcast::Sender<ReconcilerEvent<E>>,
    aggregate: Option<broadcast::Sender<ReconcilerEvent<E>>>,
}

impl<E: Entity> EventSink<E> {
    pub fn new(job_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            job_id: job_id.into(),
            sequence: AtomicU64::new(0),
            sender,
            aggregate: None,
        }
    }

    /// Also forward every event to `aggregate`.
    #[must_use]
    pub fn with_aggregate(mut self, aggregate: broadcast::Sender<ReconcilerEvent<E>>) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcilerEvent<E>> {
        self.sender.subscribe()
    }

    /// Number of events published so far.
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn model_initial(&self, change: &Change, root: &EntityHolder<E>) {
        let event = ReconcilerEvent {
            model: Some(Model::Reference),
            entity_id: root.id().to_string(),
            current: Some(root.clone()),
            ..ReconcilerEvent::new(ReconcilerEventType::ModelInitial, &self.job_id, change)
        };
        self.publish(event);
    }

    pub fn changed(&self, change: &Change, action_name: &str) {
        let event = ReconcilerEvent {
            description: format!("{action_name}: {}", change.summary),
            ..ReconcilerEvent::new(ReconcilerEventType::Changed, &self.job_id, change)
        };
        self.publish(event);
    }

    pub fn change_error(&self, change: &Change, action_name: &str, error: &ActionError) {
        let event = ReconcilerEvent {
            description: format!("{action_name}: {}", change.summary),
            error: Some(error.to_string()),
            ..ReconcilerEvent::new(ReconcilerEventType::ChangeError, &self.job_id, change)
        };
        self.publish(event);
    }

    pub fn model_updated(&self, change: &Change, update: &ModelUpdateAction<E>, applied: &AppliedUpdate<E>) {
        let event = ReconcilerEvent {
            entity_id: update.target_id().to_string(),
            model: Some(update.model),
            description: update.describe(),
            previous: applied.previous.clone(),
            current: applied.current.clone(),
            ..ReconcilerEvent::new(ReconcilerEventType::ModelUpdated, &self.job_id, change)
        };
        self.publish(event);
    }

    pub fn model_update_error(&self, change: &Change, update: &ModelUpdateAction<E>, error: &UpdateError) {
        let event = ReconcilerEvent {
            entity_id: update.target_id().to_string(),
            model: Some(update.model),
            description: update.describe(),
            error: Some(error.to_string()),
            ..ReconcilerEvent::new(ReconcilerEventType::ModelUpdateError, &self.job_id, change)
        };
        self.publish(event);
    }

    fn publish(&self, mut event: ReconcilerEvent<E>) {
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        if let Some(aggregate) = &self.aggregate {
            // No subscriber is fine
            let _ = aggregate.send(event.clone());
        }
        let _ = self.sender.send(event);
    }
}
