//! Per-job reconciliation engine.
//!
//! An engine exclusively owns the reference, running and store trees of one
//! job. A cycle drains externally submitted change actions (applied against
//! the reference tree first), asks the resolver for corrective actions and
//! submits them all at once. Completions are queued in resolver order and
//! each action's model updates are applied as soon as it and every action
//! before it have finished. Every action runs under a deadline, so a hung
//! collaborator costs one cycle at most. Nothing else mutates the trees, so a
//! resolver never observes a half-applied cycle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesOrdered, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::change_action::{Change, ChangeAction, ChangeKind, ChangeScope, Trigger};
use super::entity_holder::{Entity, EntityHolder, Lifecycle};
use super::error::{ActionError, ResolveError};
use super::events::{EventSink, ReconcilerEvent};
use super::model_update::{Model, ModelUpdateAction};
use super::resolver::DifferenceResolver;

/// Deadline of a single action unless configured otherwise.
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Active,
    /// The reference job is being killed or has finished
    Terminating,
    /// The job was removed; the engine no longer runs cycles
    Removed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Terminating => "terminating",
            Self::Removed => "removed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of an engine's trees. Trees are `None` once removed.
#[derive(Debug, Clone)]
pub struct EngineSnapshot<E> {
    pub state: EngineState,
    pub reference: Option<EntityHolder<E>>,
    pub running: Option<EntityHolder<E>>,
    pub store: Option<EntityHolder<E>>,
}

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub external_changes: usize,
    /// Actions returned by the resolver
    pub actions: usize,
    pub failed_actions: usize,
    /// Actions refused by the rate limiter
    pub deferred_actions: usize,
    pub model_updates: usize,
    pub resolve_error: Option<ResolveError>,
    pub state: EngineState,
}

impl CycleReport {
    fn new(state: EngineState) -> Self {
        Self {
            external_changes: 0,
            actions: 0,
            failed_actions: 0,
            deferred_actions: 0,
            model_updates: 0,
            resolve_error: None,
            state,
        }
    }

    /// True when the cycle found nothing to do.
    pub fn is_settled(&self) -> bool {
        self.external_changes == 0 && self.actions == 0 && self.resolve_error.is_none()
    }
}

type ActionBuilder<K> =
    Box<dyn FnOnce(&EntityHolder<<K as ChangeKind>::Entity>) -> Option<ChangeAction<K>> + Send>;

enum ExternalAction<K: ChangeKind> {
    Ready(ChangeAction<K>),
    /// Built against the reference tree when the engine gets to it
    Deferred(ActionBuilder<K>),
}

struct ExternalRequest<K: ChangeKind> {
    action: ExternalAction<K>,
    reply: oneshot::Sender<Result<(), ActionError>>,
}

#[derive(Debug, Clone)]
struct Trees<E> {
    reference: EntityHolder<E>,
    running: EntityHolder<E>,
    store: EntityHolder<E>,
}

impl<E: Entity> Trees<E> {
    fn get(&self, model: Model) -> &EntityHolder<E> {
        match model {
            Model::Reference => &self.reference,
            Model::Running => &self.running,
            Model::Store => &self.store,
        }
    }

    fn set(&mut self, model: Model, root: EntityHolder<E>) {
        match model {
            Model::Reference => self.reference = root,
            Model::Running => self.running = root,
            Model::Store => self.store = root,
        }
    }
}

/// Cloneable access to a running engine.
pub struct EngineHandle<K: ChangeKind> {
    job_id: Arc<str>,
    requests: mpsc::UnboundedSender<ExternalRequest<K>>,
    wakeup: Arc<Notify>,
    events: Arc<EventSink<K::Entity>>,
    snapshot: watch::Receiver<EngineSnapshot<K::Entity>>,
}

impl<K: ChangeKind> Clone for EngineHandle<K> {
    fn clone(&self) -> Self {
        Self {
            job_id: Arc::clone(&self.job_id),
            requests: self.requests.clone(),
            wakeup: Arc::clone(&self.wakeup),
            events: Arc::clone(&self.events),
            snapshot: self.snapshot.clone(),
        }
    }
}

impl<K: ChangeKind> EngineHandle<K> {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Queue an externally triggered action against the reference tree.
    ///
    /// The returned future resolves once the action ran and its model updates
    /// were applied, or with the action's error. It fails with
    /// [`ActionError::EngineRetired`] if the engine stops first.
    pub fn apply_change_action(
        &self,
        action: ChangeAction<K>,
    ) -> impl Future<Output = Result<(), ActionError>> + Send + 'static {
        self.submit(ExternalAction::Ready(action))
    }

    /// Like [`apply_change_action`](Self::apply_change_action), but the action
    /// is built from the reference tree as it stands when the engine drains
    /// the request. A builder returning `None` completes without effect.
    pub fn apply_change_with<F>(&self, build: F) -> impl Future<Output = Result<(), ActionError>> + Send + 'static
    where
        F: FnOnce(&EntityHolder<K::Entity>) -> Option<ChangeAction<K>> + Send + 'static,
    {
        self.submit(ExternalAction::Deferred(Box::new(build)))
    }

    fn submit(&self, action: ExternalAction<K>) -> impl Future<Output = Result<(), ActionError>> + Send + 'static {
        let (reply, completion) = oneshot::channel();
        let accepted = self.requests.send(ExternalRequest { action, reply }).is_ok();
        if accepted {
            self.wakeup.notify_one();
        }
        let job_id = self.job_id.to_string();
        async move {
            if !accepted {
                return Err(ActionError::EngineRetired(job_id));
            }
            completion
                .await
                .unwrap_or_else(|_| Err(ActionError::EngineRetired(job_id)))
        }
    }

    /// Subscribe to this job's events. Resubscribing restarts the stream
    /// from the next published event.
    pub fn trigger_events(&self) -> broadcast::Receiver<ReconcilerEvent<K::Entity>> {
        self.events.subscribe()
    }

    /// Ask the engine to run a cycle without waiting for the next tick.
    pub fn trigger_cycle(&self) {
        self.wakeup.notify_one();
    }

    pub fn state(&self) -> EngineState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> EngineSnapshot<K::Entity> {
        self.snapshot.borrow().clone()
    }

    /// Watch every published snapshot.
    pub fn watch(&self) -> watch::Receiver<EngineSnapshot<K::Entity>> {
        self.snapshot.clone()
    }
}

pub struct ReconciliationEngine<K: ChangeKind> {
    job_id: Arc<str>,
    state: EngineState,
    trees: Option<Trees<K::Entity>>,
    resolver: Arc<dyn DifferenceResolver<K>>,
    context: Arc<K::Context>,
    action_timeout: Duration,
    events: Arc<EventSink<K::Entity>>,
    requests: mpsc::UnboundedReceiver<ExternalRequest<K>>,
    handle: EngineHandle<K>,
    snapshot: watch::Sender<EngineSnapshot<K::Entity>>,
}

impl<K: ChangeKind> ReconciliationEngine<K> {
    /// Build an engine over the three trees of one job.
    ///
    /// All roots must carry the same id. The initial reference model is
    /// published as a `ModelInitial` event.
    pub fn new(
        reference: EntityHolder<K::Entity>,
        running: EntityHolder<K::Entity>,
        store: EntityHolder<K::Entity>,
        resolver: Arc<dyn DifferenceResolver<K>>,
        context: Arc<K::Context>,
        events: EventSink<K::Entity>,
    ) -> Result<Self, ResolveError> {
        if running.id() != reference.id() || store.id() != reference.id() {
            return Err(ResolveError::InvariantViolation(format!(
                "tree roots disagree: reference={} running={} store={}",
                reference.id(),
                running.id(),
                store.id()
            )));
        }

        let job_id: Arc<str> = Arc::from(reference.id());
        let trees = Trees {
            reference,
            running,
            store,
        };
        let state = Self::state_of(&trees.reference);
        let events = Arc::new(events);
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(EngineSnapshot {
            state,
            reference: Some(trees.reference.clone()),
            running: Some(trees.running.clone()),
            store: Some(trees.store.clone()),
        });

        let handle = EngineHandle {
            job_id: Arc::clone(&job_id),
            requests: requests_tx,
            wakeup: Arc::new(Notify::new()),
            events: Arc::clone(&events),
            snapshot: snapshot_rx,
        };

        let initial = Change::new(ChangeScope::Job, Trigger::Api, job_id.as_ref(), "Engine started");
        events.model_initial(&initial, &trees.reference);

        Ok(Self {
            job_id,
            state,
            trees: Some(trees),
            resolver,
            context,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            events,
            requests,
            handle,
            snapshot,
        })
    }

    /// Fail actions that run longer than `timeout`.
    #[must_use]
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn handle(&self) -> EngineHandle<K> {
        self.handle.clone()
    }

    pub fn reference(&self) -> Option<&EntityHolder<K::Entity>> {
        self.trees.as_ref().map(|t| &t.reference)
    }

    pub fn running(&self) -> Option<&EntityHolder<K::Entity>> {
        self.trees.as_ref().map(|t| &t.running)
    }

    pub fn store(&self) -> Option<&EntityHolder<K::Entity>> {
        self.trees.as_ref().map(|t| &t.store)
    }

    /// Run one reconciliation cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::new(self.state);
        if self.state == EngineState::Removed {
            return report;
        }

        // External changes go first, one at a time, in submission order
        while let Ok(request) = self.requests.try_recv() {
            report.external_changes += 1;
            let outcome = match request.action {
                ExternalAction::Ready(action) => self.execute_external(&action, &mut report).await,
                ExternalAction::Deferred(build) => match self.trees.as_ref().map(|t| build(&t.reference)) {
                    Some(Some(action)) => self.execute_external(&action, &mut report).await,
                    Some(None) => Ok(()),
                    None => Err(ActionError::EngineRetired(self.job_id.to_string())),
                },
            };
            self.publish_state();
            // The caller may have stopped waiting
            let _ = request.reply.send(outcome);
        }

        let Some(trees) = self.trees.clone() else {
            return self.finish_cycle(report);
        };

        let actions = match self
            .resolver
            .resolve(&trees.reference, &trees.running, &trees.store)
        {
            Ok(actions) => actions,
            Err(error) => {
                warn!(job_id = %self.job_id, error = %error, "Difference resolution failed, skipping cycle");
                report.resolve_error = Some(error);
                return self.finish_cycle(report);
            }
        };
        report.actions = actions.len();
        if !actions.is_empty() {
            debug!(job_id = %self.job_id, actions = actions.len(), "Executing reconciler actions");
        }

        let context = Arc::clone(&self.context);
        let ctx = context.as_ref();
        let deadline = self.action_timeout;
        let mut completions: FuturesOrdered<_> = actions
            .iter()
            .map(|action| async move { (action, action.execute(ctx, deadline).await) })
            .collect();

        while let Some((action, result)) = completions.next().await {
            match result {
                Ok(updates) => {
                    self.events.changed(action.change(), action.kind().name());
                    report.model_updates += self.apply_updates(action.change(), updates);
                }
                Err(error) if error.is_deferral() => {
                    debug!(job_id = %self.job_id, action = %action, "Action deferred by rate limiter");
                    report.deferred_actions += 1;
                }
                Err(error) => {
                    warn!(job_id = %self.job_id, action = %action, error = %error, "Reconciler action failed");
                    self.events.change_error(action.change(), action.kind().name(), &error);
                    report.failed_actions += 1;
                }
            }
        }

        self.finish_cycle(report)
    }

    /// Run cycles on every tick of `interval` or on demand, until the job is
    /// removed or `shutdown` flips to true. Pending external actions are then
    /// failed with [`ActionError::EngineRetired`].
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, interval: Duration) -> EngineState {
        let wakeup = Arc::clone(&self.handle.wakeup);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            job_id = %self.job_id,
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Reconciliation engine started"
        );

        while self.state != EngineState::Removed && !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {}
                () = wakeup.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.run_cycle().await;
        }

        self.retire_pending();
        info!(job_id = %self.job_id, state = %self.state, "Reconciliation engine stopped");
        self.state
    }

    async fn execute_external(&mut self, action: &ChangeAction<K>, report: &mut CycleReport) -> Result<(), ActionError> {
        if self.trees.is_none() {
            return Err(ActionError::EngineRetired(self.job_id.to_string()));
        }
        match action.execute(&self.context, self.action_timeout).await {
            Ok(updates) => {
                self.events.changed(action.change(), action.kind().name());
                report.model_updates += self.apply_updates(action.change(), updates);
                Ok(())
            }
            Err(error) => {
                warn!(job_id = %self.job_id, action = %action, error = %error, "External change failed");
                self.events.change_error(action.change(), action.kind().name(), &error);
                report.failed_actions += 1;
                Err(error)
            }
        }
    }

    /// Apply `updates` in order. Updates arriving after the job was removed
    /// are discarded. Returns how many were applied.
    fn apply_updates(&mut self, change: &Change, updates: Vec<ModelUpdateAction<K::Entity>>) -> usize {
        let mut applied_count = 0;
        for update in updates {
            let Some(trees) = self.trees.as_mut() else {
                debug!(job_id = %self.job_id, update = %update.describe(), "Discarding update for removed job");
                continue;
            };
            match update.apply(trees.get(update.model), change) {
                Ok(applied) => {
                    self.events.model_updated(change, &update, &applied);
                    applied_count += 1;
                    match applied.root {
                        Some(root) => trees.set(update.model, root),
                        None => {
                            info!(job_id = %self.job_id, model = %update.model, "Job root removed, retiring engine");
                            self.trees = None;
                            self.state = EngineState::Removed;
                        }
                    }
                }
                Err(error) => {
                    warn!(job_id = %self.job_id, update = %update.describe(), error = %error, "Model update failed");
                    self.events.model_update_error(change, &update, &error);
                }
            }
        }
        applied_count
    }

    fn finish_cycle(&mut self, mut report: CycleReport) -> CycleReport {
        self.publish_state();
        report.state = self.state;
        report
    }

    /// Derive the engine state from the reference root and publish a snapshot.
    fn publish_state(&mut self) {
        if let Some(trees) = &self.trees {
            let next = Self::state_of(&trees.reference);
            if next != self.state {
                info!(job_id = %self.job_id, from = %self.state, to = %next, "Engine state changed");
                self.state = next;
            }
        }
        self.snapshot.send_replace(EngineSnapshot {
            state: self.state,
            reference: self.trees.as_ref().map(|t| t.reference.clone()),
            running: self.trees.as_ref().map(|t| t.running.clone()),
            store: self.trees.as_ref().map(|t| t.store.clone()),
        });
    }

    fn retire_pending(&mut self) {
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            let _ = request
                .reply
                .send(Err(ActionError::EngineRetired(self.job_id.to_string())));
        }
    }

    fn state_of(reference: &EntityHolder<K::Entity>) -> EngineState {
        match reference.entity().lifecycle() {
            Lifecycle::Active => EngineState::Active,
            Lifecycle::Terminating | Lifecycle::Finished => EngineState::Terminating,
        }
    }
}
