//! Units of work produced by resolvers and external callers.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::entity_holder::Entity;
use super::error::ActionError;
use super::model_update::ModelUpdateAction;
use crate::services::interceptors::Interceptor;

/// What part of a job a change touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeScope {
    Job,
    Task,
    /// Removal of the whole job; retires the engine
    Close,
}

impl ChangeScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Task => "task",
            Self::Close => "close",
        }
    }
}

/// Who asked for a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Api,
    Reconciler,
    TaskStatusUpdate,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Reconciler => "reconciler",
            Self::TaskStatusUpdate => "task_status_update",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribution of a change action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub scope: ChangeScope,
    pub trigger: Trigger,
    /// Target entity id
    pub id: String,
    pub summary: String,
}

impl Change {
    pub fn new(scope: ChangeScope, trigger: Trigger, id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            scope,
            trigger,
            id: id.into(),
            summary: summary.into(),
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] {} ({})",
            self.scope.as_str(),
            self.id,
            self.summary,
            self.trigger
        )
    }
}

/// The closed set of actions a job type knows how to execute.
///
/// Implemented by a tagged enum whose `execute` matches on the variant.
#[async_trait]
pub trait ChangeKind: fmt::Debug + Send + Sync + 'static {
    type Entity: Entity;
    /// Collaborators the actions call into
    type Context: Send + Sync + 'static;

    /// Short variant name, used in logs and events
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &Self::Context) -> Result<Vec<ModelUpdateAction<Self::Entity>>, ActionError>;
}

/// An attributed action, optionally wrapped by interceptors.
#[derive(Debug)]
pub struct ChangeAction<K> {
    change: Change,
    kind: K,
    /// Outermost first
    interceptors: Vec<Interceptor>,
}

impl<K: ChangeKind> ChangeAction<K> {
    pub fn new(change: Change, kind: K) -> Self {
        Self {
            change,
            kind,
            interceptors: Vec::new(),
        }
    }

    pub fn change(&self) -> &Change {
        &self.change
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn interceptors(&self) -> &[Interceptor] {
        &self.interceptors
    }

    /// Wrap this action with `interceptor`, which becomes the outermost one.
    #[must_use]
    pub fn intercepted_by(mut self, interceptor: Interceptor) -> Self {
        self.interceptors.insert(0, interceptor);
        self
    }

    /// Run the action through its interceptors.
    ///
    /// Interceptors are entered outermost first. When one refuses entry, the
    /// action body and the inner interceptors never run; only the
    /// interceptors already entered observe the outcome. A body still running
    /// after `deadline` is dropped and fails with [`ActionError::TimedOut`].
    pub async fn execute(
        &self,
        ctx: &K::Context,
        deadline: Duration,
    ) -> Result<Vec<ModelUpdateAction<K::Entity>>, ActionError> {
        let mut entered = 0;
        let mut refusal = None;
        for interceptor in &self.interceptors {
            if let Err(err) = interceptor.enter() {
                refusal = Some(err);
                break;
            }
            entered += 1;
        }

        let result = match refusal {
            Some(err) => Err(err),
            None => tokio::time::timeout(deadline, self.kind.execute(ctx))
                .await
                .unwrap_or_else(|_| Err(ActionError::TimedOut(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX)))),
        };

        let outcome = result.as_ref().map(|_| ());
        for interceptor in self.interceptors[..entered].iter().rev() {
            interceptor.exit(outcome);
        }
        result
    }
}

impl<K: ChangeKind> fmt::Display for ChangeAction<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.name(), self.change)
    }
}
