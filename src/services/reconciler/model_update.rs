//! Pure mutations of the reference, running and store trees.

use serde::{Deserialize, Serialize};

use super::change_action::Change;
use super::entity_holder::{Entity, EntityHolder};
use super::error::UpdateError;

/// Tag set on every holder touched by a model update: summary of the change.
pub const TAG_LAST_CHANGE: &str = "reconciler.lastChange";
/// Tag set on every holder touched by a model update: what triggered it.
pub const TAG_LAST_TRIGGER: &str = "reconciler.lastTrigger";

/// One of the three trees a job engine owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    Reference,
    Running,
    Store,
}

impl Model {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Running => "running",
            Self::Store => "store",
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation applied to a tree.
#[derive(Debug, Clone)]
pub enum TreeMutation<E> {
    /// Replace the entity of the root or of an existing child
    ReplaceEntity { id: String, entity: E },
    /// Insert a child under the root, replacing the one with the same id
    AddChild { id: String, entity: E },
    /// Remove a child; removing the root retires the tree
    Remove { id: String },
}

/// A named mutation of one tree.
#[derive(Debug, Clone)]
pub struct ModelUpdateAction<E> {
    pub model: Model,
    pub mutation: TreeMutation<E>,
}

/// Result of applying a model update.
#[derive(Debug, Clone)]
pub struct AppliedUpdate<E> {
    /// New root, `None` when the root itself was removed
    pub root: Option<EntityHolder<E>>,
    pub previous: Option<EntityHolder<E>>,
    pub current: Option<EntityHolder<E>>,
}

impl<E: Entity> ModelUpdateAction<E> {
    pub fn replace_entity(model: Model, id: impl Into<String>, entity: E) -> Self {
        Self {
            model,
            mutation: TreeMutation::ReplaceEntity { id: id.into(), entity },
        }
    }

    pub fn add_child(model: Model, id: impl Into<String>, entity: E) -> Self {
        Self {
            model,
            mutation: TreeMutation::AddChild { id: id.into(), entity },
        }
    }

    pub fn remove(model: Model, id: impl Into<String>) -> Self {
        Self {
            model,
            mutation: TreeMutation::Remove { id: id.into() },
        }
    }

    /// Id of the entity this update targets.
    pub fn target_id(&self) -> &str {
        match &self.mutation {
            TreeMutation::ReplaceEntity { id, .. }
            | TreeMutation::AddChild { id, .. }
            | TreeMutation::Remove { id } => id,
        }
    }

    pub fn describe(&self) -> String {
        let verb = match self.mutation {
            TreeMutation::ReplaceEntity { .. } => "replace",
            TreeMutation::AddChild { .. } => "add",
            TreeMutation::Remove { .. } => "remove",
        };
        format!("{verb} {} in {} model", self.target_id(), self.model)
    }

    /// Apply to `root`, tagging the touched holder with the change attribution.
    pub fn apply(&self, root: &EntityHolder<E>, change: &Change) -> Result<AppliedUpdate<E>, UpdateError> {
        let attribute = |holder: EntityHolder<E>| {
            holder
                .with_tag(TAG_LAST_CHANGE, change.summary.clone())
                .with_tag(TAG_LAST_TRIGGER, change.trigger.as_str())
        };

        match &self.mutation {
            TreeMutation::ReplaceEntity { id, entity } if id == root.id() => {
                let updated = attribute(root.with_entity(entity.clone()));
                Ok(AppliedUpdate {
                    root: Some(updated.clone()),
                    previous: Some(root.clone()),
                    current: Some(updated),
                })
            }
            TreeMutation::ReplaceEntity { id, entity } => {
                let previous = root.find_child(id).ok_or_else(|| UpdateError::EntityNotFound {
                    model: self.model,
                    id: id.clone(),
                })?;
                let updated = attribute(previous.with_entity(entity.clone()));
                Ok(AppliedUpdate {
                    root: Some(root.with_child(updated.clone())),
                    previous: Some(previous.clone()),
                    current: Some(updated),
                })
            }
            TreeMutation::AddChild { id, entity } => {
                let previous = root.find_child(id).cloned();
                let updated = attribute(match &previous {
                    Some(existing) => existing.with_entity(entity.clone()),
                    None => EntityHolder::new(id.clone(), entity.clone()),
                });
                Ok(AppliedUpdate {
                    root: Some(root.with_child(updated.clone())),
                    previous,
                    current: Some(updated),
                })
            }
            TreeMutation::Remove { id } if id == root.id() => Ok(AppliedUpdate {
                root: None,
                previous: Some(root.clone()),
                current: None,
            }),
            TreeMutation::Remove { id } => {
                let previous = root.find_child(id).cloned();
                Ok(AppliedUpdate {
                    root: Some(root.without_child(id)),
                    previous,
                    current: None,
                })
            }
        }
    }
}
