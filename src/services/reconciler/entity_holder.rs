//! Immutable, persistent tree nodes.
//!
//! An [`EntityHolder`] pairs one entity with its children. Every update
//! returns a new holder; untouched entities, children and tags are shared with
//! the previous version through `Arc`, so a snapshot handed to a resolver stays
//! valid while the engine builds the next one.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Coarse lifecycle of a root entity, used by the engine to track its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Terminating,
    Finished,
}

/// Anything stored in a reconciliation tree.
pub trait Entity: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn lifecycle(&self) -> Lifecycle;
}

/// Immutable tree node.
#[derive(Clone)]
pub struct EntityHolder<E> {
    id: Arc<str>,
    entity: Arc<E>,
    children: Arc<Vec<EntityHolder<E>>>,
    tags: Arc<BTreeMap<String, String>>,
}

impl<E: Entity> EntityHolder<E> {
    pub fn new(id: impl Into<String>, entity: E) -> Self {
        Self {
            id: Arc::from(id.into()),
            entity: Arc::new(entity),
            children: Arc::new(Vec::new()),
            tags: Arc::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn children(&self) -> &[Self] {
        &self.children
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// This holder if its id matches, otherwise the first match in the
    /// subtree (depth first).
    pub fn find_by_id(&self, id: &str) -> Option<&Self> {
        if self.id() == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find_by_id(id))
    }

    /// Direct child with the given id.
    pub fn find_child(&self, id: &str) -> Option<&Self> {
        self.children.iter().find(|child| child.id() == id)
    }

    /// Replace the child with the same id, or append it.
    #[must_use]
    pub fn with_child(&self, child: Self) -> Self {
        let mut children: Vec<Self> = self.children.as_ref().clone();
        match children.iter().position(|c| c.id == child.id) {
            Some(pos) => children[pos] = child,
            None => children.push(child),
        }
        Self {
            children: Arc::new(children),
            ..self.clone()
        }
    }

    /// Remove the child with the given id. Removing a missing child returns an
    /// equivalent holder.
    #[must_use]
    pub fn without_child(&self, id: &str) -> Self {
        if self.find_child(id).is_none() {
            return self.clone();
        }
        let children: Vec<Self> = self
            .children
            .iter()
            .filter(|c| c.id() != id)
            .cloned()
            .collect();
        Self {
            children: Arc::new(children),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_entity(&self, entity: E) -> Self {
        Self {
            entity: Arc::new(entity),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut tags = self.tags.as_ref().clone();
        tags.insert(key.into(), value.into());
        Self {
            tags: Arc::new(tags),
            ..self.clone()
        }
    }

    /// Deep structural equality: same id, equal entities, and children that
    /// are pairwise equivalent when matched by id. Tags are ignored.
    pub fn is_equivalent_to(&self, other: &Self) -> bool {
        if self.id != other.id {
            return false;
        }
        if !Arc::ptr_eq(&self.entity, &other.entity) && self.entity != other.entity {
            return false;
        }
        if Arc::ptr_eq(&self.children, &other.children) {
            return true;
        }
        self.children.len() == other.children.len()
            && self.children.iter().all(|child| {
                other
                    .find_child(child.id())
                    .is_some_and(|counterpart| child.is_equivalent_to(counterpart))
            })
    }
}

impl<E: fmt::Debug> fmt::Debug for EntityHolder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHolder")
            .field("id", &self.id)
            .field("entity", &self.entity)
            .field("children", &self.children.len())
            .finish()
    }
}

impl<E: Serialize> Serialize for EntityHolder<E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("EntityHolder", 4)?;
        state.serialize_field("id", self.id.as_ref())?;
        state.serialize_field("entity", self.entity.as_ref())?;
        state.serialize_field("children", self.children.as_slice())?;
        state.serialize_field("tags", self.tags.as_ref())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Node(u32);

    impl Entity for Node {
        fn lifecycle(&self) -> Lifecycle {
            Lifecycle::Active
        }
    }

    fn tree(children: &[(&str, u32)]) -> EntityHolder<Node> {
        children
            .iter()
            .fold(EntityHolder::new("root", Node(0)), |root, (id, value)| {
                root.with_child(EntityHolder::new(*id, Node(*value)))
            })
    }

    #[test]
    fn test_with_child_appends_then_replaces() {
        let root = tree(&[("a", 1), ("b", 2)]);
        assert_eq!(root.children().len(), 2);

        let replaced = root.with_child(EntityHolder::new("a", Node(10)));
        assert_eq!(replaced.children().len(), 2);
        assert_eq!(replaced.find_child("a").map(|h| h.entity().0), Some(10));
        // Old version is untouched
        assert_eq!(root.find_child("a").map(|h| h.entity().0), Some(1));
        // Order is kept on replacement
        assert_eq!(replaced.children()[0].id(), "a");
    }

    #[test]
    fn test_without_child() {
        let root = tree(&[("a", 1), ("b", 2)]);
        let removed = root.without_child("a");
        assert!(removed.find_child("a").is_none());
        assert_eq!(removed.children().len(), 1);
        assert!(root.without_child("missing").is_equivalent_to(&root));
    }

    #[test]
    fn test_find_by_id_includes_self() {
        let root = tree(&[("a", 1)]);
        assert_eq!(root.find_by_id("root").map(EntityHolder::id), Some("root"));
        assert_eq!(root.find_by_id("a").map(|h| h.entity().0), Some(1));
        assert!(root.find_by_id("zz").is_none());
    }

    #[test]
    fn test_equivalence_ignores_order_and_tags() {
        let first = tree(&[("a", 1), ("b", 2)]);
        let second = tree(&[("b", 2), ("a", 1)]).with_tag("source", "test");
        assert!(first.is_equivalent_to(&second));
        assert!(second.is_equivalent_to(&first));
    }

    #[test]
    fn test_equivalence_detects_entity_and_shape_changes() {
        let base = tree(&[("a", 1), ("b", 2)]);
        assert!(!base.is_equivalent_to(&tree(&[("a", 1), ("b", 3)])));
        assert!(!base.is_equivalent_to(&tree(&[("a", 1)])));
        assert!(!base.is_equivalent_to(&tree(&[("a", 1), ("c", 2)])));
        assert!(!base.is_equivalent_to(&base.with_entity(Node(9))));
    }

    #[test]
    fn test_tags() {
        let holder = EntityHolder::new("x", Node(1)).with_tag("k", "v");
        assert_eq!(holder.tag("k"), Some("v"));
        assert_eq!(holder.tag("missing"), None);
    }
}
