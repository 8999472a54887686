use super::change_action::{ChangeAction, ChangeKind};
use super::entity_holder::EntityHolder;
use super::error::ResolveError;

/// Convergence function of one job type.
///
/// Compares the reference tree against the running and store trees and
/// returns the corrective actions, in the order their model updates must be
/// applied. Resolving identical inputs twice yields the same corrective
/// intent, so a cycle can always be re-run after a partial failure.
pub trait DifferenceResolver<K: ChangeKind>: Send + Sync {
    fn resolve(
        &self,
        reference: &EntityHolder<K::Entity>,
        running: &EntityHolder<K::Entity>,
        store: &EntityHolder<K::Entity>,
    ) -> Result<Vec<ChangeAction<K>>, ResolveError>;
}
