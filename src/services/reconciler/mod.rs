//! Generic tri-tree reconciliation.
//!
//! A job is represented by three [`EntityHolder`] trees: what the user wants
//! (reference), what the engine believes is live (running) and what was last
//! persisted (store). A [`DifferenceResolver`] compares them and emits
//! [`ChangeAction`]s; the [`ReconciliationEngine`] executes those actions and
//! applies the [`ModelUpdateAction`]s they produce.

mod change_action;
mod engine;
mod entity_holder;
mod error;
mod events;
mod model_update;
mod resolver;

pub use change_action::{Change, ChangeAction, ChangeKind, ChangeScope, Trigger};
pub use engine::{CycleReport, EngineHandle, EngineSnapshot, EngineState, ReconciliationEngine};
pub use entity_holder::{Entity, EntityHolder, Lifecycle};
pub use error::{ActionError, ResolveError, UpdateError};
pub use events::{EventSink, ReconcilerEvent, ReconcilerEventType};
pub use model_update::{AppliedUpdate, Model, ModelUpdateAction, TreeMutation, TAG_LAST_CHANGE, TAG_LAST_TRIGGER};
pub use resolver::DifferenceResolver;
