//! Per-entity views of a tracking context.
//!
//! [`EntityEntry`] and [`PropertyEntry`] are thin handles; every call goes
//! through the context, so the same reentrancy and auto-detect rules apply.

use crate::TrackingContext;
use crate::state_manager::{EntityState, StateManager};
use relgraph_core::{EntityId, Error, InvalidOperationKind, Result, Store, Value};

/// Tracking information for one entity.
pub struct EntityEntry<'a, S: Store> {
    context: &'a TrackingContext<S>,
    entity: EntityId,
}

impl<'a, S: Store> EntityEntry<'a, S> {
    pub(crate) fn new(context: &'a TrackingContext<S>, entity: EntityId) -> Self {
        Self { context, entity }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Current state; `Detached` if the entity is not tracked.
    pub fn state(&self) -> Result<EntityState> {
        let entity = self.entity;
        self.context.run("entry.state", true, |state| {
            state.graph.instance(entity)?;
            Ok(state.state_of(entity))
        })
    }

    /// Move this entity, and only this entity, to `new_state`.
    ///
    /// Setting an `Added` entity to `Deleted` detaches it, since there is
    /// nothing in the store to delete.
    pub fn set_state(&self, new_state: EntityState) -> Result<()> {
        let entity = self.entity;
        self.context
            .run("entry.set_state", true, |state| state.change_state(entity, new_state))
    }

    /// Tracking information for the property called `name`.
    pub fn property(&self, name: &str) -> Result<PropertyEntry<'a, S>> {
        let entity = self.entity;
        let index = self.context.run("entry.property", false, |state| {
            state.property_index(entity, name)
        })?;
        Ok(PropertyEntry {
            context: self.context,
            entity,
            property: index,
            name: name.to_string(),
        })
    }

    /// Names of the properties currently flagged as modified.
    pub fn modified_properties(&self) -> Result<Vec<String>> {
        let entity = self.entity;
        self.context.run("entry.modified_properties", true, |state| {
            let ty = state.entity_type_of(entity)?;
            let Some(entry) = state.entry(entity) else {
                return Ok(Vec::new());
            };
            Ok(entry
                .modified
                .iter()
                .enumerate()
                .filter(|(_, modified)| **modified)
                .map(|(p, _)| ty.property(p).name().to_string())
                .collect())
        })
    }
}

/// Tracking information for one property of one entity.
pub struct PropertyEntry<'a, S: Store> {
    context: &'a TrackingContext<S>,
    entity: EntityId,
    property: usize,
    name: String,
}

impl<S: Store> PropertyEntry<'_, S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_value(&self) -> Result<Value> {
        self.context.value(self.entity, &self.name)
    }

    pub fn set_current_value(&self, value: impl Into<Value>) -> Result<()> {
        self.context.set_value(self.entity, &self.name, value)
    }

    /// Value as known to the store; `None` for entities not in the store.
    pub fn original_value(&self) -> Result<Option<Value>> {
        let (entity, property) = (self.entity, self.property);
        self.context.run("property.original_value", true, |state| {
            Ok(state
                .entry(entity)
                .and_then(|e| e.original_values.as_ref())
                .and_then(|values| values.get(property).cloned()))
        })
    }

    pub fn is_modified(&self) -> Result<bool> {
        let (entity, property) = (self.entity, self.property);
        self.context.run("property.is_modified", true, |state| {
            Ok(state
                .entry(entity)
                .is_some_and(|e| e.modified.get(property).copied().unwrap_or(false)))
        })
    }

    /// Flag the property as modified, or clear the flag.
    ///
    /// Only meaningful for `Unchanged` and `Modified` entities; the entity
    /// state follows the flags.
    pub fn set_modified(&self, modified: bool) -> Result<()> {
        let (entity, property) = (self.entity, self.property);
        self.context.run("property.set_modified", true, |state| {
            state.require_tracked(entity)?;
            state.set_property_modified(entity, property, modified);
            Ok(())
        })
    }

    /// Whether the current value is a placeholder awaiting a store-generated value.
    pub fn is_temporary(&self) -> Result<bool> {
        let (entity, property) = (self.entity, self.property);
        self.context.run("property.is_temporary", true, |state| {
            Ok(state.is_temporary(entity, property))
        })
    }
}

impl StateManager {
    pub(crate) fn property_index(&self, id: EntityId, name: &str) -> Result<usize> {
        let ty = self.entity_type_of(id)?;
        ty.property_index(name).ok_or_else(|| {
            Error::invalid(
                InvalidOperationKind::UnknownProperty,
                format!("entity type '{}' has no property '{}'", ty.name(), name),
            )
        })
    }

    pub(crate) fn navigation_index(&self, id: EntityId, name: &str) -> Result<usize> {
        let ty = self.entity_type_of(id)?;
        ty.navigation_index(name).ok_or_else(|| {
            Error::invalid(
                InvalidOperationKind::UnknownNavigation,
                format!("entity type '{}' has no navigation '{}'", ty.name(), name),
            )
        })
    }

    /// Explicit state change of a single entity.
    pub(crate) fn change_state(&mut self, id: EntityId, new_state: EntityState) -> Result<()> {
        self.graph.instance(id)?;
        let old_state = self.state_of(id);
        if old_state == new_state {
            return Ok(());
        }
        match (old_state, new_state) {
            (EntityState::Detached, EntityState::Deleted) => {
                self.track_single(id, EntityState::Unchanged)?;
                self.set_entry_state(id, EntityState::Deleted);
            }
            (EntityState::Detached, state) => self.track_single(id, state)?,
            (EntityState::Added, EntityState::Deleted) => {
                self.set_entry_state(id, EntityState::Detached);
            }
            (_, state) => {
                if state == EntityState::Added {
                    self.check_trackable(id, state)?;
                }
                self.set_entry_state(id, state);
            }
        }
        tracing::debug!(
            entity = %id,
            old_state = %old_state,
            new_state = %new_state,
            "Entity state set explicitly"
        );
        Ok(())
    }

    /// Undo a pending deletion: back to `Modified` if any property still
    /// differs from the store, `Unchanged` otherwise.
    pub(crate) fn restore_deleted(&mut self, id: EntityId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.state != EntityState::Deleted {
            return;
        }
        let new_state = if entry.has_modified_properties() {
            EntityState::Modified
        } else {
            EntityState::Unchanged
        };
        entry.state = new_state;
        self.record_transition(id, EntityState::Deleted, new_state);
    }
}
