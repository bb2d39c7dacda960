//! Caller-facing graph reads and writes.
//!
//! Writes land on the instance only; fixup sees them on the next detection
//! pass, or immediately under notification-based tracking.

use crate::config::ChangeTrackingStrategy;
use crate::fixup::TrackMode;
use crate::graph::NavigationValue;
use crate::identity_map::key_of;
use crate::state_manager::{EntityState, StateManager};
use relgraph_core::{EntityId, Error, InvalidOperationKind, KeyValue, Result, Value};
use std::sync::Arc;

impl StateManager {
    pub(crate) fn create_instance(&mut self, type_name: &str) -> Result<EntityId> {
        let model = Arc::clone(&self.model);
        let ty = model
            .find_entity_type(type_name)
            .ok_or_else(|| unknown_entity_type(type_name))?;
        let id = self.graph.create(ty);
        tracing::trace!(entity = %id, entity_type = type_name, "Created instance");
        Ok(id)
    }

    pub(crate) fn set_instance_value(&mut self, id: EntityId, name: &str, value: Value) -> Result<()> {
        let p = self.property_index(id, name)?;
        self.check_value_kind(id, p, &value)?;
        let current = self.graph.value(id, p);
        if current != value && self.state_of(id).is_persisted() {
            self.check_persisted_write(id, p)?;
        }
        self.graph.instance_mut(id)?.values[p] = value;
        self.after_caller_write(id)
    }

    pub(crate) fn instance_value(&self, id: EntityId, name: &str) -> Result<Value> {
        let p = self.property_index(id, name)?;
        Ok(self.graph.value(id, p))
    }

    pub(crate) fn set_instance_reference(
        &mut self,
        id: EntityId,
        name: &str,
        target: Option<EntityId>,
    ) -> Result<()> {
        let nav = self.navigation_index(id, name)?;
        self.require_navigation_shape(id, nav, false)?;
        if let Some(target) = target {
            self.check_navigation_target(id, nav, target)?;
        }
        self.graph.instance_mut(id)?.navigations[nav] = NavigationValue::Reference(target);
        self.after_caller_write(id)
    }

    pub(crate) fn instance_reference(&self, id: EntityId, name: &str) -> Result<Option<EntityId>> {
        let nav = self.navigation_index(id, name)?;
        self.require_navigation_shape(id, nav, false)?;
        Ok(self
            .graph
            .navigation(id, nav)
            .and_then(NavigationValue::reference))
    }

    /// Insert `member` into a collection navigation, or remove it. Returns
    /// whether the collection changed.
    pub(crate) fn write_collection(
        &mut self,
        id: EntityId,
        name: &str,
        member: EntityId,
        insert: bool,
    ) -> Result<bool> {
        let nav = self.navigation_index(id, name)?;
        self.require_navigation_shape(id, nav, true)?;
        if insert {
            self.check_navigation_target(id, nav, member)?;
        }
        let navigation = &mut self.graph.instance_mut(id)?.navigations[nav];
        let changed = if insert {
            navigation.insert(member)
        } else {
            navigation.remove(member)
        };
        if changed {
            self.after_caller_write(id)?;
        }
        Ok(changed)
    }

    pub(crate) fn instance_collection(&self, id: EntityId, name: &str) -> Result<Vec<EntityId>> {
        let nav = self.navigation_index(id, name)?;
        self.require_navigation_shape(id, nav, true)?;
        Ok(self
            .graph
            .navigation(id, nav)
            .map(NavigationValue::targets)
            .unwrap_or_default())
    }

    fn after_caller_write(&mut self, id: EntityId) -> Result<()> {
        if self.config.change_tracking == ChangeTrackingStrategy::Notifications && self.is_tracked(id) {
            self.detect_entity_changes(id)?;
        }
        Ok(())
    }

    fn check_value_kind(&self, id: EntityId, property: usize, value: &Value) -> Result<()> {
        let ty = self.entity_type_of(id)?;
        let kind = ty.property(property).kind();
        if value.fits(kind) {
            return Ok(());
        }
        Err(Error::invalid(
            InvalidOperationKind::TypeMismatch,
            format!(
                "cannot write a {} value to '{}.{}' of kind {}",
                value.type_name(),
                ty.name(),
                ty.property(property).name(),
                kind.name()
            ),
        ))
    }

    /// Keys and read-only properties are fixed once the entity is in the store.
    fn check_persisted_write(&self, id: EntityId, property: usize) -> Result<()> {
        let ty = self.entity_type_of(id)?;
        let name = ty.property(property).name();
        let is_key = ty
            .keys()
            .iter()
            .any(|k| self.model.key(*k).properties().contains(&property));
        if is_key {
            return Err(Error::invalid(
                InvalidOperationKind::KeyModified,
                format!(
                    "key property '{}.{}' of entity {} cannot change once the entity is in the store",
                    ty.name(),
                    name,
                    id
                ),
            ));
        }
        if ty.property(property).is_read_only_after_save() {
            return Err(Error::invalid(
                InvalidOperationKind::ReadOnlyProperty,
                format!(
                    "property '{}.{}' of entity {} is read-only after save",
                    ty.name(),
                    name,
                    id
                ),
            ));
        }
        Ok(())
    }

    fn require_navigation_shape(&self, id: EntityId, nav: usize, collection: bool) -> Result<()> {
        let ty = self.entity_type_of(id)?;
        let navigation = ty.navigation(nav);
        if navigation.is_collection() == collection {
            return Ok(());
        }
        let shape = if navigation.is_collection() {
            "a collection"
        } else {
            "a reference"
        };
        Err(Error::invalid(
            InvalidOperationKind::InvalidNavigationTarget,
            format!(
                "navigation '{}.{}' is {} navigation",
                ty.name(),
                navigation.name(),
                shape
            ),
        ))
    }

    fn check_navigation_target(&self, id: EntityId, nav: usize, target: EntityId) -> Result<()> {
        let ty = self.entity_type_of(id)?;
        let navigation = ty.navigation(nav);
        let fk = self.model.foreign_key(navigation.foreign_key());
        let expected = if navigation.is_on_dependent() {
            fk.principal_type()
        } else {
            fk.dependent_type()
        };
        let actual = self.graph.instance(target)?.entity_type;
        if self.model.is_assignable(expected, actual) {
            return Ok(());
        }
        Err(Error::invalid(
            InvalidOperationKind::InvalidNavigationTarget,
            format!(
                "navigation '{}.{}' expects '{}' but entity {} is a '{}'",
                ty.name(),
                navigation.name(),
                self.model.entity_type(expected).name(),
                target,
                self.model.entity_type(actual).name()
            ),
        ))
    }

    // ------------------------------------------------------------------
    // Tracking entry points
    // ------------------------------------------------------------------

    pub(crate) fn add_graph(&mut self, id: EntityId) -> Result<()> {
        match self.state_of(id) {
            EntityState::Detached => {
                let tracked = self.track_graph(id, TrackMode::Add)?;
                tracing::debug!(entity = %id, count = tracked.len(), "Added graph");
            }
            EntityState::Deleted => self.restore_deleted(id),
            EntityState::Unchanged | EntityState::Modified | EntityState::Added => {}
        }
        Ok(())
    }

    pub(crate) fn attach_graph(&mut self, id: EntityId) -> Result<()> {
        if self.is_tracked(id) {
            return Ok(());
        }
        let tracked = self.track_graph(id, TrackMode::Attach)?;
        tracing::debug!(entity = %id, count = tracked.len(), "Attached graph");
        Ok(())
    }

    /// Resolve a row loaded from the store against the identity map.
    pub(crate) fn materialize(&mut self, type_name: &str, values: &[(&str, Value)]) -> Result<EntityId> {
        let model = Arc::clone(&self.model);
        let ty = model
            .find_entity_type(type_name)
            .ok_or_else(|| unknown_entity_type(type_name))?;
        let mut row = vec![Value::Null; ty.properties().len()];
        for (name, value) in values {
            let p = ty.property_index(name).ok_or_else(|| {
                Error::invalid(
                    InvalidOperationKind::UnknownProperty,
                    format!("entity type '{}' has no property '{}'", ty.name(), name),
                )
            })?;
            if !value.fits(ty.property(p).kind()) {
                return Err(Error::invalid(
                    InvalidOperationKind::TypeMismatch,
                    format!(
                        "cannot load a {} value into '{}.{}'",
                        value.type_name(),
                        ty.name(),
                        name
                    ),
                ));
            }
            row[p] = value.clone();
        }

        let pk = model.key(ty.primary_key());
        let key = key_of(&row, pk.properties());
        if !key.is_complete() {
            return Err(Error::invalid(
                InvalidOperationKind::NullKey,
                format!("cannot materialize '{}' without a complete primary key", ty.name()),
            ));
        }
        if let Some(existing) = self.identity_map.find(pk.id(), &key) {
            let existing_type = self.require_tracked(existing)?.entity_type;
            if model.is_assignable(ty.id(), existing_type) {
                tracing::trace!(entity = %existing, entity_type = type_name, "Resolved row to tracked instance");
                return Ok(existing);
            }
            return Err(Error::invalid(
                InvalidOperationKind::IdentityConflict,
                format!(
                    "row of '{}' resolves to entity {} of unrelated type '{}'",
                    ty.name(),
                    existing,
                    model.entity_type(existing_type).name()
                ),
            ));
        }

        let id = self.graph.create(ty);
        self.graph.instance_mut(id)?.values = row;
        self.track_single(id, EntityState::Unchanged)?;
        tracing::debug!(entity = %id, entity_type = type_name, "Materialized entity");
        Ok(id)
    }

    pub(crate) fn find_tracked(&self, type_name: &str, key: &[Value]) -> Result<Option<EntityId>> {
        let ty = self.find_entity_type(type_name)?;
        let pk = self.model.key(ty.primary_key());
        let key = KeyValue::new(key.to_vec());
        Ok(self.identity_map.find(pk.id(), &key).filter(|found| {
            self.entry(*found)
                .is_some_and(|e| self.model.is_assignable(ty.id(), e.entity_type))
        }))
    }
}

fn unknown_entity_type(name: &str) -> Error {
    Error::invalid(
        InvalidOperationKind::UnknownEntityType,
        format!("the model has no entity type '{}'", name),
    )
}
