//! Entry bookkeeping for tracked entities.
//!
//! The state manager owns one [`InternalEntry`] per tracked instance: its
//! lifecycle state, original values, per-property modified and temporary
//! flags, and the snapshot that change detection diffs against. Fixup
//! writes update the instance and the snapshot together, so they never show
//! up as caller changes.

use crate::config::TrackerConfig;
use crate::graph::{EntityGraph, NavigationValue};
use crate::identity_map::{IdentityMap, key_of};
use relgraph_core::{
    EntityId, EntityType, EntityTypeId, Error, ForeignKey, ForeignKeyId, InvalidOperationKind,
    KeyValue, Model, Result, Value, ValueGenerated, ValueKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of an entity in a tracking context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Not tracked.
    Detached,
    /// Tracked and in sync with the store.
    Unchanged,
    /// Tracked and not yet in the store; saving inserts it.
    Added,
    /// Tracked with changed properties; saving updates it.
    Modified,
    /// Tracked and marked for deletion; saving deletes it.
    Deleted,
}

impl EntityState {
    pub fn is_tracked(self) -> bool {
        self != EntityState::Detached
    }

    /// Whether saving writes this entity.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    /// Whether the entity is known to exist in the store.
    pub fn is_persisted(self) -> bool {
        matches!(
            self,
            EntityState::Unchanged | EntityState::Modified | EntityState::Deleted
        )
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityState::Detached => "Detached",
            EntityState::Unchanged => "Unchanged",
            EntityState::Added => "Added",
            EntityState::Modified => "Modified",
            EntityState::Deleted => "Deleted",
        };
        f.write_str(name)
    }
}

/// A state transition observed by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub entity: EntityId,
    pub entity_type: String,
    pub old_state: EntityState,
    pub new_state: EntityState,
}

/// Values and navigations as of the last detection pass or fixup write.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub(crate) values: Vec<Value>,
    pub(crate) navigations: Vec<NavigationValue>,
}

#[derive(Debug, Clone)]
pub(crate) struct InternalEntry {
    pub(crate) entity: EntityId,
    pub(crate) entity_type: EntityTypeId,
    pub(crate) state: EntityState,
    /// Values as known to the store; `None` while `Added`.
    pub(crate) original_values: Option<Vec<Value>>,
    pub(crate) modified: Vec<bool>,
    pub(crate) temporary: Vec<bool>,
    pub(crate) snapshot: Snapshot,
    /// Required relationships severed without a replacement principal.
    pub(crate) conceptual_nulls: BTreeSet<ForeignKeyId>,
}

impl InternalEntry {
    pub(crate) fn has_modified_properties(&self) -> bool {
        self.modified.iter().any(|m| *m)
    }

    pub(crate) fn has_temporary_values(&self) -> bool {
        self.temporary.iter().any(|t| *t)
    }
}

const TEMPORARY_TEXT_PREFIX: &str = "__relgraph_temporary_";

#[derive(Debug, Clone)]
pub(crate) struct StateManager {
    pub(crate) model: Arc<Model>,
    pub(crate) config: TrackerConfig,
    pub(crate) graph: EntityGraph,
    pub(crate) entries: BTreeMap<EntityId, InternalEntry>,
    pub(crate) identity_map: IdentityMap,
    /// Transitions not yet reported by a detection pass.
    pub(crate) transitions: Vec<StateChange>,
    /// Principal claimed for a dependent by a navigation write during the
    /// current pass.
    pub(crate) claims: HashMap<(EntityId, ForeignKeyId), EntityId>,
    /// Severed required dependents to delete once the current operation
    /// has settled.
    pub(crate) pending_orphans: BTreeSet<EntityId>,
    temporary_counter: i64,
}

impl StateManager {
    pub(crate) fn new(model: Arc<Model>, config: TrackerConfig) -> Self {
        Self {
            model,
            config,
            graph: EntityGraph::new(),
            entries: BTreeMap::new(),
            identity_map: IdentityMap::new(),
            transitions: Vec::new(),
            claims: HashMap::new(),
            pending_orphans: BTreeSet::new(),
            temporary_counter: 0,
        }
    }

    /// Run one tracker operation, settling orphans afterwards. On error every
    /// change it made is undone.
    pub(crate) fn atomically<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let checkpoint = self.clone();
        self.claims.clear();
        self.transitions.clear();
        let result = match f(self) {
            Ok(value) => self.process_pending_orphans().map(|()| value),
            Err(e) => Err(e),
        };
        self.claims.clear();
        if result.is_err() {
            *self = checkpoint;
        }
        result
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub(crate) fn entity_type_of(&self, id: EntityId) -> Result<&EntityType> {
        let instance = self.graph.instance(id)?;
        Ok(self.model.entity_type(instance.entity_type))
    }

    pub(crate) fn entity_type_name(&self, id: EntityId) -> String {
        self.graph
            .get(id)
            .map(|i| self.model.entity_type(i.entity_type).name().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn find_entity_type(&self, name: &str) -> Result<&EntityType> {
        self.model.find_entity_type(name).ok_or_else(|| {
            Error::invalid(
                InvalidOperationKind::UnknownEntityType,
                format!("the model has no entity type '{}'", name),
            )
        })
    }

    pub(crate) fn entry(&self, id: EntityId) -> Option<&InternalEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn entry_mut(&mut self, id: EntityId) -> Option<&mut InternalEntry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn is_tracked(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn state_of(&self, id: EntityId) -> EntityState {
        self.entry(id).map_or(EntityState::Detached, |e| e.state)
    }

    pub(crate) fn require_tracked(&self, id: EntityId) -> Result<&InternalEntry> {
        self.graph.instance(id)?;
        self.entry(id).ok_or_else(|| {
            Error::invalid(
                InvalidOperationKind::NotTracked,
                format!(
                    "'{}' entity {} is not tracked by this context",
                    self.entity_type_name(id),
                    id
                ),
            )
        })
    }

    /// Value as last observed: the snapshot for tracked entities, the
    /// instance otherwise.
    pub(crate) fn snapshot_value(&self, id: EntityId, property: usize) -> Value {
        match self.entry(id) {
            Some(entry) => entry
                .snapshot
                .values
                .get(property)
                .cloned()
                .unwrap_or(Value::Null),
            None => self.graph.value(id, property),
        }
    }

    pub(crate) fn snapshot_key(&self, id: EntityId, properties: &[usize]) -> KeyValue {
        match self.entry(id) {
            Some(entry) => key_of(&entry.snapshot.values, properties),
            None => KeyValue::new(self.graph.values_of(id, properties)),
        }
    }

    pub(crate) fn snapshot_navigation(&self, id: EntityId, navigation: usize) -> Option<&NavigationValue> {
        match self.entry(id) {
            Some(entry) => entry.snapshot.navigations.get(navigation),
            None => self.graph.navigation(id, navigation),
        }
    }

    pub(crate) fn snapshot_reference(&self, id: EntityId, navigation: usize) -> Option<EntityId> {
        self.snapshot_navigation(id, navigation)
            .and_then(NavigationValue::reference)
    }

    pub(crate) fn foreign_key_value(&self, id: EntityId, fk: &ForeignKey) -> KeyValue {
        self.snapshot_key(id, fk.properties())
    }

    pub(crate) fn principal_key_value(&self, id: EntityId, fk: &ForeignKey) -> KeyValue {
        self.snapshot_key(id, self.model.key(fk.principal_key()).properties())
    }

    pub(crate) fn is_temporary(&self, id: EntityId, property: usize) -> bool {
        self.entry(id)
            .and_then(|e| e.temporary.get(property))
            .copied()
            .unwrap_or(false)
    }

    /// The tracked principal whose key for `fk` equals `key`.
    pub(crate) fn find_principal(&self, fk: &ForeignKey, key: &KeyValue) -> Option<EntityId> {
        if !key.is_complete() {
            return None;
        }
        let candidate = self.identity_map.find(fk.principal_key(), key)?;
        let entry = self.entry(candidate)?;
        self.model
            .is_assignable(fk.principal_type(), entry.entity_type)
            .then_some(candidate)
    }

    /// The principal `dependent` is linked to through `fk`, by navigation or by key.
    pub(crate) fn principal_of(&self, dependent: EntityId, fk: &ForeignKey) -> Option<EntityId> {
        if let Some(nav) = fk.dependent_navigation() {
            if let Some(target) = self.snapshot_reference(dependent, nav) {
                if self.is_tracked(target) {
                    return Some(target);
                }
            }
        }
        self.find_principal(fk, &self.foreign_key_value(dependent, fk))
    }

    /// Tracked dependents linked to `principal` through `fk`, in id order.
    pub(crate) fn dependents_of(&self, principal: EntityId, fk: &ForeignKey) -> Vec<EntityId> {
        let mut found = BTreeSet::new();
        if let Some(nav) = fk.principal_navigation() {
            if let Some(value) = self.snapshot_navigation(principal, nav) {
                found.extend(value.targets().into_iter().filter(|t| self.is_tracked(*t)));
            }
        }
        let key = self.principal_key_value(principal, fk);
        if key.is_complete() {
            for dependent in self.identity_map.dependents(fk.id(), &key) {
                let nav_target = fk
                    .dependent_navigation()
                    .and_then(|nav| self.snapshot_reference(dependent, nav));
                if nav_target.is_none_or(|t| t == principal) {
                    found.insert(dependent);
                }
            }
        }
        found.remove(&principal);
        found.into_iter().collect()
    }

    /// Key description for messages; values only with sensitive logging.
    pub(crate) fn describe_key(&self, key: &KeyValue) -> String {
        if self.config.sensitive_data_logging {
            format!("key {}", key)
        } else {
            "the same key".to_string()
        }
    }

    // ------------------------------------------------------------------
    // Temporary values
    // ------------------------------------------------------------------

    /// A placeholder unique within this context, if `kind` has any.
    pub(crate) fn next_temporary_value(&mut self, kind: ValueKind) -> Option<Value> {
        let value = match kind {
            ValueKind::Int => {
                let n = self.temporary_counter + 1;
                Value::Int(i32::try_from(-n).ok()?)
            }
            ValueKind::BigInt => Value::BigInt(-(self.temporary_counter + 1)),
            ValueKind::Text => Value::Text(format!(
                "{}{}",
                TEMPORARY_TEXT_PREFIX,
                self.temporary_counter + 1
            )),
            ValueKind::Uuid => {
                let mut bytes = [0xFF_u8; 16];
                bytes[8..].copy_from_slice(&(self.temporary_counter + 1).to_be_bytes());
                Value::Uuid(bytes)
            }
            _ => return None,
        };
        self.temporary_counter += 1;
        Some(value)
    }

    /// Give every unset store-generated key property a placeholder.
    pub(crate) fn assign_temporary_values(&mut self, id: EntityId) {
        let model = Arc::clone(&self.model);
        let Some(type_id) = self.entry(id).map(|e| e.entity_type) else {
            return;
        };
        let ty = model.entity_type(type_id);
        let key_properties: BTreeSet<usize> = ty
            .keys()
            .iter()
            .flat_map(|k| model.key(*k).properties().iter().copied())
            .collect();
        for p in key_properties {
            let property = ty.property(p);
            if property.value_generated() != ValueGenerated::OnAdd
                || !self.snapshot_value(id, p).is_null()
            {
                continue;
            }
            let Some(value) = self.next_temporary_value(property.kind()) else {
                continue;
            };
            tracing::trace!(
                entity = %id,
                property = property.name(),
                "Assigned temporary value"
            );
            if let Some(instance) = self.graph.get_mut(id) {
                instance.values[p] = value.clone();
            }
            if let Some(entry) = self.entry_mut(id) {
                entry.snapshot.values[p] = value;
                entry.temporary[p] = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Tracking
    // ------------------------------------------------------------------

    /// Check that `id` can be tracked in `state` without breaking identity.
    pub(crate) fn check_trackable(&self, id: EntityId, state: EntityState) -> Result<()> {
        let ty = self.entity_type_of(id)?;
        let instance = self.graph.instance(id)?;
        let pk = self.model.key(ty.primary_key());
        let fk_properties: BTreeSet<usize> = ty
            .foreign_keys()
            .iter()
            .flat_map(|fk| self.model.foreign_key(*fk).properties().iter().copied())
            .collect();
        for &p in pk.properties() {
            let property = ty.property(p);
            let unset = instance.values[p].is_null();
            let filled_later = fk_properties.contains(&p)
                || (state == EntityState::Added
                    && property.value_generated() == ValueGenerated::OnAdd);
            if unset && !filled_later {
                return Err(Error::invalid(
                    InvalidOperationKind::NullKey,
                    format!(
                        "cannot track '{}' entity {} in state {} because key property '{}' is NULL",
                        ty.name(),
                        id,
                        state,
                        property.name()
                    ),
                ));
            }
        }
        let key = key_of(&instance.values, pk.properties());
        if let Some(other) = self.identity_map.find(pk.id(), &key) {
            if other != id && !self.takes_over_key(state, other) {
                return Err(Error::invalid(
                    InvalidOperationKind::IdentityConflict,
                    format!(
                        "cannot track '{}' entity {} because entity {} with {} is already tracked",
                        ty.name(),
                        id,
                        other,
                        self.describe_key(&key)
                    ),
                ));
            }
        }
        Ok(())
    }

    /// An added entity may reuse the key of a deleted one; saving turns
    /// the pair into an update of the same row.
    pub(crate) fn takes_over_key(&self, state: EntityState, holder: EntityId) -> bool {
        state == EntityState::Added && self.state_of(holder) == EntityState::Deleted
    }

    /// Create the entry for an untracked instance. No fixup runs.
    pub(crate) fn start_tracking(&mut self, id: EntityId, state: EntityState) -> Result<()> {
        let instance = self.graph.instance(id)?;
        let entity_type = instance.entity_type;
        let values = instance.values.clone();
        let navigations = instance.navigations.clone();
        let count = values.len();
        self.entries.insert(
            id,
            InternalEntry {
                entity: id,
                entity_type,
                state,
                original_values: (state != EntityState::Added).then(|| values.clone()),
                modified: vec![false; count],
                temporary: vec![false; count],
                snapshot: Snapshot {
                    values,
                    navigations,
                },
                conceptual_nulls: BTreeSet::new(),
            },
        );
        match state {
            EntityState::Added => self.assign_temporary_values(id),
            EntityState::Modified => self.mark_all_modified(id),
            _ => {}
        }
        self.reindex(id);
        self.record_transition(id, EntityState::Detached, state);
        Ok(())
    }

    /// Forget `id`: drop its entry and unlink it from every tracked navigation.
    pub(crate) fn stop_tracking(&mut self, id: EntityId) {
        if self.entries.remove(&id).is_none() {
            return;
        }
        self.identity_map.remove(id);
        self.pending_orphans.remove(&id);
        self.claims.retain(|(dependent, _), principal| *dependent != id && *principal != id);

        let mut pointing = Vec::new();
        for (other, entry) in &self.entries {
            for (nav, value) in entry.snapshot.navigations.iter().enumerate() {
                if value.contains(id) {
                    pointing.push((*other, nav));
                }
            }
        }
        for (other, nav) in pointing {
            self.remove_navigation_target(other, nav, id);
        }
    }

    /// Move a tracked entity to `new_state` without traversal or cascade.
    pub(crate) fn set_entry_state(&mut self, id: EntityId, new_state: EntityState) {
        let old_state = self.state_of(id);
        if old_state == new_state || old_state == EntityState::Detached {
            return;
        }
        if new_state == EntityState::Detached {
            self.stop_tracking(id);
            self.record_transition(id, old_state, new_state);
            return;
        }
        if let Some(entry) = self.entry_mut(id) {
            entry.state = new_state;
            match new_state {
                EntityState::Unchanged => {
                    entry.original_values = Some(entry.snapshot.values.clone());
                    entry.modified.iter_mut().for_each(|m| *m = false);
                }
                EntityState::Added => {
                    entry.original_values = None;
                    entry.modified.iter_mut().for_each(|m| *m = false);
                }
                EntityState::Modified => {
                    if entry.original_values.is_none() {
                        entry.original_values = Some(entry.snapshot.values.clone());
                    }
                }
                EntityState::Deleted | EntityState::Detached => {}
            }
        }
        match new_state {
            EntityState::Added => self.assign_temporary_values(id),
            EntityState::Modified => {
                let has_modified = self
                    .entry(id)
                    .is_some_and(InternalEntry::has_modified_properties);
                if !has_modified {
                    self.mark_all_modified(id);
                }
            }
            _ => {}
        }
        self.reindex(id);
        self.record_transition(id, old_state, new_state);
    }

    /// Mark every non-key property modified.
    fn mark_all_modified(&mut self, id: EntityId) {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let ty = model.entity_type(entry.entity_type);
        let key_properties: BTreeSet<usize> = ty
            .keys()
            .iter()
            .flat_map(|k| model.key(*k).properties().iter().copied())
            .collect();
        for (p, modified) in entry.modified.iter_mut().enumerate() {
            *modified = !key_properties.contains(&p);
        }
        if entry.original_values.is_none() {
            entry.original_values = Some(entry.snapshot.values.clone());
        }
    }

    /// Re-derive the modified flag of `property` after its value changed.
    ///
    /// A property returning to its original value is no longer modified,
    /// and a `Modified` entity with no modified property returns to
    /// `Unchanged`.
    pub(crate) fn note_property_changed(&mut self, id: EntityId, property: usize) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if !matches!(entry.state, EntityState::Unchanged | EntityState::Modified) {
            return;
        }
        let Some(original) = entry.original_values.as_ref().and_then(|o| o.get(property)) else {
            return;
        };
        let differs = entry.snapshot.values.get(property) != Some(original);
        entry.modified[property] = differs;
        let old_state = entry.state;
        let new_state = if entry.has_modified_properties() {
            EntityState::Modified
        } else {
            EntityState::Unchanged
        };
        if old_state != new_state {
            entry.state = new_state;
            self.record_transition(id, old_state, new_state);
        }
    }

    /// Set the modified flag of one property by hand.
    pub(crate) fn set_property_modified(&mut self, id: EntityId, property: usize, modified: bool) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if !matches!(entry.state, EntityState::Unchanged | EntityState::Modified) {
            return;
        }
        entry.modified[property] = modified;
        let old_state = entry.state;
        let new_state = if entry.has_modified_properties() {
            EntityState::Modified
        } else {
            EntityState::Unchanged
        };
        if old_state != new_state {
            entry.state = new_state;
            self.record_transition(id, old_state, new_state);
        }
    }

    pub(crate) fn reindex(&mut self, id: EntityId) {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let ty = model.entity_type(entry.entity_type);
        let deleted = entry.state == EntityState::Deleted;
        self.identity_map.index(&model, id, ty, &entry.snapshot.values, deleted);
    }

    /// Mark every tracked entity as in sync with the store.
    pub(crate) fn accept_all_changes(&mut self) {
        let ids: Vec<EntityId> = self.entries.keys().copied().collect();
        for id in ids {
            match self.state_of(id) {
                EntityState::Deleted => {
                    self.stop_tracking(id);
                    self.record_transition(id, EntityState::Deleted, EntityState::Detached);
                }
                EntityState::Added | EntityState::Modified => {
                    self.set_entry_state(id, EntityState::Unchanged);
                }
                EntityState::Unchanged | EntityState::Detached => {}
            }
            if let Some(entry) = self.entry_mut(id) {
                entry.conceptual_nulls.clear();
                entry.original_values = Some(entry.snapshot.values.clone());
            }
        }
    }

    /// Stop tracking everything. Instances stay in the graph.
    pub(crate) fn clear(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.identity_map.clear();
        self.transitions.clear();
        self.claims.clear();
        self.pending_orphans.clear();
        tracing::debug!(count = count, "Cleared tracking context");
    }

    pub(crate) fn record_transition(&mut self, id: EntityId, old_state: EntityState, new_state: EntityState) {
        let entity_type = self.entity_type_name(id);
        tracing::debug!(
            entity = %id,
            entity_type = %entity_type,
            old_state = %old_state,
            new_state = %new_state,
            "Entity state changed"
        );
        self.transitions.push(StateChange {
            entity: id,
            entity_type,
            old_state,
            new_state,
        });
    }

    pub(crate) fn count(&self, state: EntityState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgraph_core::{EntityTypeDef, PropertyDef};

    fn manager() -> StateManager {
        let model = Model::builder()
            .entity(
                EntityTypeDef::new("Blog")
                    .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                    .property(PropertyDef::new("name", ValueKind::Text).nullable())
                    .primary_key(&["id"]),
            )
            .entity(
                EntityTypeDef::new("Tag")
                    .property(PropertyDef::new("label", ValueKind::Text))
                    .primary_key(&["label"]),
            )
            .build()
            .unwrap();
        StateManager::new(Arc::new(model), TrackerConfig::default())
    }

    fn create(manager: &mut StateManager, type_name: &str) -> EntityId {
        let model = Arc::clone(&manager.model);
        manager.graph.create(model.find_entity_type(type_name).unwrap())
    }

    #[test]
    fn test_added_entities_get_unique_temporary_keys() {
        let mut manager = manager();
        let a = create(&mut manager, "Blog");
        let b = create(&mut manager, "Blog");
        manager.start_tracking(a, EntityState::Added).unwrap();
        manager.start_tracking(b, EntityState::Added).unwrap();

        assert_eq!(manager.snapshot_value(a, 0), Value::BigInt(-1));
        assert_eq!(manager.snapshot_value(b, 0), Value::BigInt(-2));
        assert_eq!(manager.graph.value(b, 0), Value::BigInt(-2));
        assert!(manager.is_temporary(a, 0));
        assert!(!manager.is_temporary(a, 1));
        assert_eq!(manager.count(EntityState::Added), 2);
    }

    #[test]
    fn test_temporary_values_per_kind() {
        let mut manager = manager();
        assert_eq!(manager.next_temporary_value(ValueKind::Int), Some(Value::Int(-1)));
        assert!(matches!(
            manager.next_temporary_value(ValueKind::Text),
            Some(Value::Text(s)) if s.starts_with(TEMPORARY_TEXT_PREFIX)
        ));
        assert!(matches!(manager.next_temporary_value(ValueKind::Uuid), Some(Value::Uuid(_))));
        assert_eq!(manager.next_temporary_value(ValueKind::Bool), None);
        assert_eq!(manager.next_temporary_value(ValueKind::BigInt), Some(Value::BigInt(-4)));
    }

    #[test]
    fn test_identity_conflict_and_null_key() {
        let mut manager = manager();
        let first = create(&mut manager, "Tag");
        let second = create(&mut manager, "Tag");
        let unset = create(&mut manager, "Tag");
        for id in [first, second] {
            manager.graph.get_mut(id).unwrap().values[0] = Value::from("rust");
        }
        manager.start_tracking(first, EntityState::Unchanged).unwrap();

        let err = manager
            .check_trackable(second, EntityState::Unchanged)
            .unwrap_err();
        assert_eq!(
            err.invalid_operation_kind(),
            Some(InvalidOperationKind::IdentityConflict)
        );
        assert!(err.to_string().contains("the same key"));

        let err = manager.check_trackable(unset, EntityState::Added).unwrap_err();
        assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::NullKey));

        // Once deleted, the key may be taken over by an added entity only.
        manager.set_entry_state(first, EntityState::Deleted);
        manager.check_trackable(second, EntityState::Added).unwrap();
        assert!(manager.check_trackable(second, EntityState::Unchanged).is_err());
    }

    #[test]
    fn test_property_changes_toggle_modified() {
        let mut manager = manager();
        let blog = create(&mut manager, "Blog");
        manager.graph.get_mut(blog).unwrap().values[0] = Value::BigInt(1);
        manager.start_tracking(blog, EntityState::Unchanged).unwrap();

        manager.entry_mut(blog).unwrap().snapshot.values[1] = Value::from("renamed");
        manager.note_property_changed(blog, 1);
        assert_eq!(manager.state_of(blog), EntityState::Modified);

        manager.entry_mut(blog).unwrap().snapshot.values[1] = Value::Null;
        manager.note_property_changed(blog, 1);
        assert_eq!(manager.state_of(blog), EntityState::Unchanged);

        manager.set_property_modified(blog, 1, true);
        assert_eq!(manager.state_of(blog), EntityState::Modified);
        let transitions: Vec<EntityState> =
            manager.transitions.iter().map(|t| t.new_state).collect();
        assert_eq!(
            transitions,
            vec![
                EntityState::Unchanged,
                EntityState::Modified,
                EntityState::Unchanged,
                EntityState::Modified
            ]
        );
    }

    #[test]
    fn test_accept_all_changes() {
        let mut manager = manager();
        let added = create(&mut manager, "Blog");
        let deleted = create(&mut manager, "Blog");
        manager.graph.get_mut(deleted).unwrap().values[0] = Value::BigInt(5);
        manager.start_tracking(added, EntityState::Added).unwrap();
        manager.start_tracking(deleted, EntityState::Unchanged).unwrap();
        manager.set_entry_state(deleted, EntityState::Deleted);

        manager.accept_all_changes();
        assert_eq!(manager.state_of(added), EntityState::Unchanged);
        assert_eq!(manager.state_of(deleted), EntityState::Detached);
        assert!(manager.entry(added).unwrap().original_values.is_some());
        assert_eq!(manager.identity_map.len(), 1);
    }
}
