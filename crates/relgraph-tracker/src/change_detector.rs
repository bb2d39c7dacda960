//! Snapshot change detection.
//!
//! Diffs every tracked instance against its snapshot, property writes
//! first and navigation writes second, and hands each write to the fixup
//! handlers. Fixup writes update snapshots as they go, so a pass ends once
//! a round observes nothing new; a second pass over an unchanged graph is
//! a no-op.

use crate::graph::NavigationValue;
use crate::identity_map::key_of;
use crate::state_manager::{StateChange, StateManager};
use relgraph_core::{EntityId, Error, InvalidOperationKind, Result};
use serde::Serialize;
use std::sync::Arc;

/// Rounds after which a pass that still surfaces writes is rejected.
const MAX_DETECTION_ROUNDS: usize = 32;

/// A property whose value changed since it was last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyChange {
    pub entity: EntityId,
    pub entity_type: String,
    pub property: String,
}

/// What happened at one relationship end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelationshipChangeKind {
    /// The dependent's foreign key was written.
    ForeignKey,
    /// A reference navigation was written.
    Reference,
    /// A member was added to a collection navigation.
    CollectionAdded,
    /// A member was removed from a collection navigation.
    CollectionRemoved,
}

/// A write observed at one relationship end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationshipChange {
    pub entity: EntityId,
    pub foreign_key: String,
    /// Navigation written, for navigation changes.
    pub navigation: Option<String>,
    pub kind: RelationshipChangeKind,
    /// New reference target or the collection member added or removed.
    pub target: Option<EntityId>,
}

/// Everything one detection pass observed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectedChanges {
    pub modified_properties: Vec<PropertyChange>,
    pub relationship_changes: Vec<RelationshipChange>,
    pub state_changes: Vec<StateChange>,
}

impl DetectedChanges {
    pub fn is_empty(&self) -> bool {
        self.modified_properties.is_empty()
            && self.relationship_changes.is_empty()
            && self.state_changes.is_empty()
    }
}

impl StateManager {
    /// Whether any tracked instance differs from its snapshot.
    pub(crate) fn has_unobserved_writes(&self) -> bool {
        self.entries.iter().any(|(id, entry)| {
            self.graph.get(*id).is_some_and(|instance| {
                instance.values != entry.snapshot.values
                    || instance.navigations != entry.snapshot.navigations
            })
        })
    }

    /// Detect and fix up writes to every tracked instance.
    pub(crate) fn detect_changes(&mut self) -> Result<DetectedChanges> {
        let ids: Vec<EntityId> = self.entries.keys().copied().collect();
        self.detect_in(&ids)
    }

    /// Detect and fix up writes to one instance.
    pub(crate) fn detect_entity_changes(&mut self, id: EntityId) -> Result<DetectedChanges> {
        self.detect_in(&[id])
    }

    fn detect_in(&mut self, ids: &[EntityId]) -> Result<DetectedChanges> {
        self.detect_in_rounds(ids, MAX_DETECTION_ROUNDS)
    }

    fn detect_in_rounds(&mut self, ids: &[EntityId], max_rounds: usize) -> Result<DetectedChanges> {
        let mut changes = DetectedChanges::default();
        self.transitions.clear();
        let mut rounds = 0;
        loop {
            rounds += 1;
            if !self.detect_round(ids, &mut changes)? {
                break;
            }
            if rounds >= max_rounds {
                tracing::warn!(rounds = rounds, "Change detection did not settle");
                return Err(Error::invalid(
                    InvalidOperationKind::DetectionUnsettled,
                    format!("change detection still found writes after {rounds} rounds"),
                ));
            }
        }
        self.process_pending_orphans()?;
        changes.state_changes = std::mem::take(&mut self.transitions);
        if !changes.is_empty() {
            tracing::debug!(
                properties = changes.modified_properties.len(),
                relationships = changes.relationship_changes.len(),
                state_changes = changes.state_changes.len(),
                "Detected changes"
            );
        }
        Ok(changes)
    }

    /// One round: all property writes, then all navigation writes.
    fn detect_round(&mut self, ids: &[EntityId], changes: &mut DetectedChanges) -> Result<bool> {
        let mut found = false;
        for &id in ids {
            let changed = self.changed_properties(id);
            if !changed.is_empty() {
                found = true;
                self.observe_property_writes(id, &changed, changes)?;
            }
        }
        for &id in ids {
            let count = self.entry(id).map_or(0, |e| e.snapshot.navigations.len());
            for navigation in 0..count {
                if self.navigation_changed(id, navigation) {
                    found = true;
                    self.observe_navigation_write(id, navigation, changes)?;
                }
            }
        }
        Ok(found)
    }

    fn changed_properties(&self, id: EntityId) -> Vec<usize> {
        let (Some(entry), Some(instance)) = (self.entry(id), self.graph.get(id)) else {
            return Vec::new();
        };
        instance
            .values
            .iter()
            .zip(&entry.snapshot.values)
            .enumerate()
            .filter(|(_, (current, observed))| current != observed)
            .map(|(p, _)| p)
            .collect()
    }

    fn navigation_changed(&self, id: EntityId, navigation: usize) -> bool {
        let (Some(entry), Some(instance)) = (self.entry(id), self.graph.get(id)) else {
            return false;
        };
        instance.navigations.get(navigation) != entry.snapshot.navigations.get(navigation)
    }

    fn observe_property_writes(
        &mut self,
        id: EntityId,
        changed: &[usize],
        changes: &mut DetectedChanges,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entry(id) else {
            return Ok(());
        };
        let ty = model.entity_type(entry.entity_type);
        let old_values = entry.snapshot.values.clone();
        let current = self.graph.instance(id)?.values.clone();

        for &key_id in ty.keys() {
            let properties = model.key(key_id).properties();
            if !properties.iter().any(|p| changed.contains(p)) {
                continue;
            }
            let key = key_of(&current, properties);
            if let Some(other) = self.identity_map.find(key_id, &key) {
                if other != id && !self.takes_over_key(entry.state, other) {
                    return Err(Error::invalid(
                        InvalidOperationKind::IdentityConflict,
                        format!(
                            "'{}' entity {} now has {} as tracked entity {}",
                            ty.name(),
                            id,
                            self.describe_key(&key),
                            other
                        ),
                    ));
                }
            }
        }

        if let Some(entry) = self.entry_mut(id) {
            for &p in changed {
                entry.snapshot.values[p] = current[p].clone();
                entry.temporary[p] = false;
            }
        }
        for &p in changed {
            changes.modified_properties.push(PropertyChange {
                entity: id,
                entity_type: ty.name().to_string(),
                property: ty.property(p).name().to_string(),
            });
            self.note_property_changed(id, p);
        }
        self.reindex(id);
        tracing::trace!(entity = %id, count = changed.len(), "Observed property writes");

        for &fk_id in ty.foreign_keys() {
            let fk = model.foreign_key(fk_id);
            if !fk.properties().iter().any(|p| changed.contains(p)) {
                continue;
            }
            changes.relationship_changes.push(RelationshipChange {
                entity: id,
                foreign_key: fk.name().to_string(),
                navigation: None,
                kind: RelationshipChangeKind::ForeignKey,
                target: None,
            });
            self.foreign_key_changed(id, fk_id, &key_of(&old_values, fk.properties()))?;
        }
        self.propagate_key_change(id, &old_values, changed);
        Ok(())
    }

    fn observe_navigation_write(
        &mut self,
        id: EntityId,
        navigation: usize,
        changes: &mut DetectedChanges,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entry(id) else {
            return Ok(());
        };
        let nav = model.entity_type(entry.entity_type).navigation(navigation);
        let fk = model.foreign_key(nav.foreign_key());
        let Some(old) = entry.snapshot.navigations.get(navigation).cloned() else {
            return Ok(());
        };
        let Some(current) = self.graph.navigation(id, navigation).cloned() else {
            return Ok(());
        };
        if let Some(slot) = self
            .entry_mut(id)
            .and_then(|e| e.snapshot.navigations.get_mut(navigation))
        {
            *slot = current.clone();
        }

        let mut record = |kind, target| {
            changes.relationship_changes.push(RelationshipChange {
                entity: id,
                foreign_key: fk.name().to_string(),
                navigation: Some(nav.name().to_string()),
                kind,
                target,
            });
        };
        match (&old, &current) {
            (NavigationValue::Collection(before), NavigationValue::Collection(after)) => {
                let added: Vec<EntityId> =
                    after.iter().filter(|m| !before.contains(m)).copied().collect();
                let removed: Vec<EntityId> =
                    before.iter().filter(|m| !after.contains(m)).copied().collect();
                for &member in &added {
                    record(RelationshipChangeKind::CollectionAdded, Some(member));
                }
                for &member in &removed {
                    record(RelationshipChangeKind::CollectionRemoved, Some(member));
                }
                self.collection_changed(id, fk.id(), &added, &removed)
            }
            _ => {
                record(RelationshipChangeKind::Reference, current.reference());
                if nav.is_on_dependent() {
                    self.reference_changed(id, fk.id(), old.reference(), current.reference())
                } else {
                    self.principal_reference_changed(id, fk.id(), old.reference(), current.reference())
                }
            }
        }
    }
}
