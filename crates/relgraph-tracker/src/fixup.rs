//! Relationship fixup.
//!
//! Keeps foreign key values, dependent-side references and principal-side
//! navigations consistent. The handlers here react to one observed write
//! each; writes they make themselves go through the snapshot-aware
//! primitives so they are never mistaken for caller writes.
//!
//! Resolution rules:
//! - a foreign key write links the dependent to the tracked principal with
//!   that key;
//! - a navigation write copies the principal's key into the foreign key,
//!   temporary flags included;
//! - when both were written, the navigation wins.

use crate::config::CascadeTiming;
use crate::graph::NavigationValue;
use crate::identity_map::key_of;
use crate::state_manager::{EntityState, StateManager};
use relgraph_core::{
    DeleteBehavior, EntityId, Error, ForeignKey, ForeignKeyId, KeyValue, RelationshipError,
    RelationshipErrorKind, Result, Value, ValueGenerated,
};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

/// How newly discovered entities enter the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackMode {
    /// Everything becomes `Added`.
    Add,
    /// Set keys become `Unchanged`, unset generated keys `Added`.
    Attach,
    /// Reached through a navigation write: `Added` unless a store-generated
    /// key is already set.
    Discover,
}

impl StateManager {
    // ------------------------------------------------------------------
    // Snapshot-aware primitives
    // ------------------------------------------------------------------

    /// Write a property on behalf of fixup.
    ///
    /// The instance is only overwritten if the caller has not written the
    /// property since the last observation; a pending caller write wins.
    pub(crate) fn write_property(&mut self, id: EntityId, property: usize, value: Value, temporary: bool) {
        let Some(entry) = self.entries.get(&id) else {
            if let Some(slot) = self
                .graph
                .get_mut(id)
                .and_then(|i| i.values.get_mut(property))
            {
                *slot = value;
            }
            return;
        };
        let old_values = entry.snapshot.values.clone();
        let observed = old_values.get(property).cloned().unwrap_or(Value::Null);
        if let Some(slot) = self
            .graph
            .get_mut(id)
            .and_then(|i| i.values.get_mut(property))
        {
            if *slot == observed {
                *slot = value.clone();
            }
        }
        let changed = observed != value;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.snapshot.values[property] = value;
            entry.temporary[property] = temporary;
        }
        self.note_property_changed(id, property);
        self.reindex(id);
        if changed {
            self.propagate_key_change(id, &old_values, &[property]);
        }
    }

    /// Point a reference navigation at `target` on behalf of fixup.
    pub(crate) fn set_reference_fixup(&mut self, id: EntityId, navigation: usize, target: Option<EntityId>) {
        let observed = self
            .entry(id)
            .and_then(|e| e.snapshot.navigations.get(navigation))
            .cloned();
        if let Some(current) = self
            .graph
            .get_mut(id)
            .and_then(|i| i.navigations.get_mut(navigation))
        {
            if observed.as_ref().is_none_or(|o| o == current) {
                *current = NavigationValue::Reference(target);
            }
        }
        if let Some(slot) = self
            .entry_mut(id)
            .and_then(|e| e.snapshot.navigations.get_mut(navigation))
        {
            *slot = NavigationValue::Reference(target);
        }
    }

    fn collection_insert_fixup(&mut self, id: EntityId, navigation: usize, member: EntityId) {
        if let Some(current) = self
            .graph
            .get_mut(id)
            .and_then(|i| i.navigations.get_mut(navigation))
        {
            current.insert(member);
        }
        if let Some(slot) = self
            .entry_mut(id)
            .and_then(|e| e.snapshot.navigations.get_mut(navigation))
        {
            slot.insert(member);
        }
    }

    fn collection_remove_fixup(&mut self, id: EntityId, navigation: usize, member: EntityId) {
        if let Some(current) = self
            .graph
            .get_mut(id)
            .and_then(|i| i.navigations.get_mut(navigation))
        {
            current.remove(member);
        }
        if let Some(slot) = self
            .entry_mut(id)
            .and_then(|e| e.snapshot.navigations.get_mut(navigation))
        {
            slot.remove(member);
        }
    }

    /// Drop `target` from one navigation of `id`, whatever its kind.
    pub(crate) fn remove_navigation_target(&mut self, id: EntityId, navigation: usize, target: EntityId) {
        match self.snapshot_navigation(id, navigation) {
            Some(NavigationValue::Collection(_)) => {
                self.collection_remove_fixup(id, navigation, target);
            }
            Some(NavigationValue::Reference(Some(current))) if *current == target => {
                self.set_reference_fixup(id, navigation, None);
            }
            _ => {}
        }
    }

    fn add_to_inverse(&mut self, principal: EntityId, fk: &ForeignKey, dependent: EntityId) {
        let Some(navigation) = fk.principal_navigation() else {
            return;
        };
        if fk.is_unique() {
            self.set_reference_fixup(principal, navigation, Some(dependent));
        } else {
            self.collection_insert_fixup(principal, navigation, dependent);
        }
    }

    fn remove_from_inverse(&mut self, principal: EntityId, fk: &ForeignKey, dependent: EntityId) {
        if let Some(navigation) = fk.principal_navigation() {
            self.remove_navigation_target(principal, navigation, dependent);
        }
    }

    /// Copy the principal's key into the dependent's foreign key.
    fn copy_key_to_dependent(&mut self, dependent: EntityId, fk: &ForeignKey, principal: EntityId) {
        let model = Arc::clone(&self.model);
        let key_properties = model.key(fk.principal_key()).properties();
        for (&fk_property, &key_property) in fk.properties().iter().zip(key_properties) {
            let value = self.snapshot_value(principal, key_property);
            let temporary = self.is_temporary(principal, key_property);
            if self.snapshot_value(dependent, fk_property) != value
                || self.is_temporary(dependent, fk_property) != temporary
            {
                self.write_property(dependent, fk_property, value, temporary);
            }
        }
    }

    fn null_foreign_key(&mut self, dependent: EntityId, fk: &ForeignKey) {
        for &property in fk.properties() {
            if !self.snapshot_value(dependent, property).is_null() {
                self.write_property(dependent, property, Value::Null, false);
            }
        }
    }

    fn navigation_pending(&self, id: EntityId, navigation: usize) -> bool {
        let current = self.graph.navigation(id, navigation);
        let observed = self
            .entry(id)
            .and_then(|e| e.snapshot.navigations.get(navigation));
        current != observed
    }

    pub(crate) fn mark_conceptual_null(&mut self, dependent: EntityId, fk_id: ForeignKeyId) {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        let delete_orphan = self.config.delete_orphans_timing == CascadeTiming::Immediate
            && fk.delete_behavior() == DeleteBehavior::Cascade;
        let Some(entry) = self.entry_mut(dependent) else {
            return;
        };
        if entry.state == EntityState::Deleted {
            return;
        }
        if entry.conceptual_nulls.insert(fk_id) {
            tracing::debug!(
                entity = %dependent,
                foreign_key = fk.name(),
                "Required relationship severed"
            );
        }
        if delete_orphan {
            self.pending_orphans.insert(dependent);
        }
    }

    fn clear_conceptual_null(&mut self, dependent: EntityId, fk_id: ForeignKeyId) {
        if let Some(entry) = self.entry_mut(dependent) {
            entry.conceptual_nulls.remove(&fk_id);
        }
    }

    pub(crate) fn relationship_error(
        &self,
        kind: RelationshipErrorKind,
        fk: &ForeignKey,
        message: String,
        entities: Vec<EntityId>,
    ) -> Error {
        Error::Relationship(RelationshipError {
            kind,
            message,
            foreign_key: fk.name().to_string(),
            principal_type: self.model.entity_type(fk.principal_type()).name().to_string(),
            dependent_type: self.model.entity_type(fk.dependent_type()).name().to_string(),
            entities,
        })
    }

    // ------------------------------------------------------------------
    // Link and sever
    // ------------------------------------------------------------------

    /// Make `principal` the principal of `dependent` through `fk_id`.
    ///
    /// `previous` names principals the dependent may still be listed
    /// under. With `claim`, the link counts as an explicit navigation
    /// write: a second, different claim in the same pass is ambiguous.
    pub(crate) fn link(
        &mut self,
        dependent: EntityId,
        fk_id: ForeignKeyId,
        principal: EntityId,
        previous: &[EntityId],
        claim: bool,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        if claim {
            if let Some(claimed) = self.claims.insert((dependent, fk_id), principal) {
                if claimed != principal {
                    return Err(self.relationship_error(
                        RelationshipErrorKind::AmbiguousPrincipal,
                        fk,
                        format!(
                            "entity {} was assigned to both {} and {} in the same pass",
                            dependent, claimed, principal
                        ),
                        vec![dependent],
                    ));
                }
            }
        }

        let mut stale: BTreeSet<EntityId> = previous.iter().copied().collect();
        if let Some(navigation) = fk.dependent_navigation() {
            if let Some(target) = self.snapshot_reference(dependent, navigation) {
                stale.insert(target);
            }
        }
        if let Some(by_key) = self.find_principal(fk, &self.foreign_key_value(dependent, fk)) {
            stale.insert(by_key);
        }
        stale.remove(&principal);
        for old in stale {
            self.remove_from_inverse(old, fk, dependent);
        }

        self.copy_key_to_dependent(dependent, fk, principal);
        self.clear_conceptual_null(dependent, fk_id);
        if let Some(navigation) = fk.dependent_navigation() {
            self.set_reference_fixup(dependent, navigation, Some(principal));
        }
        if fk.is_unique() {
            for other in self.dependents_of(principal, fk) {
                if other != dependent {
                    tracing::debug!(
                        entity = %other,
                        replaced_by = %dependent,
                        foreign_key = fk.name(),
                        "Severing previous one-to-one dependent"
                    );
                    self.sever(other, fk_id, principal);
                }
            }
        }
        self.add_to_inverse(principal, fk, dependent);
        tracing::trace!(
            dependent = %dependent,
            principal = %principal,
            foreign_key = fk.name(),
            "Linked relationship"
        );
        Ok(())
    }

    /// Break the link between `dependent` and `principal`.
    ///
    /// An optional foreign key that still addresses the principal is
    /// nulled; a required one is left in place and marked conceptually
    /// null.
    pub(crate) fn sever(&mut self, dependent: EntityId, fk_id: ForeignKeyId, principal: EntityId) {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        self.remove_from_inverse(principal, fk, dependent);
        if let Some(navigation) = fk.dependent_navigation() {
            if self.snapshot_reference(dependent, navigation) == Some(principal) {
                self.set_reference_fixup(dependent, navigation, None);
            }
        }
        let key = self.principal_key_value(principal, fk);
        if !key.is_complete() || self.foreign_key_value(dependent, fk) != key {
            return;
        }
        if fk.is_required() {
            self.mark_conceptual_null(dependent, fk_id);
        } else {
            self.null_foreign_key(dependent, fk);
        }
        tracing::trace!(
            dependent = %dependent,
            principal = %principal,
            foreign_key = fk.name(),
            "Severed relationship"
        );
    }

    /// Push a changed principal key into every dependent that references it.
    pub(crate) fn propagate_key_change(&mut self, principal: EntityId, old_values: &[Value], changed: &[usize]) {
        let model = Arc::clone(&self.model);
        let Some(type_id) = self.entry(principal).map(|e| e.entity_type) else {
            return;
        };
        for &fk_id in model.entity_type(type_id).referencing_foreign_keys() {
            let fk = model.foreign_key(fk_id);
            let key_properties = model.key(fk.principal_key()).properties();
            if !key_properties.iter().any(|p| changed.contains(p)) {
                continue;
            }
            let old_key = key_of(old_values, key_properties);
            let mut dependents: BTreeSet<EntityId> = BTreeSet::new();
            if old_key.is_complete() {
                dependents.extend(self.identity_map.dependents(fk_id, &old_key));
            }
            if let Some(navigation) = fk.principal_navigation() {
                if let Some(value) = self.snapshot_navigation(principal, navigation) {
                    dependents.extend(value.targets());
                }
            }
            for dependent in dependents {
                if !self.is_tracked(dependent) {
                    continue;
                }
                let linked = fk
                    .dependent_navigation()
                    .and_then(|n| self.snapshot_reference(dependent, n))
                    == Some(principal);
                let addresses =
                    old_key.is_complete() && self.foreign_key_value(dependent, fk) == old_key;
                if linked || addresses {
                    self.copy_key_to_dependent(dependent, fk, principal);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Handlers for observed writes
    // ------------------------------------------------------------------

    /// The caller changed foreign key `fk_id` of `dependent` away from `old_key`.
    pub(crate) fn foreign_key_changed(
        &mut self,
        dependent: EntityId,
        fk_id: ForeignKeyId,
        old_key: &KeyValue,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        if let Some(navigation) = fk.dependent_navigation() {
            if self.navigation_pending(dependent, navigation) {
                // Decided when the navigation write is observed.
                return Ok(());
            }
        }
        let mut previous = Vec::new();
        if let Some(old) = self.find_principal(fk, old_key) {
            previous.push(old);
        }
        if let Some(navigation) = fk.dependent_navigation() {
            if let Some(target) = self.snapshot_reference(dependent, navigation) {
                previous.push(target);
            }
        }

        let new_key = self.foreign_key_value(dependent, fk);
        let principal = self.find_principal(fk, &new_key);
        if let Some(principal) = principal {
            return self.link(dependent, fk_id, principal, &previous, false);
        }
        for old in previous {
            self.remove_from_inverse(old, fk, dependent);
        }
        if let Some(navigation) = fk.dependent_navigation() {
            self.set_reference_fixup(dependent, navigation, None);
        }
        if new_key.is_complete() {
            // Points at a principal this context does not track.
            self.clear_conceptual_null(dependent, fk_id);
        } else if fk.is_required() {
            self.mark_conceptual_null(dependent, fk_id);
        }
        Ok(())
    }

    /// The caller changed the dependent-side reference of `dependent`.
    pub(crate) fn reference_changed(
        &mut self,
        dependent: EntityId,
        fk_id: ForeignKeyId,
        old: Option<EntityId>,
        new: Option<EntityId>,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        let old = old.filter(|o| self.is_tracked(*o));
        if let Some(principal) = new {
            self.ensure_tracked(principal)?;
            let previous: Vec<EntityId> = old.into_iter().collect();
            return self.link(dependent, fk_id, principal, &previous, true);
        }
        let by_key = self.find_principal(fk, &self.foreign_key_value(dependent, fk));
        match by_key {
            Some(principal) if Some(principal) != old => {
                // The foreign key was rewritten to another principal as well.
                if let Some(old) = old {
                    self.remove_from_inverse(old, fk, dependent);
                }
                self.link(dependent, fk_id, principal, &[], false)?;
            }
            _ => {
                if let Some(old) = old {
                    self.sever(dependent, fk_id, old);
                }
            }
        }
        Ok(())
    }

    /// The caller changed the principal-side reference of a one-to-one.
    pub(crate) fn principal_reference_changed(
        &mut self,
        principal: EntityId,
        fk_id: ForeignKeyId,
        old: Option<EntityId>,
        new: Option<EntityId>,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        if let Some(old) = old {
            if Some(old) != new && self.is_tracked(old) && self.principal_of(old, fk) == Some(principal) {
                self.sever(old, fk_id, principal);
            }
        }
        if let Some(dependent) = new {
            self.ensure_tracked(dependent)?;
            self.link(dependent, fk_id, principal, &[], true)?;
        }
        Ok(())
    }

    /// The caller added or removed members of a collection navigation.
    pub(crate) fn collection_changed(
        &mut self,
        principal: EntityId,
        fk_id: ForeignKeyId,
        added: &[EntityId],
        removed: &[EntityId],
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        for &dependent in removed {
            // A member moved to another principal is no longer ours to sever.
            if self.is_tracked(dependent) && self.principal_of(dependent, fk) == Some(principal) {
                self.sever(dependent, fk_id, principal);
            }
        }
        for &dependent in added {
            self.ensure_tracked(dependent)?;
            self.link(dependent, fk_id, principal, &[], true)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tracking new graphs
    // ------------------------------------------------------------------

    /// Track `id` and its untracked graph if it is not tracked yet.
    pub(crate) fn ensure_tracked(&mut self, id: EntityId) -> Result<()> {
        if self.is_tracked(id) {
            return Ok(());
        }
        let tracked = self.track_graph(id, TrackMode::Discover)?;
        tracing::debug!(
            entity = %id,
            count = tracked.len(),
            "Tracked entities discovered through a navigation"
        );
        Ok(())
    }

    /// Track the untracked graph reachable from `root`, then fix it up.
    pub(crate) fn track_graph(&mut self, root: EntityId, mode: TrackMode) -> Result<Vec<EntityId>> {
        self.graph.instance(root)?;
        let discovered = self.untracked_reachable(root);
        for &id in &discovered {
            let state = match mode {
                TrackMode::Add => EntityState::Added,
                TrackMode::Attach => self.attach_state(id),
                TrackMode::Discover => self.discover_state(id),
            };
            self.check_trackable(id, state)?;
            self.start_tracking(id, state)?;
        }
        self.fixup_tracked(&discovered)?;
        Ok(discovered)
    }

    /// Track a single instance without traversing its navigations.
    pub(crate) fn track_single(&mut self, id: EntityId, state: EntityState) -> Result<()> {
        self.check_trackable(id, state)?;
        self.start_tracking(id, state)?;
        self.fixup_tracked(&[id])
    }

    /// `Unchanged` if every key property is set, `Added` otherwise.
    fn attach_state(&self, id: EntityId) -> EntityState {
        let Ok(ty) = self.entity_type_of(id) else {
            return EntityState::Unchanged;
        };
        let key_properties = self.model.key(ty.primary_key()).properties();
        let unset_generated = key_properties.iter().any(|&p| {
            ty.property(p).value_generated() == ValueGenerated::OnAdd
                && self.graph.value(id, p).is_null()
        });
        if unset_generated {
            EntityState::Added
        } else {
            EntityState::Unchanged
        }
    }

    /// `Unchanged` only when the key has a store-generated part and all of
    /// it is set.
    fn discover_state(&self, id: EntityId) -> EntityState {
        let Ok(ty) = self.entity_type_of(id) else {
            return EntityState::Added;
        };
        let key_properties = self.model.key(ty.primary_key()).properties();
        let has_generated = key_properties
            .iter()
            .any(|&p| ty.property(p).value_generated() == ValueGenerated::OnAdd);
        let all_set = key_properties
            .iter()
            .all(|&p| !self.graph.value(id, p).is_null());
        if has_generated && all_set {
            EntityState::Unchanged
        } else {
            EntityState::Added
        }
    }

    fn untracked_reachable(&self, root: EntityId) -> Vec<EntityId> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if self.is_tracked(id) || !seen.insert(id) {
                continue;
            }
            let Some(instance) = self.graph.get(id) else {
                continue;
            };
            order.push(id);
            for navigation in &instance.navigations {
                for target in navigation.targets() {
                    if !self.is_tracked(target) && !seen.contains(&target) {
                        queue.push_back(target);
                    }
                }
            }
        }
        order
    }

    /// Initial fixup of newly tracked entities.
    ///
    /// Navigations are resolved first, across the whole batch, so a key
    /// lookup never pre-empts a navigation that names another principal.
    fn fixup_tracked(&mut self, new: &[EntityId]) -> Result<()> {
        let model = Arc::clone(&self.model);
        let batch: BTreeSet<EntityId> = new.iter().copied().collect();

        let mut links = Vec::new();
        for &id in new {
            if let Some(entry) = self.entry(id) {
                for (navigation, value) in entry.snapshot.navigations.iter().enumerate() {
                    for target in value.targets() {
                        links.push((id, navigation, target));
                    }
                }
            }
        }
        for (&owner, entry) in &self.entries {
            if batch.contains(&owner) {
                continue;
            }
            for (navigation, value) in entry.snapshot.navigations.iter().enumerate() {
                for target in value.targets() {
                    if batch.contains(&target) {
                        links.push((owner, navigation, target));
                    }
                }
            }
        }
        for (owner, navigation, target) in links {
            self.link_navigation(owner, navigation, target)?;
        }

        for &id in new {
            let Some(type_id) = self.entry(id).map(|e| e.entity_type) else {
                continue;
            };
            let ty = model.entity_type(type_id);
            for &fk_id in ty.foreign_keys() {
                let fk = model.foreign_key(fk_id);
                let has_reference = fk
                    .dependent_navigation()
                    .is_some_and(|n| self.snapshot_reference(id, n).is_some());
                if has_reference {
                    continue;
                }
                if let Some(principal) = self.find_principal(fk, &self.foreign_key_value(id, fk)) {
                    self.link(id, fk_id, principal, &[], false)?;
                }
            }
            for &fk_id in ty.referencing_foreign_keys() {
                let fk = model.foreign_key(fk_id);
                let key = self.principal_key_value(id, fk);
                if !key.is_complete() {
                    continue;
                }
                for dependent in self.identity_map.dependents(fk_id, &key) {
                    let has_reference = fk
                        .dependent_navigation()
                        .is_some_and(|n| self.snapshot_reference(dependent, n).is_some());
                    if dependent != id && !has_reference {
                        self.link(dependent, fk_id, id, &[], false)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve one navigation of a tracked entity found during initial fixup.
    fn link_navigation(&mut self, owner: EntityId, navigation: usize, target: EntityId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let (Some(owner_type), Some(target_type)) = (
            self.entry(owner).map(|e| e.entity_type),
            self.entry(target).map(|e| e.entity_type),
        ) else {
            return Ok(());
        };
        let nav = model.entity_type(owner_type).navigation(navigation);
        let fk = model.foreign_key(nav.foreign_key());
        if nav.is_on_dependent() {
            if !model.is_assignable(fk.principal_type(), target_type) {
                return Ok(());
            }
            return self.link(owner, fk.id(), target, &[], true);
        }
        if !model.is_assignable(fk.dependent_type(), target_type) {
            return Ok(());
        }
        let back = fk
            .dependent_navigation()
            .and_then(|n| self.snapshot_reference(target, n));
        if back.is_none_or(|b| b == owner) {
            self.link(target, fk.id(), owner, &[], true)
        } else {
            // The dependent's own reference names another principal.
            self.remove_navigation_target(owner, navigation, target);
            Ok(())
        }
    }
}
