//! Delete cascades, dependent nulling and orphan deletion.
//!
//! A deletion is planned in full before anything changes: the plan lists
//! every state change and every optional foreign key to null, and a
//! restricted dependent anywhere in the cascade rejects the whole plan.

use crate::config::CascadeTiming;
use crate::state_manager::{EntityState, StateManager};
use relgraph_core::{DeleteBehavior, EntityId, ForeignKeyId, RelationshipErrorKind, Result};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

/// The consequences of deleting a set of entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CascadePlan {
    /// `(entity, new state)`; `Added` entities are detached, others deleted.
    pub(crate) state_changes: Vec<(EntityId, EntityState)>,
    /// `(dependent, relationship, principal)` links to sever.
    pub(crate) null_outs: Vec<(EntityId, ForeignKeyId, EntityId)>,
}

fn deletion_target(state: EntityState) -> EntityState {
    if state == EntityState::Added {
        EntityState::Detached
    } else {
        EntityState::Deleted
    }
}

impl StateManager {
    /// Plan the deletion of `roots`.
    ///
    /// With `cascade`, `Cascade` dependents are deleted transitively;
    /// without it they are left for a later pass. Dependents of an
    /// `Added` principal always cascade, since a detached principal
    /// cannot be revisited.
    pub(crate) fn plan_deletion(&self, roots: &[EntityId], cascade: bool) -> Result<CascadePlan> {
        let model = Arc::clone(&self.model);
        let mut plan = CascadePlan::default();
        let mut deleting = BTreeSet::new();
        let mut queue = VecDeque::new();
        let mut violations: Vec<(ForeignKeyId, EntityId)> = Vec::new();

        for &root in roots {
            let state = self.state_of(root);
            if state == EntityState::Detached || !deleting.insert(root) {
                continue;
            }
            if state != EntityState::Deleted {
                plan.state_changes.push((root, deletion_target(state)));
            }
            queue.push_back(root);
        }

        while let Some(principal) = queue.pop_front() {
            let Some(principal_entry) = self.entry(principal) else {
                continue;
            };
            let cascade_here = cascade || principal_entry.state == EntityState::Added;
            let ty = model.entity_type(principal_entry.entity_type);
            for &fk_id in ty.referencing_foreign_keys() {
                let fk = model.foreign_key(fk_id);
                for dependent in self.dependents_of(principal, fk) {
                    if deleting.contains(&dependent) {
                        continue;
                    }
                    let Some(entry) = self.entry(dependent) else {
                        continue;
                    };
                    if entry.state == EntityState::Deleted || entry.conceptual_nulls.contains(&fk_id) {
                        continue;
                    }
                    match fk.delete_behavior() {
                        DeleteBehavior::Cascade => {
                            if cascade_here {
                                tracing::trace!(
                                    principal = %principal,
                                    dependent = %dependent,
                                    foreign_key = fk.name(),
                                    "Cascading delete"
                                );
                                deleting.insert(dependent);
                                plan.state_changes.push((dependent, deletion_target(entry.state)));
                                queue.push_back(dependent);
                            }
                        }
                        DeleteBehavior::SetNull
                        | DeleteBehavior::ClientSetNull
                        | DeleteBehavior::Restrict => {
                            if fk.is_required() {
                                violations.push((fk_id, dependent));
                            } else {
                                plan.null_outs.push((dependent, fk_id, principal));
                            }
                        }
                        DeleteBehavior::NoAction => {}
                    }
                }
            }
        }

        if let Some(&(fk_id, _)) = violations.first() {
            let fk = model.foreign_key(fk_id);
            let entities: Vec<EntityId> = violations.iter().map(|(_, d)| *d).collect();
            tracing::warn!(
                foreign_key = fk.name(),
                count = entities.len(),
                "Delete rejected by required dependents"
            );
            return Err(self.relationship_error(
                RelationshipErrorKind::RequiredDependent,
                fk,
                format!(
                    "deleting would leave {} required dependent(s) without a principal",
                    entities.len()
                ),
                entities,
            ));
        }
        plan.null_outs
            .retain(|(dependent, _, _)| !deleting.contains(dependent));
        Ok(plan)
    }

    pub(crate) fn apply_deletion_plan(&mut self, plan: CascadePlan) {
        for (dependent, fk_id, principal) in plan.null_outs {
            self.sever(dependent, fk_id, principal);
        }
        for (id, state) in plan.state_changes {
            self.set_entry_state(id, state);
        }
    }

    /// Delete `roots` and, with `cascade`, their cascading dependents.
    pub(crate) fn delete_entities(&mut self, roots: &[EntityId], cascade: bool) -> Result<()> {
        let plan = self.plan_deletion(roots, cascade)?;
        tracing::debug!(
            roots = roots.len(),
            state_changes = plan.state_changes.len(),
            null_outs = plan.null_outs.len(),
            "Applying deletion"
        );
        self.apply_deletion_plan(plan);
        Ok(())
    }

    /// Mark a tracked entity for deletion.
    pub(crate) fn remove(&mut self, id: EntityId) -> Result<()> {
        let state = self.require_tracked(id)?.state;
        if state == EntityState::Deleted {
            return Ok(());
        }
        let cascade = self.config.cascade_delete_timing == CascadeTiming::Immediate;
        self.delete_entities(&[id], cascade)
    }

    /// Delete orphans queued by severing required `Cascade` relationships.
    pub(crate) fn process_pending_orphans(&mut self) -> Result<()> {
        if self.pending_orphans.is_empty() {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let candidates = std::mem::take(&mut self.pending_orphans);
        let orphans: Vec<EntityId> = candidates
            .into_iter()
            .filter(|id| {
                self.entry(*id).is_some_and(|entry| {
                    entry.state != EntityState::Deleted
                        && entry.conceptual_nulls.iter().any(|fk| {
                            model.foreign_key(*fk).delete_behavior() == DeleteBehavior::Cascade
                        })
                })
            })
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = orphans.len(), "Deleting orphaned dependents");
        let cascade = self.config.cascade_delete_timing == CascadeTiming::Immediate;
        self.delete_entities(&orphans, cascade)
    }

    /// Apply every deferred cascade and orphan deletion now.
    ///
    /// Fails with `SeveredRequired` if a required dependent was severed
    /// under a relationship that will not delete it.
    pub(crate) fn cascade_changes(&mut self) -> Result<()> {
        let model = Arc::clone(&self.model);
        let orphan_timing = self.config.delete_orphans_timing;
        let cascade = self.config.cascade_delete_timing != CascadeTiming::Never;

        let mut orphans = Vec::new();
        let mut severed: Vec<(ForeignKeyId, EntityId)> = Vec::new();
        for (&id, entry) in &self.entries {
            if entry.state == EntityState::Deleted || entry.conceptual_nulls.is_empty() {
                continue;
            }
            let deletes_orphan = orphan_timing != CascadeTiming::Never
                && entry
                    .conceptual_nulls
                    .iter()
                    .any(|fk| model.foreign_key(*fk).delete_behavior() == DeleteBehavior::Cascade);
            if deletes_orphan {
                orphans.push(id);
            } else if let Some(&fk_id) = entry.conceptual_nulls.iter().next() {
                severed.push((fk_id, id));
            }
        }
        if let Some(&(fk_id, _)) = severed.first() {
            let entities: Vec<EntityId> = severed.iter().map(|(_, id)| *id).collect();
            return Err(self.relationship_error(
                RelationshipErrorKind::SeveredRequired,
                model.foreign_key(fk_id),
                format!(
                    "{} required dependent(s) were severed from their principal and cannot be saved",
                    entities.len()
                ),
                entities,
            ));
        }
        if !orphans.is_empty() {
            self.delete_entities(&orphans, cascade)?;
        }
        if cascade {
            let deleted: Vec<EntityId> = self
                .entries
                .values()
                .filter(|e| e.state == EntityState::Deleted)
                .map(|e| e.entity)
                .collect();
            if !deleted.is_empty() {
                let plan = self.plan_deletion(&deleted, true)?;
                self.apply_deletion_plan(plan);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::fixup::TrackMode;
    use relgraph_core::{EntityTypeDef, Model, PropertyDef, RelationshipDef, Value, ValueKind};

    fn manager(config: TrackerConfig) -> StateManager {
        let model = Model::builder()
            .entity(
                EntityTypeDef::new("Blog")
                    .property(PropertyDef::new("id", ValueKind::BigInt))
                    .primary_key(&["id"]),
            )
            .entity(
                EntityTypeDef::new("Post")
                    .property(PropertyDef::new("id", ValueKind::BigInt))
                    .property(PropertyDef::new("blog_id", ValueKind::BigInt).nullable())
                    .primary_key(&["id"]),
            )
            .entity(
                EntityTypeDef::new("Comment")
                    .property(PropertyDef::new("id", ValueKind::BigInt))
                    .property(PropertyDef::new("post_id", ValueKind::BigInt))
                    .primary_key(&["id"]),
            )
            .entity(
                EntityTypeDef::new("Archive")
                    .property(PropertyDef::new("id", ValueKind::BigInt))
                    .property(PropertyDef::new("blog_id", ValueKind::BigInt))
                    .primary_key(&["id"]),
            )
            .relationship(
                RelationshipDef::one_to_many("Blog", "Post")
                    .foreign_key(&["blog_id"])
                    .principal_navigation("posts")
                    .on_delete(DeleteBehavior::SetNull),
            )
            .relationship(
                RelationshipDef::one_to_many("Post", "Comment")
                    .foreign_key(&["post_id"])
                    .principal_navigation("comments")
                    .on_delete(DeleteBehavior::Cascade),
            )
            .relationship(
                RelationshipDef::one_to_many("Blog", "Archive")
                    .foreign_key(&["blog_id"])
                    .on_delete(DeleteBehavior::Restrict),
            )
            .build()
            .unwrap();
        StateManager::new(Arc::new(model), config)
    }

    fn tracked(manager: &mut StateManager, type_name: &str, values: Vec<Value>) -> EntityId {
        let model = Arc::clone(&manager.model);
        let id = manager.graph.create(model.find_entity_type(type_name).unwrap());
        manager.graph.get_mut(id).unwrap().values = values;
        manager.track_graph(id, TrackMode::Attach).unwrap();
        id
    }

    #[test]
    fn test_cascade_and_set_null() {
        let mut manager = manager(TrackerConfig::default());
        let blog = tracked(&mut manager, "Blog", vec![Value::BigInt(1)]);
        let post = tracked(&mut manager, "Post", vec![Value::BigInt(2), Value::BigInt(1)]);
        let comment = tracked(&mut manager, "Comment", vec![Value::BigInt(3), Value::BigInt(2)]);

        manager.remove(post).unwrap();
        assert_eq!(manager.state_of(post), EntityState::Deleted);
        assert_eq!(manager.state_of(comment), EntityState::Deleted);

        let other = tracked(&mut manager, "Post", vec![Value::BigInt(4), Value::BigInt(1)]);
        manager.remove(blog).unwrap();
        assert_eq!(manager.graph.value(other, 1), Value::Null);
        assert_eq!(manager.state_of(other), EntityState::Modified);
    }

    #[test]
    fn test_restrict_rejects_whole_deletion() {
        let mut manager = manager(TrackerConfig::default());
        let blog = tracked(&mut manager, "Blog", vec![Value::BigInt(1)]);
        let post = tracked(&mut manager, "Post", vec![Value::BigInt(2), Value::BigInt(1)]);
        let archive = tracked(&mut manager, "Archive", vec![Value::BigInt(9), Value::BigInt(1)]);

        let err = manager.atomically(|m| m.remove(blog)).unwrap_err();
        assert_eq!(
            err.relationship_kind(),
            Some(RelationshipErrorKind::RequiredDependent)
        );
        assert_eq!(err.entities(), &[archive]);
        assert_eq!(manager.state_of(blog), EntityState::Unchanged);
        assert_eq!(manager.graph.value(post, 1), Value::BigInt(1));
    }

    #[test]
    fn test_deferred_cascade_runs_on_cascade_changes() {
        let config = TrackerConfig::default().with_cascade_delete_timing(CascadeTiming::OnSaveChanges);
        let mut manager = manager(config);
        let post = tracked(&mut manager, "Post", vec![Value::BigInt(2), Value::Null]);
        let comment = tracked(&mut manager, "Comment", vec![Value::BigInt(3), Value::BigInt(2)]);

        manager.remove(post).unwrap();
        assert_eq!(manager.state_of(comment), EntityState::Unchanged);
        manager.cascade_changes().unwrap();
        assert_eq!(manager.state_of(comment), EntityState::Deleted);
    }

    #[test]
    fn test_added_root_is_detached() {
        let mut manager = manager(TrackerConfig::default());
        let model = Arc::clone(&manager.model);
        let post = manager.graph.create(model.find_entity_type("Post").unwrap());
        manager.graph.get_mut(post).unwrap().values[0] = Value::BigInt(7);
        manager.track_graph(post, TrackMode::Add).unwrap();

        manager.remove(post).unwrap();
        assert_eq!(manager.state_of(post), EntityState::Detached);
        assert!(!manager.is_tracked(post));
    }
}
