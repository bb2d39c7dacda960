//! Building command batches from tracked changes and applying the results.
//!
//! Commands are ordered inserts, then updates, then deletes. Inserts go
//! principal before dependent and deletes dependent before principal, at
//! the level of individual entities so self-referencing rows order
//! correctly.

use crate::identity_map::key_of;
use crate::state_manager::{EntityState, InternalEntry, StateManager};
use relgraph_core::{
    ColumnValue, CommandBatch, CommandOperation, EntityId, Error, InvalidOperationKind,
    ModificationCommand, Result, SaveResult, Value, ValueGenerated,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Orders entities so that every principal precedes its dependents.
#[derive(Debug, Default)]
pub(crate) struct CommandOrderer {
    /// Entity -> principals it depends on.
    dependencies: BTreeMap<EntityId, BTreeSet<EntityId>>,
}

impl CommandOrderer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, entity: EntityId) {
        self.dependencies.entry(entity).or_default();
    }

    /// Record that `dependent` must be written after `principal`.
    pub(crate) fn add_dependency(&mut self, dependent: EntityId, principal: EntityId) {
        if dependent != principal {
            self.dependencies.entry(dependent).or_default().insert(principal);
        }
    }

    /// Principals first; ties broken by entity id.
    ///
    /// Returns the entities of one cycle if no order exists.
    pub(crate) fn order(&self) -> std::result::Result<Vec<EntityId>, Vec<EntityId>> {
        let mut remaining: BTreeMap<EntityId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
        for (&entity, principals) in &self.dependencies {
            let known: Vec<EntityId> = principals
                .iter()
                .copied()
                .filter(|p| self.dependencies.contains_key(p))
                .collect();
            remaining.insert(entity, known.len());
            for principal in known {
                dependents.entry(principal).or_default().push(entity);
            }
        }

        let mut ready: BTreeSet<EntityId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(entity, _)| *entity)
            .collect();
        let mut order = Vec::with_capacity(remaining.len());
        while let Some(entity) = ready.pop_first() {
            order.push(entity);
            for dependent in dependents.get(&entity).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() == self.dependencies.len() {
            Ok(order)
        } else {
            Err(self.find_cycle())
        }
    }

    fn find_cycle(&self) -> Vec<EntityId> {
        let mut visited = BTreeSet::new();
        for &start in self.dependencies.keys() {
            let mut path = Vec::new();
            let mut on_path = BTreeSet::new();
            if self.detect_cycle_dfs(start, &mut visited, &mut on_path, &mut path) {
                return path;
            }
        }
        Vec::new()
    }

    fn detect_cycle_dfs(
        &self,
        entity: EntityId,
        visited: &mut BTreeSet<EntityId>,
        on_path: &mut BTreeSet<EntityId>,
        path: &mut Vec<EntityId>,
    ) -> bool {
        if on_path.contains(&entity) {
            // Trim the path to the cycle itself.
            if let Some(start) = path.iter().position(|e| *e == entity) {
                path.drain(..start);
            }
            path.push(entity);
            return true;
        }
        if !visited.insert(entity) {
            return false;
        }
        on_path.insert(entity);
        path.push(entity);
        if let Some(principals) = self.dependencies.get(&entity) {
            for &principal in principals {
                if self.dependencies.contains_key(&principal)
                    && self.detect_cycle_dfs(principal, visited, on_path, path)
                {
                    return true;
                }
            }
        }
        on_path.remove(&entity);
        path.pop();
        false
    }
}

impl StateManager {
    /// Settle cascades, validate, and build the batch for pending changes.
    pub(crate) fn prepare_save(&mut self) -> Result<CommandBatch> {
        self.cascade_changes()?;
        self.process_pending_orphans()?;
        self.validate_for_save()?;
        self.build_batch()
    }

    fn validate_for_save(&self) -> Result<()> {
        let model = Arc::clone(&self.model);
        for entry in self.entries.values() {
            if entry.state != EntityState::Modified {
                continue;
            }
            let ty = model.entity_type(entry.entity_type);
            let key_properties: BTreeSet<usize> = ty
                .keys()
                .iter()
                .flat_map(|k| model.key(*k).properties().iter().copied())
                .collect();
            for (p, _) in entry.modified.iter().enumerate().filter(|(_, m)| **m) {
                let property = ty.property(p);
                if key_properties.contains(&p) {
                    return Err(Error::invalid(
                        InvalidOperationKind::KeyModified,
                        format!(
                            "key property '{}' of '{}' entity {} was modified; keys of saved entities cannot change",
                            property.name(),
                            ty.name(),
                            entry.entity
                        ),
                    ));
                }
                if property.is_read_only_after_save() {
                    return Err(Error::invalid(
                        InvalidOperationKind::ReadOnlyProperty,
                        format!(
                            "property '{}' of '{}' entity {} is read-only once saved",
                            property.name(),
                            ty.name(),
                            entry.entity
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn build_batch(&self) -> Result<CommandBatch> {
        let in_state = |state: EntityState| -> Vec<EntityId> {
            self.entries
                .values()
                .filter(|e| e.state == state)
                .map(|e| e.entity)
                .collect()
        };

        let added = in_state(EntityState::Added);
        let deleted = in_state(EntityState::Deleted);
        let replaced = self.replaced_rows(&added, &deleted);
        let inserts: Vec<EntityId> = added
            .into_iter()
            .filter(|id| !replaced.contains_key(id))
            .collect();

        let mut commands = Vec::new();
        for id in self.order_by_dependency(&inserts)? {
            commands.extend(self.command_for(id, CommandOperation::Insert));
        }
        for id in in_state(EntityState::Modified) {
            commands.extend(self.command_for(id, CommandOperation::Update));
        }
        for (&id, &previous) in &replaced {
            tracing::debug!(
                entity = %id,
                replaces = %previous,
                "Saving a replaced row as an update"
            );
            commands.extend(self.replacement_command(id));
        }
        let taken_over: BTreeSet<EntityId> = replaced.values().copied().collect();
        let deleted: Vec<EntityId> = deleted
            .into_iter()
            .filter(|id| !taken_over.contains(id))
            .collect();
        let mut deletes = self.order_by_dependency(&deleted)?;
        deletes.reverse();
        for id in deletes {
            commands.extend(self.command_for(id, CommandOperation::Delete));
        }
        Ok(CommandBatch::new(commands))
    }

    /// Added entities that take over the stored key of a deleted entity of
    /// the same type, mapped to that entity. The pair writes one row.
    fn replaced_rows(&self, added: &[EntityId], deleted: &[EntityId]) -> BTreeMap<EntityId, EntityId> {
        let model = Arc::clone(&self.model);
        let mut stored = HashMap::new();
        for &id in deleted {
            let Some(entry) = self.entry(id) else {
                continue;
            };
            let Some(original) = entry.original_values.as_ref() else {
                continue;
            };
            let pk = model.key(model.entity_type(entry.entity_type).primary_key());
            stored.insert((entry.entity_type, key_of(original, pk.properties())), id);
        }
        let mut replaced = BTreeMap::new();
        if stored.is_empty() {
            return replaced;
        }
        for &id in added {
            let Some(entry) = self.entry(id) else {
                continue;
            };
            let pk = model.key(model.entity_type(entry.entity_type).primary_key());
            if pk.properties().iter().any(|&p| entry.temporary[p]) {
                continue;
            }
            let key = key_of(&entry.snapshot.values, pk.properties());
            if let Some(previous) = stored.remove(&(entry.entity_type, key)) {
                replaced.insert(id, previous);
            }
        }
        replaced
    }

    /// An update writing every non-key column of an added entity into the
    /// row it replaces.
    fn replacement_command(&self, id: EntityId) -> Option<ModificationCommand> {
        let entry = self.entry(id)?;
        let ty = self.model.entity_type(entry.entity_type);
        let pk = self.model.key(ty.primary_key()).properties();
        let column = |p: usize| ColumnValue {
            property: p,
            name: ty.property(p).name().to_string(),
            value: entry.snapshot.values[p].clone(),
            temporary: entry.temporary[p],
            generated: false,
        };
        let columns: Vec<ColumnValue> = (0..ty.properties().len())
            .filter(|p| !pk.contains(p))
            .map(column)
            .collect();
        if columns.is_empty() {
            return None;
        }
        Some(ModificationCommand {
            entity: id,
            entity_type: entry.entity_type,
            type_name: ty.name().to_string(),
            operation: CommandOperation::Update,
            key: pk.iter().map(|&p| column(p)).collect(),
            columns,
        })
    }

    fn order_by_dependency(&self, ids: &[EntityId]) -> Result<Vec<EntityId>> {
        let model = Arc::clone(&self.model);
        let mut orderer = CommandOrderer::new();
        for &id in ids {
            orderer.register(id);
            let Some(entry) = self.entry(id) else {
                continue;
            };
            for &fk_id in model.entity_type(entry.entity_type).foreign_keys() {
                if let Some(principal) = self.principal_of(id, model.foreign_key(fk_id)) {
                    orderer.add_dependency(id, principal);
                }
            }
        }
        orderer.order().map_err(|cycle| {
            let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            Error::invalid(
                InvalidOperationKind::CircularDependency,
                format!(
                    "cannot order commands, entities depend on each other: {}",
                    path.join(" -> ")
                ),
            )
        })
    }

    fn command_for(&self, id: EntityId, operation: CommandOperation) -> Option<ModificationCommand> {
        let entry = self.entry(id)?;
        let ty = self.model.entity_type(entry.entity_type);
        let pk = self.model.key(ty.primary_key()).properties();
        let column = |p: usize, value: Value, temporary: bool, generated: bool| ColumnValue {
            property: p,
            name: ty.property(p).name().to_string(),
            value,
            temporary,
            generated,
        };
        let stored_key = |entry: &InternalEntry| -> Vec<ColumnValue> {
            let values = entry
                .original_values
                .as_ref()
                .unwrap_or(&entry.snapshot.values);
            pk.iter()
                .map(|&p| column(p, values[p].clone(), false, false))
                .collect()
        };

        let (key, columns) = match operation {
            CommandOperation::Insert => {
                let columns: Vec<ColumnValue> = ty
                    .properties()
                    .iter()
                    .enumerate()
                    .map(|(p, property)| {
                        let value = entry.snapshot.values[p].clone();
                        let temporary = entry.temporary[p];
                        let generated = property.value_generated() == ValueGenerated::OnAdd
                            && (temporary || value.is_null());
                        column(p, value, temporary, generated)
                    })
                    .collect();
                let key = pk.iter().map(|&p| columns[p].clone()).collect();
                (key, columns)
            }
            CommandOperation::Update => {
                let columns: Vec<ColumnValue> = entry
                    .modified
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| **m)
                    .map(|(p, _)| column(p, entry.snapshot.values[p].clone(), entry.temporary[p], false))
                    .collect();
                if columns.is_empty() {
                    return None;
                }
                (stored_key(entry), columns)
            }
            CommandOperation::Delete => (stored_key(entry), Vec::new()),
        };
        Some(ModificationCommand {
            entity: id,
            entity_type: entry.entity_type,
            type_name: ty.name().to_string(),
            operation,
            key,
            columns,
        })
    }

    /// Apply store-generated values and, with `accept`, accept all changes.
    pub(crate) fn complete_save(&mut self, batch: &CommandBatch, result: &SaveResult, accept: bool) {
        for generated in result.generated() {
            let Some(command) = batch.commands().get(generated.command) else {
                tracing::warn!(
                    command = generated.command,
                    "Store reported values for an unknown command"
                );
                continue;
            };
            for (property, value) in &generated.values {
                self.write_property(command.entity, *property, value.clone(), false);
            }
        }
        if accept {
            self.accept_all_changes();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::fixup::TrackMode;
    use crate::graph::NavigationValue;
    use relgraph_core::{
        DeleteBehavior, EntityTypeDef, Model, PropertyDef, RelationshipDef, ValueKind,
    };

    fn manager() -> StateManager {
        let model = Model::builder()
            .entity(
                EntityTypeDef::new("Blog")
                    .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                    .property(PropertyDef::new("created", ValueKind::Text).nullable().read_only_after_save())
                    .primary_key(&["id"]),
            )
            .entity(
                EntityTypeDef::new("Post")
                    .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                    .property(PropertyDef::new("blog_id", ValueKind::BigInt))
                    .primary_key(&["id"]),
            )
            .relationship(
                RelationshipDef::one_to_many("Blog", "Post")
                    .foreign_key(&["blog_id"])
                    .principal_navigation("posts")
                    .dependent_navigation("blog")
                    .on_delete(DeleteBehavior::Cascade),
            )
            .build()
            .unwrap();
        StateManager::new(Arc::new(model), TrackerConfig::default())
    }

    fn e(raw: u64) -> EntityId {
        EntityId::from_raw(raw)
    }

    #[test]
    fn test_orderer_principals_first() {
        let mut orderer = CommandOrderer::new();
        for raw in [1, 2, 3] {
            orderer.register(e(raw));
        }
        orderer.add_dependency(e(1), e(3));
        orderer.add_dependency(e(3), e(2));
        orderer.add_dependency(e(2), e(2));
        assert_eq!(orderer.order().unwrap(), vec![e(2), e(3), e(1)]);
    }

    #[test]
    fn test_orderer_reports_cycle() {
        let mut orderer = CommandOrderer::new();
        orderer.register(e(4));
        orderer.add_dependency(e(1), e(2));
        orderer.add_dependency(e(2), e(1));
        let cycle = orderer.order().unwrap_err();
        assert_eq!(cycle, vec![e(1), e(2), e(1)]);
    }

    #[test]
    fn test_insert_batch_orders_principal_first() {
        let mut manager = manager();
        let model = Arc::clone(&manager.model);
        let post = manager.graph.create(model.find_entity_type("Post").unwrap());
        let blog = manager.graph.create(model.find_entity_type("Blog").unwrap());
        manager.graph.get_mut(post).unwrap().navigations[0] = NavigationValue::Reference(Some(blog));
        manager.track_graph(post, TrackMode::Add).unwrap();

        let batch = manager.prepare_save().unwrap();
        assert_eq!(batch.entities(), vec![blog, post]);
        let insert = &batch.commands()[1];
        let fk = insert.column("blog_id").unwrap();
        assert!(fk.temporary && !fk.generated);
        assert!(insert.column("id").unwrap().generated);

        let mut result = SaveResult::new();
        result.push(0, vec![(0, Value::BigInt(100))]);
        result.push(1, vec![(0, Value::BigInt(200))]);
        manager.complete_save(&batch, &result, true);
        assert_eq!(manager.graph.value(post, 1), Value::BigInt(100));
        assert!(!manager.is_temporary(post, 1));
        assert_eq!(manager.state_of(post), EntityState::Unchanged);
    }

    #[test]
    fn test_read_only_and_key_validation() {
        let mut manager = manager();
        let model = Arc::clone(&manager.model);
        let blog = manager.graph.create(model.find_entity_type("Blog").unwrap());
        manager.graph.get_mut(blog).unwrap().values[0] = Value::BigInt(1);
        manager.track_graph(blog, TrackMode::Attach).unwrap();

        manager.set_property_modified(blog, 1, true);
        let err = manager.atomically(StateManager::prepare_save).unwrap_err();
        assert_eq!(
            err.invalid_operation_kind(),
            Some(InvalidOperationKind::ReadOnlyProperty)
        );

        manager.set_property_modified(blog, 1, false);
        manager.set_property_modified(blog, 0, true);
        let err = manager.atomically(StateManager::prepare_save).unwrap_err();
        assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::KeyModified));
    }

    #[test]
    fn test_deletes_run_dependent_first() {
        let mut manager = manager();
        let model = Arc::clone(&manager.model);
        let blog = manager.graph.create(model.find_entity_type("Blog").unwrap());
        let post = manager.graph.create(model.find_entity_type("Post").unwrap());
        manager.graph.get_mut(blog).unwrap().values[0] = Value::BigInt(1);
        manager.graph.get_mut(post).unwrap().values = vec![Value::BigInt(2), Value::BigInt(1)];
        manager.track_graph(blog, TrackMode::Attach).unwrap();
        manager.track_graph(post, TrackMode::Attach).unwrap();

        manager.remove(blog).unwrap();
        let batch = manager.prepare_save().unwrap();
        assert_eq!(batch.entities(), vec![post, blog]);
        assert!(batch
            .commands()
            .iter()
            .all(|c| c.operation == CommandOperation::Delete));
        assert_eq!(batch.commands()[0].key[0].value, Value::BigInt(2));
    }
}
