//! An in-memory [`Store`] that enforces the model's relational constraints.
//!
//! Each batch runs against a copy of the tables and is committed only if
//! every command succeeds. Keys are generated from one sequence, foreign
//! keys are checked when rows are written, and deletes apply the
//! store-side delete behavior of every relationship that references the
//! deleted row.

use crate::error::{StoreError, StoreErrorKind};
use crate::model::{EntityType, EntityTypeId, Model};
use crate::relationship::DeleteBehavior;
use crate::store::{ColumnValue, CommandBatch, CommandOperation, SaveResult, Store};
use crate::value::{Value, ValueKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A row as seen by callers: property name to value.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRow {
    pub entity_type: String,
    pub values: BTreeMap<String, Value>,
}

impl StoreRow {
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }
}

#[derive(Debug, Clone)]
struct Row {
    entity_type: EntityTypeId,
    values: Vec<Value>,
}

type Tables = HashMap<EntityTypeId, Vec<Row>>;

#[derive(Debug, Default)]
struct StoreState {
    tables: Tables,
    sequence: i64,
    injected_failure: Option<(StoreErrorKind, String)>,
    saves: usize,
    last_batch: Option<CommandBatch>,
}

/// Reference store used by tests and examples.
#[derive(Debug)]
pub struct InMemoryStore {
    model: Arc<Model>,
    state: Mutex<StoreState>,
}

fn constraint(message: String) -> StoreError {
    StoreError::new(StoreErrorKind::Constraint, message)
}

impl InMemoryStore {
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a row directly, bypassing the tracker.
    pub fn seed(&self, type_name: &str, values: &[(&str, Value)]) -> Result<(), StoreError> {
        let ty = self.model.find_entity_type(type_name).ok_or_else(|| {
            StoreError::new(
                StoreErrorKind::Other,
                format!("unknown entity type '{}'", type_name),
            )
        })?;
        let mut row = vec![Value::Null; ty.properties().len()];
        for (name, value) in values {
            let index = ty.property_index(name).ok_or_else(|| {
                StoreError::new(
                    StoreErrorKind::Other,
                    format!("'{}' has no property '{}'", type_name, name),
                )
            })?;
            row[index] = value.clone();
        }
        let mut state = self.lock();
        let mut tables = state.tables.clone();
        self.insert_row(&mut tables, ty, row)?;
        state.tables = tables;
        Ok(())
    }

    /// Rows of `type_name` and every type derived from it, in insertion order.
    pub fn rows(&self, type_name: &str) -> Vec<StoreRow> {
        let Some(ty) = self.model.find_entity_type(type_name) else {
            return Vec::new();
        };
        let state = self.lock();
        state
            .tables
            .get(&ty.root())
            .map(|rows| {
                rows.iter()
                    .filter(|row| self.model.is_assignable(ty.id(), row.entity_type))
                    .map(|row| self.present(row))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Find a row by primary key.
    pub fn row(&self, type_name: &str, key: &[Value]) -> Option<StoreRow> {
        let ty = self.model.find_entity_type(type_name)?;
        let pk = self.model.key(ty.primary_key());
        let state = self.lock();
        state.tables.get(&ty.root()).and_then(|rows| {
            rows.iter()
                .find(|row| {
                    self.model.is_assignable(ty.id(), row.entity_type)
                        && pk.properties().iter().zip(key).all(|(&p, v)| &row.values[p] == v)
                })
                .map(|row| self.present(row))
        })
    }

    /// Make the next save fail with the given error before touching any row.
    pub fn fail_next_save(&self, kind: StoreErrorKind, message: &str) {
        self.lock().injected_failure = Some((kind, message.to_string()));
    }

    /// Number of save calls received, failed ones included.
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }

    /// The most recent batch received.
    pub fn last_batch(&self) -> Option<CommandBatch> {
        self.lock().last_batch.clone()
    }

    fn present(&self, row: &Row) -> StoreRow {
        let ty = self.model.entity_type(row.entity_type);
        StoreRow {
            entity_type: ty.name().to_string(),
            values: ty
                .properties()
                .iter()
                .zip(&row.values)
                .map(|(p, v)| (p.name().to_string(), v.clone()))
                .collect(),
        }
    }

    fn matches_key(row: &Row, props: &[usize], values: &[Value]) -> bool {
        props.iter().zip(values).all(|(&p, v)| &row.values[p] == v)
    }

    fn primary_key_of(&self, ty: &EntityType, values: &[Value]) -> Vec<Value> {
        self.model
            .key(ty.primary_key())
            .properties()
            .iter()
            .map(|&p| values[p].clone())
            .collect()
    }

    fn insert_row(&self, tables: &mut Tables, ty: &EntityType, values: Vec<Value>) -> Result<(), StoreError> {
        let pk = self.model.key(ty.primary_key());
        let key = self.primary_key_of(ty, &values);
        if key.iter().any(Value::is_null) {
            return Err(constraint(format!("'{}' row has a NULL primary key", ty.name())));
        }
        let duplicate = tables.get(&ty.root()).is_some_and(|rows| {
            rows.iter()
                .any(|row| Self::matches_key(row, pk.properties(), &key))
        });
        if duplicate {
            return Err(constraint(format!(
                "duplicate primary key for '{}'",
                ty.name()
            )));
        }
        let row = Row {
            entity_type: ty.id(),
            values,
        };
        self.check_references(tables, &row)?;
        tables.entry(ty.root()).or_default().push(row);
        Ok(())
    }

    /// Every non-NULL foreign key of `row` must address an existing principal.
    fn check_references(&self, tables: &Tables, row: &Row) -> Result<(), StoreError> {
        let ty = self.model.entity_type(row.entity_type);
        for &fk_id in ty.foreign_keys() {
            let fk = self.model.foreign_key(fk_id);
            let values: Vec<Value> = fk.properties().iter().map(|&p| row.values[p].clone()).collect();
            if values.iter().any(Value::is_null) {
                continue;
            }
            let key = self.model.key(fk.principal_key());
            let principal_root = self.model.entity_type(fk.principal_type()).root();
            let found = tables.get(&principal_root).is_some_and(|rows| {
                rows.iter().any(|candidate| {
                    self.model.is_assignable(fk.principal_type(), candidate.entity_type)
                        && Self::matches_key(candidate, key.properties(), &values)
                })
            });
            if !found {
                return Err(constraint(format!(
                    "foreign key '{}' references a missing principal",
                    fk.name()
                )));
            }
        }
        Ok(())
    }

    fn resolve(
        placeholders: &HashMap<Value, Value>,
        column: &ColumnValue,
    ) -> Result<Value, StoreError> {
        if !column.temporary {
            return Ok(column.value.clone());
        }
        placeholders.get(&column.value).cloned().ok_or_else(|| {
            StoreError::new(
                StoreErrorKind::UnresolvedTemporary,
                format!(
                    "temporary value for '{}' does not match any insert in the batch",
                    column.name
                ),
            )
        })
    }

    fn generate(kind: ValueKind, sequence: i64) -> Value {
        match kind {
            ValueKind::Int => Value::Int(i32::try_from(sequence).unwrap_or(i32::MAX)),
            ValueKind::Text => Value::Text(format!("gen-{}", sequence)),
            ValueKind::Uuid => {
                let mut bytes = [0u8; 16];
                bytes[8..].copy_from_slice(&sequence.to_be_bytes());
                Value::Uuid(bytes)
            }
            _ => Value::BigInt(sequence),
        }
    }

    /// Delete a row and apply the store-side behavior of every relationship
    /// referencing it.
    fn delete_row(&self, tables: &mut Tables, ty: &EntityType, key: &[Value]) -> Result<(), StoreError> {
        let pk = self.model.key(ty.primary_key());
        let mut pending = vec![(ty.root(), pk.properties().to_vec(), key.to_vec())];
        while let Some((root, props, key)) = pending.pop() {
            let Some(table) = tables.get_mut(&root) else {
                continue;
            };
            let Some(position) = table
                .iter()
                .position(|row| Self::matches_key(row, &props, &key))
            else {
                continue;
            };
            let row = table.remove(position);
            let row_type = self.model.entity_type(row.entity_type);
            for &fk_id in row_type.referencing_foreign_keys() {
                let fk = self.model.foreign_key(fk_id);
                let principal_values: Vec<Value> = self
                    .model
                    .key(fk.principal_key())
                    .properties()
                    .iter()
                    .map(|&p| row.values[p].clone())
                    .collect();
                if principal_values.iter().any(Value::is_null) {
                    continue;
                }
                let dependent = self.model.entity_type(fk.dependent_type());
                let dependent_pk = self.model.key(dependent.primary_key()).properties().to_vec();
                let Some(rows) = tables.get_mut(&dependent.root()) else {
                    continue;
                };
                for dependent_row in rows.iter_mut().filter(|r| {
                    self.model.is_assignable(fk.dependent_type(), r.entity_type)
                        && Self::matches_key(r, fk.properties(), &principal_values)
                }) {
                    match fk.delete_behavior() {
                        DeleteBehavior::Cascade => {
                            let dependent_key = dependent_pk
                                .iter()
                                .map(|&p| dependent_row.values[p].clone())
                                .collect();
                            pending.push((dependent.root(), dependent_pk.clone(), dependent_key));
                        }
                        DeleteBehavior::SetNull => {
                            for &p in fk.properties() {
                                dependent_row.values[p] = Value::Null;
                            }
                        }
                        DeleteBehavior::ClientSetNull
                        | DeleteBehavior::Restrict
                        | DeleteBehavior::NoAction => {
                            return Err(constraint(format!(
                                "delete from '{}' violates foreign key '{}'",
                                row_type.name(),
                                fk.name()
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        tables: &mut Tables,
        sequence: &mut i64,
        batch: &CommandBatch,
    ) -> Result<SaveResult, StoreError> {
        let mut placeholders: HashMap<Value, Value> = HashMap::new();
        let mut result = SaveResult::new();
        for (index, command) in batch.commands().iter().enumerate() {
            let ty = self.model.entity_type(command.entity_type);
            let pk = self.model.key(ty.primary_key());
            match command.operation {
                CommandOperation::Insert => {
                    let mut values = vec![Value::Null; ty.properties().len()];
                    let mut generated = Vec::new();
                    for column in &command.columns {
                        let value = if column.generated {
                            *sequence += 1;
                            let value =
                                Self::generate(ty.property(column.property).kind(), *sequence);
                            if column.temporary {
                                placeholders.insert(column.value.clone(), value.clone());
                            }
                            generated.push((column.property, value.clone()));
                            value
                        } else {
                            Self::resolve(&placeholders, column)?
                        };
                        values[column.property] = value;
                    }
                    self.insert_row(tables, ty, values)?;
                    result.push(index, generated);
                }
                CommandOperation::Update => {
                    let key = command
                        .key
                        .iter()
                        .map(|c| Self::resolve(&placeholders, c))
                        .collect::<Result<Vec<_>, _>>()?;
                    let table = tables.entry(ty.root()).or_default();
                    let Some(row) = table
                        .iter_mut()
                        .find(|row| Self::matches_key(row, pk.properties(), &key))
                    else {
                        return Err(StoreError::new(
                            StoreErrorKind::Concurrency,
                            format!("update of '{}' matched no row", ty.name()),
                        ));
                    };
                    for column in &command.columns {
                        row.values[column.property] = Self::resolve(&placeholders, column)?;
                    }
                    let updated = row.clone();
                    self.check_references(tables, &updated)?;
                }
                CommandOperation::Delete => {
                    let key = command
                        .key
                        .iter()
                        .map(|c| Self::resolve(&placeholders, c))
                        .collect::<Result<Vec<_>, _>>()?;
                    let exists = tables.get(&ty.root()).is_some_and(|rows| {
                        rows.iter()
                            .any(|row| Self::matches_key(row, pk.properties(), &key))
                    });
                    if !exists {
                        return Err(StoreError::new(
                            StoreErrorKind::Concurrency,
                            format!("delete of '{}' matched no row", ty.name()),
                        ));
                    }
                    self.delete_row(tables, ty, &key)?;
                }
            }
        }
        Ok(result)
    }
}

impl Store for InMemoryStore {
    fn save(&self, batch: &CommandBatch) -> Result<SaveResult, StoreError> {
        let mut state = self.lock();
        state.saves += 1;
        state.last_batch = Some(batch.clone());
        if let Some((kind, message)) = state.injected_failure.take() {
            tracing::debug!(commands = batch.len(), "Injected store failure");
            return Err(StoreError::new(kind, message).with_entities(batch.entities()));
        }

        let mut tables = state.tables.clone();
        let mut sequence = state.sequence;
        match self.execute(&mut tables, &mut sequence, batch) {
            Ok(result) => {
                state.tables = tables;
                state.sequence = sequence;
                tracing::debug!(
                    commands = batch.len(),
                    generated = result.generated().len(),
                    "In-memory store committed batch"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::debug!(error = %e, "In-memory store rolled back batch");
                Err(e.with_entities(batch.entities()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use crate::model::{EntityTypeDef, PropertyDef};
    use crate::relationship::RelationshipDef;
    use crate::store::ModificationCommand;

    fn model(behavior: DeleteBehavior) -> Arc<Model> {
        Arc::new(
            Model::builder()
                .entity(
                    EntityTypeDef::new("Blog")
                        .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                        .primary_key(&["id"]),
                )
                .entity(
                    EntityTypeDef::new("Post")
                        .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
                        .property(PropertyDef::new("blog_id", ValueKind::BigInt).nullable())
                        .primary_key(&["id"]),
                )
                .relationship(
                    RelationshipDef::one_to_many("Blog", "Post")
                        .foreign_key(&["blog_id"])
                        .on_delete(behavior),
                )
                .build()
                .unwrap(),
        )
    }

    fn column(property: usize, name: &str, value: Value, temporary: bool, generated: bool) -> ColumnValue {
        ColumnValue {
            property,
            name: name.to_string(),
            value,
            temporary,
            generated,
        }
    }

    fn insert(model: &Model, raw: u64, type_name: &str, columns: Vec<ColumnValue>) -> ModificationCommand {
        ModificationCommand {
            entity: EntityId::from_raw(raw),
            entity_type: model.find_entity_type(type_name).unwrap().id(),
            type_name: type_name.to_string(),
            operation: CommandOperation::Insert,
            key: Vec::new(),
            columns,
        }
    }

    #[test]
    fn test_placeholders_resolve_to_generated_keys() {
        let model = model(DeleteBehavior::SetNull);
        let store = InMemoryStore::new(Arc::clone(&model));
        let batch = CommandBatch::new(vec![
            insert(&model, 1, "Blog", vec![column(0, "id", Value::BigInt(-5), true, true)]),
            insert(
                &model,
                2,
                "Post",
                vec![
                    column(0, "id", Value::BigInt(-6), true, true),
                    column(1, "blog_id", Value::BigInt(-5), true, false),
                ],
            ),
        ]);

        let result = store.save(&batch).unwrap();
        assert_eq!(result.generated().len(), 2);
        assert_eq!(result.generated()[0].values, vec![(0, Value::BigInt(1))]);
        let posts = store.rows("Post");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].get("blog_id"), Some(&Value::BigInt(1)));
    }

    #[test]
    fn test_missing_principal_rolls_back_batch() {
        let model = model(DeleteBehavior::SetNull);
        let store = InMemoryStore::new(Arc::clone(&model));
        let batch = CommandBatch::new(vec![
            insert(&model, 1, "Blog", vec![column(0, "id", Value::BigInt(-1), true, true)]),
            insert(
                &model,
                2,
                "Post",
                vec![
                    column(0, "id", Value::BigInt(10), false, false),
                    column(1, "blog_id", Value::BigInt(99), false, false),
                ],
            ),
        ]);

        let err = store.save(&batch).unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(err.entities, batch.entities());
        assert!(store.rows("Blog").is_empty());
    }

    #[test]
    fn test_store_side_delete_behaviors() {
        let model_set_null = model(DeleteBehavior::SetNull);
        let store = InMemoryStore::new(Arc::clone(&model_set_null));
        store.seed("Blog", &[("id", Value::BigInt(1))]).unwrap();
        store
            .seed("Post", &[("id", Value::BigInt(2)), ("blog_id", Value::BigInt(1))])
            .unwrap();
        let delete = ModificationCommand {
            entity: EntityId::from_raw(1),
            entity_type: model_set_null.find_entity_type("Blog").unwrap().id(),
            type_name: "Blog".to_string(),
            operation: CommandOperation::Delete,
            key: vec![column(0, "id", Value::BigInt(1), false, false)],
            columns: Vec::new(),
        };
        store.save(&CommandBatch::new(vec![delete.clone()])).unwrap();
        assert_eq!(store.rows("Post")[0].get("blog_id"), Some(&Value::Null));

        let model_no_action = model(DeleteBehavior::NoAction);
        let store = InMemoryStore::new(Arc::clone(&model_no_action));
        store.seed("Blog", &[("id", Value::BigInt(1))]).unwrap();
        store
            .seed("Post", &[("id", Value::BigInt(2)), ("blog_id", Value::BigInt(1))])
            .unwrap();
        let err = store.save(&CommandBatch::new(vec![delete])).unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(store.rows("Blog").len(), 1);
    }

    #[test]
    fn test_injected_failure_and_missing_rows() {
        let model = model(DeleteBehavior::Cascade);
        let store = InMemoryStore::new(Arc::clone(&model));
        store.fail_next_save(StoreErrorKind::Connection, "connection reset");
        let batch = CommandBatch::new(vec![insert(
            &model,
            1,
            "Blog",
            vec![column(0, "id", Value::BigInt(-1), true, true)],
        )]);
        let err = store.save(&batch).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Connection);
        assert_eq!(store.save_count(), 1);
        assert!(store.save(&batch).is_ok());

        let update = ModificationCommand {
            entity: EntityId::from_raw(5),
            entity_type: model.find_entity_type("Blog").unwrap().id(),
            type_name: "Blog".to_string(),
            operation: CommandOperation::Update,
            key: vec![column(0, "id", Value::BigInt(42), false, false)],
            columns: Vec::new(),
        };
        let err = store.save(&CommandBatch::new(vec![update])).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Concurrency);
        assert_eq!(store.save_count(), 3);
        assert!(store.row("Blog", &[Value::BigInt(1)]).is_some());
    }
}
