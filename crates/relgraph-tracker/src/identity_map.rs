//! Identity map for tracked entities.
//!
//! Maps every complete key value (primary and alternate) of every tracked
//! entity to the single instance holding it. Keys belong to root types, so
//! a base type and its derived types share one key space.
//!
//! A deleted entity yields its keys: an added entity may take over the key
//! of a row that is about to be deleted, and owns the slot from then on.
//!
//! The map also indexes dependents by foreign key value, which lets a
//! principal find the dependents that reference it by key alone, before any
//! navigation has been fixed up.

use relgraph_core::{EntityId, EntityType, ForeignKeyId, KeyId, KeyValue, Model, Value};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
struct IndexedKeys {
    keys: Vec<(KeyId, KeyValue)>,
    foreign_keys: Vec<(ForeignKeyId, KeyValue)>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct IdentityMap {
    keys: HashMap<KeyId, HashMap<KeyValue, EntityId>>,
    dependents: HashMap<ForeignKeyId, HashMap<KeyValue, BTreeSet<EntityId>>>,
    indexed: HashMap<EntityId, IndexedKeys>,
    deleted: BTreeSet<EntityId>,
}

/// Extract the values of `properties` as a key.
pub(crate) fn key_of(values: &[Value], properties: &[usize]) -> KeyValue {
    KeyValue::new(
        properties
            .iter()
            .map(|&p| values.get(p).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

impl IdentityMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// (Re)index `entity` from its current values.
    pub(crate) fn index(
        &mut self,
        model: &Model,
        entity: EntityId,
        ty: &EntityType,
        values: &[Value],
        deleted: bool,
    ) {
        self.remove(entity);
        if deleted {
            self.deleted.insert(entity);
        }
        let mut indexed = IndexedKeys::default();
        for &key_id in ty.keys() {
            let key = key_of(values, model.key(key_id).properties());
            if !key.is_complete() {
                continue;
            }
            let slot = self.keys.entry(key_id).or_default();
            match slot.get(&key).copied() {
                // A live holder keeps the slot against a deleted entity.
                Some(existing) if existing != entity => {
                    if !deleted {
                        if !self.deleted.contains(&existing) {
                            tracing::warn!(
                                entity = %entity,
                                displaced = %existing,
                                "Key already mapped to another instance"
                            );
                        }
                        slot.insert(key.clone(), entity);
                    }
                }
                _ => {
                    slot.insert(key.clone(), entity);
                }
            }
            indexed.keys.push((key_id, key));
        }
        for &fk_id in ty.foreign_keys() {
            let key = key_of(values, model.foreign_key(fk_id).properties());
            if !key.is_complete() {
                continue;
            }
            self.dependents
                .entry(fk_id)
                .or_default()
                .entry(key.clone())
                .or_default()
                .insert(entity);
            indexed.foreign_keys.push((fk_id, key));
        }
        self.indexed.insert(entity, indexed);
    }

    /// Drop every index entry of `entity`.
    ///
    /// A key slot it held passes back to a deleted entity with the same key.
    pub(crate) fn remove(&mut self, entity: EntityId) {
        self.deleted.remove(&entity);
        let Some(indexed) = self.indexed.remove(&entity) else {
            return;
        };
        for (key_id, key) in indexed.keys {
            let Some(slot) = self.keys.get_mut(&key_id) else {
                continue;
            };
            if slot.get(&key) != Some(&entity) {
                continue;
            }
            slot.remove(&key);
            let heir = self.deleted.iter().copied().find(|d| {
                self.indexed
                    .get(d)
                    .is_some_and(|i| i.keys.iter().any(|(k, v)| *k == key_id && *v == key))
            });
            if let Some(heir) = heir {
                slot.insert(key, heir);
            }
        }
        for (fk_id, key) in indexed.foreign_keys {
            let Some(by_key) = self.dependents.get_mut(&fk_id) else {
                continue;
            };
            if let Some(set) = by_key.get_mut(&key) {
                set.remove(&entity);
                if set.is_empty() {
                    by_key.remove(&key);
                }
            }
        }
    }

    pub(crate) fn find(&self, key_id: KeyId, key: &KeyValue) -> Option<EntityId> {
        self.keys.get(&key_id).and_then(|slot| slot.get(key)).copied()
    }

    /// Tracked dependents whose `fk` currently holds `key`, in id order.
    pub(crate) fn dependents(&self, fk: ForeignKeyId, key: &KeyValue) -> Vec<EntityId> {
        self.dependents
            .get(&fk)
            .and_then(|by_key| by_key.get(key))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn contains(&self, entity: EntityId) -> bool {
        self.indexed.contains_key(&entity)
    }

    pub(crate) fn len(&self) -> usize {
        self.indexed.len()
    }

    pub(crate) fn clear(&mut self) {
        self.deleted.clear();
        self.keys.clear();
        self.dependents.clear();
        self.indexed.clear();
    }
}
