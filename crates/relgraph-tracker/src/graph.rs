//! The instance arena.
//!
//! Instances are owned by the arena and addressed by [`EntityId`].
//! Navigations hold ids, never owning pointers, so a principal and its
//! dependents reference each other without ownership cycles. Instances are
//! never removed: detaching an entity stops tracking it, the caller's graph
//! keeps it.

use relgraph_core::{EntityId, EntityType, EntityTypeId, Error, InvalidOperationKind, Result, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// Current value of one navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) enum NavigationValue {
    Reference(Option<EntityId>),
    Collection(Vec<EntityId>),
}

impl NavigationValue {
    pub(crate) fn empty(collection: bool) -> Self {
        if collection {
            NavigationValue::Collection(Vec::new())
        } else {
            NavigationValue::Reference(None)
        }
    }

    /// Every entity the navigation points at.
    pub(crate) fn targets(&self) -> Vec<EntityId> {
        match self {
            NavigationValue::Reference(target) => target.iter().copied().collect(),
            NavigationValue::Collection(members) => members.clone(),
        }
    }

    pub(crate) fn reference(&self) -> Option<EntityId> {
        match self {
            NavigationValue::Reference(target) => *target,
            NavigationValue::Collection(_) => None,
        }
    }

    pub(crate) fn contains(&self, entity: EntityId) -> bool {
        match self {
            NavigationValue::Reference(target) => *target == Some(entity),
            NavigationValue::Collection(members) => members.contains(&entity),
        }
    }

    /// Add to a collection; returns false if already present.
    pub(crate) fn insert(&mut self, entity: EntityId) -> bool {
        match self {
            NavigationValue::Collection(members) if !members.contains(&entity) => {
                members.push(entity);
                true
            }
            _ => false,
        }
    }

    /// Remove from a collection; returns false if absent.
    pub(crate) fn remove(&mut self, entity: EntityId) -> bool {
        match self {
            NavigationValue::Collection(members) => {
                let before = members.len();
                members.retain(|m| *m != entity);
                members.len() != before
            }
            NavigationValue::Reference(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Instance {
    pub(crate) entity_type: EntityTypeId,
    pub(crate) values: Vec<Value>,
    pub(crate) navigations: Vec<NavigationValue>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct EntityGraph {
    instances: BTreeMap<EntityId, Instance>,
    next_id: u64,
}

impl EntityGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create an instance with every property NULL and every navigation empty.
    pub(crate) fn create(&mut self, entity_type: &EntityType) -> EntityId {
        self.next_id += 1;
        let id = EntityId::from_raw(self.next_id);
        let navigations = entity_type
            .navigations()
            .iter()
            .map(|n| NavigationValue::empty(n.is_collection()))
            .collect();
        self.instances.insert(
            id,
            Instance {
                entity_type: entity_type.id(),
                values: vec![Value::Null; entity_type.properties().len()],
                navigations,
            },
        );
        id
    }

    pub(crate) fn get(&self, id: EntityId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: EntityId) -> Option<&mut Instance> {
        self.instances.get_mut(&id)
    }

    /// Look up an instance, failing with `UnknownEntity`.
    pub(crate) fn instance(&self, id: EntityId) -> Result<&Instance> {
        self.get(id).ok_or_else(|| unknown_entity(id))
    }

    pub(crate) fn instance_mut(&mut self, id: EntityId) -> Result<&mut Instance> {
        self.get_mut(id).ok_or_else(|| unknown_entity(id))
    }

    pub(crate) fn value(&self, id: EntityId, property: usize) -> Value {
        self.get(id)
            .and_then(|i| i.values.get(property))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub(crate) fn values_of(&self, id: EntityId, properties: &[usize]) -> Vec<Value> {
        properties.iter().map(|&p| self.value(id, p)).collect()
    }

    pub(crate) fn navigation(&self, id: EntityId, navigation: usize) -> Option<&NavigationValue> {
        self.get(id).and_then(|i| i.navigations.get(navigation))
    }

    pub(crate) fn len(&self) -> usize {
        self.instances.len()
    }
}

fn unknown_entity(id: EntityId) -> Error {
    Error::invalid(
        InvalidOperationKind::UnknownEntity,
        format!("entity {} does not belong to this tracking context", id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgraph_core::{EntityTypeDef, Model, PropertyDef, RelationshipDef, ValueKind};

    fn model() -> Model {
        Model::builder()
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
            .relationship(
                RelationshipDef::one_to_many("Blog", "Post")
                    .foreign_key(&["blog_id"])
                    .principal_navigation("posts")
                    .dependent_navigation("blog"),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_initializes_members() {
        let model = model();
        let mut graph = EntityGraph::new();
        let blog = graph.create(model.find_entity_type("Blog").unwrap());
        let post = graph.create(model.find_entity_type("Post").unwrap());

        assert_ne!(blog, post);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.value(post, 1), Value::Null);
        assert_eq!(
            graph.navigation(blog, 0),
            Some(&NavigationValue::Collection(Vec::new()))
        );
        assert_eq!(graph.navigation(post, 0), Some(&NavigationValue::Reference(None)));
        assert!(graph.instance(EntityId::from_raw(99)).is_err());
    }

    #[test]
    fn test_collection_membership_is_a_set() {
        let mut nav = NavigationValue::empty(true);
        let a = EntityId::from_raw(1);
        assert!(nav.insert(a));
        assert!(!nav.insert(a));
        assert!(nav.contains(a));
        assert_eq!(nav.targets(), vec![a]);
        assert!(nav.remove(a));
        assert!(!nav.remove(a));

        let reference = NavigationValue::Reference(Some(a));
        assert_eq!(reference.reference(), Some(a));
        assert_eq!(reference.targets(), vec![a]);
    }
}
