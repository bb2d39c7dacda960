//! Relationship metadata.
//!
//! A relationship is described from the dependent's point of view: the
//! dependent carries foreign key properties that address a key of the
//! principal. Either side may expose a navigation.

use crate::model::{EntityTypeId, KeyId};
use serde::{Deserialize, Serialize};

/// Identifies one relationship (foreign key) in a [`Model`](crate::Model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignKeyId(pub(crate) usize);

impl ForeignKeyId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Cardinality of a relationship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// One principal has many dependents; the principal navigation is a collection.
    #[default]
    OneToMany,
    /// One principal has at most one dependent; both navigations are references.
    OneToOne,
}

/// What happens to dependents when their principal is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteBehavior {
    /// Dependents are deleted with the principal.
    Cascade,
    /// Dependents' foreign keys are nulled; the store does the same for
    /// rows that are not tracked. Only valid for optional relationships.
    SetNull,
    /// Tracked dependents' foreign keys are nulled; the store is left alone.
    ClientSetNull,
    /// A required dependent blocks the delete; optional ones are nulled.
    Restrict,
    /// The tracker takes no action; the store enforces the constraint.
    NoAction,
}

impl DeleteBehavior {
    /// Whether the store itself nulls or deletes dependent rows.
    pub const fn handled_by_store(self) -> bool {
        matches!(self, DeleteBehavior::Cascade | DeleteBehavior::SetNull)
    }
}

/// A resolved relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub(crate) id: ForeignKeyId,
    pub(crate) name: String,
    pub(crate) kind: RelationshipKind,
    pub(crate) dependent_type: EntityTypeId,
    pub(crate) principal_type: EntityTypeId,
    pub(crate) properties: Vec<usize>,
    pub(crate) principal_key: KeyId,
    pub(crate) required: bool,
    pub(crate) delete_behavior: DeleteBehavior,
    pub(crate) dependent_navigation: Option<usize>,
    pub(crate) principal_navigation: Option<usize>,
}

impl ForeignKey {
    pub fn id(&self) -> ForeignKeyId {
        self.id
    }

    /// Display name, `Dependent.fk_property[, ...]` unless one was given.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RelationshipKind {
        self.kind
    }

    pub fn is_unique(&self) -> bool {
        self.kind == RelationshipKind::OneToOne
    }

    /// Required relationships have no nullable foreign key property.
    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn dependent_type(&self) -> EntityTypeId {
        self.dependent_type
    }

    pub fn principal_type(&self) -> EntityTypeId {
        self.principal_type
    }

    /// Foreign key property indices on the dependent type, in key order.
    pub fn properties(&self) -> &[usize] {
        &self.properties
    }

    pub fn principal_key(&self) -> KeyId {
        self.principal_key
    }

    pub fn delete_behavior(&self) -> DeleteBehavior {
        self.delete_behavior
    }

    /// Navigation index on the dependent type pointing at the principal.
    pub fn dependent_navigation(&self) -> Option<usize> {
        self.dependent_navigation
    }

    /// Navigation index on the principal type exposing the dependents.
    pub fn principal_navigation(&self) -> Option<usize> {
        self.principal_navigation
    }
}

/// Definition of a relationship, resolved by [`ModelBuilder::build`](crate::ModelBuilder::build).
///
/// ```ignore
/// RelationshipDef::one_to_many("Blog", "Post")
///     .foreign_key(&["blog_id"])
///     .principal_navigation("posts")
///     .dependent_navigation("blog")
///     .on_delete(DeleteBehavior::SetNull)
/// ```
#[derive(Debug, Clone)]
pub struct RelationshipDef {
    pub(crate) kind: RelationshipKind,
    pub(crate) name: Option<String>,
    pub(crate) principal: String,
    pub(crate) dependent: String,
    pub(crate) foreign_key: Vec<String>,
    pub(crate) principal_key: Option<Vec<String>>,
    pub(crate) principal_navigation: Option<String>,
    pub(crate) dependent_navigation: Option<String>,
    pub(crate) delete_behavior: Option<DeleteBehavior>,
}

impl RelationshipDef {
    fn new(kind: RelationshipKind, principal: &str, dependent: &str) -> Self {
        Self {
            kind,
            name: None,
            principal: principal.to_string(),
            dependent: dependent.to_string(),
            foreign_key: Vec::new(),
            principal_key: None,
            principal_navigation: None,
            dependent_navigation: None,
            delete_behavior: None,
        }
    }

    pub fn one_to_many(principal: &str, dependent: &str) -> Self {
        Self::new(RelationshipKind::OneToMany, principal, dependent)
    }

    pub fn one_to_one(principal: &str, dependent: &str) -> Self {
        Self::new(RelationshipKind::OneToOne, principal, dependent)
    }

    /// Name used in errors and logs.
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Foreign key properties on the dependent, in principal key order.
    pub fn foreign_key(mut self, properties: &[&str]) -> Self {
        self.foreign_key = properties.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// Principal key addressed by the foreign key. Defaults to the primary
    /// key; an undeclared property list becomes an alternate key.
    pub fn principal_key(mut self, properties: &[&str]) -> Self {
        self.principal_key = Some(properties.iter().map(|p| (*p).to_string()).collect());
        self
    }

    pub fn principal_navigation(mut self, name: &str) -> Self {
        self.principal_navigation = Some(name.to_string());
        self
    }

    pub fn dependent_navigation(mut self, name: &str) -> Self {
        self.dependent_navigation = Some(name.to_string());
        self
    }

    /// Delete behavior. Defaults to `Cascade` for required relationships
    /// and `ClientSetNull` for optional ones.
    pub fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        self.delete_behavior = Some(behavior);
        self
    }
}
