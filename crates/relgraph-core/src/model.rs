//! The resolved metadata model.
//!
//! A [`Model`] is built once by [`ModelBuilder`] and then shared read-only by
//! every tracking context. Lookups are keyed by the runtime entity type, so a
//! relationship declared on a base type is found for every derived type and
//! a relationship declared on a derived type is invisible to its siblings.
//!
//! Derived types flatten their base: the base's properties and navigations
//! come first with the same indices, so an index resolved against a base
//! type is valid for every type derived from it.

use crate::error::{ModelError, ModelErrorKind, Result};
use crate::relationship::{
    DeleteBehavior, ForeignKey, ForeignKeyId, RelationshipDef, RelationshipKind,
};
use crate::value::ValueKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Identifies an entity type in a [`Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityTypeId(pub(crate) usize);

impl EntityTypeId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Identifies a primary or alternate key in a [`Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId(pub(crate) usize);

impl KeyId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// When the store generates a property value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueGenerated {
    #[default]
    Never,
    /// Generated on insert; the tracker uses a temporary value until then.
    OnAdd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    name: String,
    kind: ValueKind,
    nullable: bool,
    value_generated: ValueGenerated,
    read_only_after_save: bool,
}

impl Property {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn value_generated(&self) -> ValueGenerated {
        self.value_generated
    }

    pub fn is_read_only_after_save(&self) -> bool {
        self.read_only_after_save
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    id: KeyId,
    entity_type: EntityTypeId,
    properties: Vec<usize>,
    primary: bool,
}

impl Key {
    pub fn id(&self) -> KeyId {
        self.id
    }

    /// The root type owning the key.
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    pub fn properties(&self) -> &[usize] {
        &self.properties
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Navigation {
    name: String,
    foreign_key: ForeignKeyId,
    collection: bool,
    on_dependent: bool,
}

impl Navigation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn foreign_key(&self) -> ForeignKeyId {
        self.foreign_key
    }

    pub fn is_collection(&self) -> bool {
        self.collection
    }

    /// True for the dependent-to-principal reference.
    pub fn is_on_dependent(&self) -> bool {
        self.on_dependent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityType {
    id: EntityTypeId,
    name: String,
    base: Option<EntityTypeId>,
    root: EntityTypeId,
    properties: Vec<Property>,
    navigations: Vec<Navigation>,
    primary_key: KeyId,
    keys: Vec<KeyId>,
    foreign_keys: Vec<ForeignKeyId>,
    referencing_foreign_keys: Vec<ForeignKeyId>,
}

impl EntityType {
    pub fn id(&self) -> EntityTypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Option<EntityTypeId> {
        self.base
    }

    pub fn root(&self) -> EntityTypeId {
        self.root
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, index: usize) -> &Property {
        &self.properties[index]
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn navigations(&self) -> &[Navigation] {
        &self.navigations
    }

    pub fn navigation(&self, index: usize) -> &Navigation {
        &self.navigations[index]
    }

    pub fn navigation_index(&self, name: &str) -> Option<usize> {
        self.navigations.iter().position(|n| n.name == name)
    }

    pub fn primary_key(&self) -> KeyId {
        self.primary_key
    }

    /// Primary key followed by alternate keys.
    pub fn keys(&self) -> &[KeyId] {
        &self.keys
    }

    /// Relationships in which instances of this type are the dependent.
    pub fn foreign_keys(&self) -> &[ForeignKeyId] {
        &self.foreign_keys
    }

    /// Relationships in which instances of this type are the principal.
    pub fn referencing_foreign_keys(&self) -> &[ForeignKeyId] {
        &self.referencing_foreign_keys
    }
}

/// Resolved relationship metadata for a set of entity types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    entity_types: Vec<EntityType>,
    keys: Vec<Key>,
    foreign_keys: Vec<ForeignKey>,
    by_name: HashMap<String, EntityTypeId>,
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::new()
    }

    pub fn entity_types(&self) -> &[EntityType] {
        &self.entity_types
    }

    pub fn entity_type(&self, id: EntityTypeId) -> &EntityType {
        &self.entity_types[id.0]
    }

    pub fn find_entity_type(&self, name: &str) -> Option<&EntityType> {
        self.by_name.get(name).map(|id| &self.entity_types[id.0])
    }

    pub fn key(&self, id: KeyId) -> &Key {
        &self.keys[id.0]
    }

    pub fn foreign_key(&self, id: ForeignKeyId) -> &ForeignKey {
        &self.foreign_keys[id.0]
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Whether `derived` is `base` or a type derived from it.
    pub fn is_assignable(&self, base: EntityTypeId, derived: EntityTypeId) -> bool {
        let mut current = Some(derived);
        while let Some(id) = current {
            if id == base {
                return true;
            }
            current = self.entity_types[id.0].base;
        }
        false
    }

    /// Names of the foreign key properties of `fk`, for messages.
    pub fn foreign_key_property_names(&self, fk: ForeignKeyId) -> Vec<&str> {
        let fk = self.foreign_key(fk);
        let dependent = self.entity_type(fk.dependent_type);
        fk.properties
            .iter()
            .map(|&p| dependent.property(p).name())
            .collect()
    }
}

/// Definition of one property.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    name: String,
    kind: ValueKind,
    nullable: bool,
    value_generated: ValueGenerated,
    read_only_after_save: bool,
}

impl PropertyDef {
    pub fn new(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            nullable: false,
            value_generated: ValueGenerated::Never,
            read_only_after_save: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// The store generates this value on insert.
    pub fn generated_on_add(mut self) -> Self {
        self.value_generated = ValueGenerated::OnAdd;
        self
    }

    /// Changing this value once the entity exists in the store is an error.
    pub fn read_only_after_save(mut self) -> Self {
        self.read_only_after_save = true;
        self
    }
}

/// Definition of one entity type.
#[derive(Debug, Clone)]
pub struct EntityTypeDef {
    name: String,
    base: Option<String>,
    properties: Vec<PropertyDef>,
    primary_key: Vec<String>,
    alternate_keys: Vec<Vec<String>>,
}

impl EntityTypeDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base: None,
            properties: Vec::new(),
            primary_key: Vec::new(),
            alternate_keys: Vec::new(),
        }
    }

    /// Derive from `base`, inheriting its properties, keys and relationships.
    pub fn derives_from(mut self, base: &str) -> Self {
        self.base = Some(base.to_string());
        self
    }

    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    pub fn primary_key(mut self, properties: &[&str]) -> Self {
        self.primary_key = properties.iter().map(|p| (*p).to_string()).collect();
        self
    }

    pub fn alternate_key(mut self, properties: &[&str]) -> Self {
        self.alternate_keys
            .push(properties.iter().map(|p| (*p).to_string()).collect());
        self
    }
}

/// Builds and validates a [`Model`].
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    entity_types: Vec<EntityTypeDef>,
    relationships: Vec<RelationshipDef>,
}

fn model_error(kind: ModelErrorKind, message: impl Into<String>) -> crate::Error {
    ModelError::new(kind, message).into()
}

struct OwnNavigation {
    name: String,
    foreign_key: ForeignKeyId,
    collection: bool,
    on_dependent: bool,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, def: EntityTypeDef) -> Self {
        self.entity_types.push(def);
        self
    }

    pub fn relationship(mut self, def: RelationshipDef) -> Self {
        self.relationships.push(def);
        self
    }

    /// Resolve names, flatten hierarchies and validate relationships.
    #[tracing::instrument(level = "debug", skip(self), fields(types = self.entity_types.len(), relationships = self.relationships.len()))]
    pub fn build(self) -> Result<Model> {
        let mut by_name = HashMap::new();
        for (index, def) in self.entity_types.iter().enumerate() {
            if by_name.insert(def.name.clone(), EntityTypeId(index)).is_some() {
                return Err(model_error(
                    ModelErrorKind::DuplicateName,
                    format!("entity type '{}' is defined twice", def.name),
                ));
            }
        }

        let lookup = |name: &str| {
            by_name.get(name).copied().ok_or_else(|| {
                model_error(
                    ModelErrorKind::UnknownEntityType,
                    format!("unknown entity type '{}'", name),
                )
            })
        };

        let mut bases = Vec::with_capacity(self.entity_types.len());
        for def in &self.entity_types {
            bases.push(match &def.base {
                Some(base) => Some(lookup(base)?),
                None => None,
            });
        }
        let order = hierarchy_order(&self.entity_types, &bases)?;

        // Properties, flattened base-first.
        let mut properties: Vec<Vec<Property>> = vec![Vec::new(); self.entity_types.len()];
        let mut roots = vec![EntityTypeId(0); self.entity_types.len()];
        for &index in &order {
            let def = &self.entity_types[index];
            let mut props = match bases[index] {
                Some(base) => {
                    roots[index] = roots[base.0];
                    properties[base.0].clone()
                }
                None => {
                    roots[index] = EntityTypeId(index);
                    Vec::new()
                }
            };
            for p in &def.properties {
                if props.iter().any(|existing| existing.name == p.name) {
                    return Err(model_error(
                        ModelErrorKind::DuplicateName,
                        format!("property '{}.{}' is defined twice", def.name, p.name),
                    ));
                }
                props.push(Property {
                    name: p.name.clone(),
                    kind: p.kind,
                    nullable: p.nullable,
                    value_generated: p.value_generated,
                    read_only_after_save: p.read_only_after_save,
                });
            }
            properties[index] = props;
        }

        // Keys live on root types.
        let mut keys: Vec<Key> = Vec::new();
        let mut type_keys: Vec<Vec<KeyId>> = vec![Vec::new(); self.entity_types.len()];
        for &index in &order {
            let def = &self.entity_types[index];
            if bases[index].is_some() {
                if !def.primary_key.is_empty() || !def.alternate_keys.is_empty() {
                    return Err(model_error(
                        ModelErrorKind::KeyMismatch,
                        format!("derived type '{}' cannot declare keys", def.name),
                    ));
                }
                continue;
            }
            if def.primary_key.is_empty() {
                return Err(model_error(
                    ModelErrorKind::MissingPrimaryKey,
                    format!("entity type '{}' has no primary key", def.name),
                ));
            }
            let pk = resolve_properties(&def.name, &properties[index], &def.primary_key)?;
            for &p in &pk {
                let prop = &properties[index][p];
                if prop.value_generated == ValueGenerated::OnAdd
                    && !prop.kind.supports_temporary_values()
                {
                    return Err(model_error(
                        ModelErrorKind::InvalidGeneratedKey,
                        format!(
                            "generated key '{}.{}' has kind {} which has no temporary values",
                            def.name,
                            prop.name,
                            prop.kind.name()
                        ),
                    ));
                }
            }
            let id = KeyId(keys.len());
            keys.push(Key {
                id,
                entity_type: EntityTypeId(index),
                properties: pk,
                primary: true,
            });
            type_keys[index].push(id);
            for alternate in &def.alternate_keys {
                let props = resolve_properties(&def.name, &properties[index], alternate)?;
                let id = KeyId(keys.len());
                keys.push(Key {
                    id,
                    entity_type: EntityTypeId(index),
                    properties: props,
                    primary: false,
                });
                type_keys[index].push(id);
            }
        }

        // Relationships.
        let mut foreign_keys = Vec::with_capacity(self.relationships.len());
        let mut own_navigations: Vec<Vec<OwnNavigation>> =
            (0..self.entity_types.len()).map(|_| Vec::new()).collect();
        let mut navigation_names: Vec<(Option<String>, Option<String>)> = Vec::new();
        for (index, def) in self.relationships.iter().enumerate() {
            let id = ForeignKeyId(index);
            let dependent = lookup(&def.dependent)?;
            let principal = lookup(&def.principal)?;
            let dependent_props = &properties[dependent.0];
            let fk_props = resolve_properties(&def.dependent, dependent_props, &def.foreign_key)?;
            if fk_props.is_empty() {
                return Err(model_error(
                    ModelErrorKind::KeyMismatch,
                    format!(
                        "relationship {} -> {} declares no foreign key properties",
                        def.dependent, def.principal
                    ),
                ));
            }

            let principal_root = roots[principal.0];
            let principal_key = match &def.principal_key {
                None => type_keys[principal_root.0][0],
                Some(names) => {
                    let root_props = &properties[principal_root.0];
                    let root_name = &self.entity_types[principal_root.0].name;
                    let resolved = resolve_properties(root_name, root_props, names)?;
                    let existing = type_keys[principal_root.0]
                        .iter()
                        .copied()
                        .find(|k| keys[k.0].properties == resolved);
                    if let Some(existing) = existing {
                        existing
                    } else {
                        let key = KeyId(keys.len());
                        keys.push(Key {
                            id: key,
                            entity_type: principal_root,
                            properties: resolved,
                            primary: false,
                        });
                        type_keys[principal_root.0].push(key);
                        key
                    }
                }
            };

            let key_props = &keys[principal_key.0].properties;
            if key_props.len() != fk_props.len() {
                return Err(model_error(
                    ModelErrorKind::KeyMismatch,
                    format!(
                        "relationship {} -> {} has {} foreign key properties for a {}-part key",
                        def.dependent,
                        def.principal,
                        fk_props.len(),
                        key_props.len()
                    ),
                ));
            }
            let principal_props = &properties[principal_root.0];
            for (&fk, &pk) in fk_props.iter().zip(key_props) {
                if dependent_props[fk].kind != principal_props[pk].kind {
                    return Err(model_error(
                        ModelErrorKind::KeyMismatch,
                        format!(
                            "foreign key '{}.{}' is {} but principal key '{}' is {}",
                            def.dependent,
                            dependent_props[fk].name,
                            dependent_props[fk].kind.name(),
                            principal_props[pk].name,
                            principal_props[pk].kind.name()
                        ),
                    ));
                }
            }

            let required = fk_props.iter().all(|&p| !dependent_props[p].nullable);
            let delete_behavior = def.delete_behavior.unwrap_or(if required {
                DeleteBehavior::Cascade
            } else {
                DeleteBehavior::ClientSetNull
            });
            if required && delete_behavior == DeleteBehavior::SetNull {
                return Err(model_error(
                    ModelErrorKind::InvalidDeleteBehavior,
                    format!(
                        "relationship {} -> {} is required and cannot use SetNull",
                        def.dependent, def.principal
                    ),
                ));
            }

            let name = def.name.clone().unwrap_or_else(|| {
                let names: Vec<&str> = fk_props
                    .iter()
                    .map(|&p| dependent_props[p].name.as_str())
                    .collect();
                format!("{}.{}", def.dependent, names.join(","))
            });

            if let Some(nav) = &def.dependent_navigation {
                own_navigations[dependent.0].push(OwnNavigation {
                    name: nav.clone(),
                    foreign_key: id,
                    collection: false,
                    on_dependent: true,
                });
            }
            if let Some(nav) = &def.principal_navigation {
                own_navigations[principal.0].push(OwnNavigation {
                    name: nav.clone(),
                    foreign_key: id,
                    collection: def.kind == RelationshipKind::OneToMany,
                    on_dependent: false,
                });
            }
            navigation_names.push((
                def.dependent_navigation.clone(),
                def.principal_navigation.clone(),
            ));

            foreign_keys.push(ForeignKey {
                id,
                name,
                kind: def.kind,
                dependent_type: dependent,
                principal_type: principal,
                properties: fk_props,
                principal_key,
                required,
                delete_behavior,
                dependent_navigation: None,
                principal_navigation: None,
            });
        }

        // Navigations, flattened base-first.
        let mut navigations: Vec<Vec<Navigation>> = vec![Vec::new(); self.entity_types.len()];
        for &index in &order {
            let mut navs = match bases[index] {
                Some(base) => navigations[base.0].clone(),
                None => Vec::new(),
            };
            for own in &own_navigations[index] {
                let clashes = navs.iter().any(|n| n.name == own.name)
                    || properties[index].iter().any(|p| p.name == own.name);
                if clashes {
                    return Err(model_error(
                        ModelErrorKind::DuplicateName,
                        format!(
                            "navigation '{}.{}' clashes with an existing member",
                            self.entity_types[index].name, own.name
                        ),
                    ));
                }
                navs.push(Navigation {
                    name: own.name.clone(),
                    foreign_key: own.foreign_key,
                    collection: own.collection,
                    on_dependent: own.on_dependent,
                });
            }
            navigations[index] = navs;
        }
        for (fk, (dependent_nav, principal_nav)) in foreign_keys.iter_mut().zip(&navigation_names) {
            fk.dependent_navigation = dependent_nav.as_ref().and_then(|name| {
                navigations[fk.dependent_type.0]
                    .iter()
                    .position(|n| &n.name == name)
            });
            fk.principal_navigation = principal_nav.as_ref().and_then(|name| {
                navigations[fk.principal_type.0]
                    .iter()
                    .position(|n| &n.name == name)
            });
        }

        let mut entity_types: Vec<EntityType> = self
            .entity_types
            .iter()
            .enumerate()
            .map(|(index, def)| {
                let root = roots[index];
                EntityType {
                    id: EntityTypeId(index),
                    name: def.name.clone(),
                    base: bases[index],
                    root,
                    properties: std::mem::take(&mut properties[index]),
                    navigations: std::mem::take(&mut navigations[index]),
                    primary_key: type_keys[root.0][0],
                    keys: type_keys[root.0].clone(),
                    foreign_keys: Vec::new(),
                    referencing_foreign_keys: Vec::new(),
                }
            })
            .collect();

        let mut model = Model {
            entity_types: Vec::new(),
            keys,
            foreign_keys,
            by_name,
        };
        // Derived types sort after their base, so the base chain is complete here.
        let snapshot: Vec<Option<EntityTypeId>> = entity_types.iter().map(|t| t.base).collect();
        let assignable = |base: EntityTypeId, derived: EntityTypeId| {
            let mut current = Some(derived);
            while let Some(id) = current {
                if id == base {
                    return true;
                }
                current = snapshot[id.0];
            }
            false
        };
        for ty in &mut entity_types {
            for fk in &model.foreign_keys {
                if assignable(fk.dependent_type, ty.id) {
                    ty.foreign_keys.push(fk.id);
                }
                if assignable(fk.principal_type, ty.id) {
                    ty.referencing_foreign_keys.push(fk.id);
                }
            }
        }
        model.entity_types = entity_types;

        validate_exclusive_claims(&model)?;

        tracing::debug!(
            entity_types = model.entity_types.len(),
            keys = model.keys.len(),
            foreign_keys = model.foreign_keys.len(),
            "Built relationship model"
        );
        Ok(model)
    }
}

fn resolve_properties(type_name: &str, props: &[Property], names: &[String]) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|name| {
            props.iter().position(|p| &p.name == name).ok_or_else(|| {
                model_error(
                    ModelErrorKind::UnknownProperty,
                    format!("entity type '{}' has no property '{}'", type_name, name),
                )
            })
        })
        .collect()
}

/// Indices sorted so every type comes after its base.
fn hierarchy_order(defs: &[EntityTypeDef], bases: &[Option<EntityTypeId>]) -> Result<Vec<usize>> {
    let mut depth = vec![0usize; defs.len()];
    for (index, def) in defs.iter().enumerate() {
        let mut current = bases[index];
        let mut steps = 0;
        while let Some(base) = current {
            steps += 1;
            if steps > defs.len() {
                return Err(model_error(
                    ModelErrorKind::InheritanceCycle,
                    format!("entity type '{}' inherits from itself", def.name),
                ));
            }
            current = bases[base.0];
        }
        depth[index] = steps;
    }
    let mut order: Vec<usize> = (0..defs.len()).collect();
    order.sort_by_key(|&i| (depth[i], i));
    Ok(order)
}

/// At most one relationship may claim a dependent through a given foreign
/// key property. Two relationships conflict when their dependent types
/// overlap in the hierarchy and their foreign key properties intersect.
fn validate_exclusive_claims(model: &Model) -> Result<()> {
    let fks = &model.foreign_keys;
    for (i, a) in fks.iter().enumerate() {
        for b in &fks[i + 1..] {
            let overlap = model.is_assignable(a.dependent_type, b.dependent_type)
                || model.is_assignable(b.dependent_type, a.dependent_type);
            if !overlap {
                continue;
            }
            let a_props: BTreeSet<usize> = a.properties.iter().copied().collect();
            if b.properties.iter().any(|p| a_props.contains(p)) {
                return Err(model_error(
                    ModelErrorKind::OverlappingForeignKeys,
                    format!(
                        "relationships '{}' and '{}' claim the same dependent through shared foreign key properties",
                        a.name, b.name
                    ),
                ));
            }
        }
    }
    Ok(())
}
