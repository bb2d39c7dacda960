//! Core types and traits for relgraph.
//!
//! This crate provides the foundations the change tracker is built on:
//!
//! - `Value` and `KeyValue` for property and key values
//! - `Model` for entity types, keys and relationships, built with `ModelBuilder`
//! - `Store` trait the tracker saves through, plus `InMemoryStore`
//! - `Error` taxonomy shared by every relgraph crate
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct saves

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod entity;
pub mod error;
pub mod memory_store;
pub mod model;
pub mod relationship;
pub mod store;
pub mod value;

pub use entity::EntityId;
pub use error::{
    Error, InvalidOperationError, InvalidOperationKind, ModelError, ModelErrorKind,
    RelationshipError, RelationshipErrorKind, Result, StoreError, StoreErrorKind,
};
pub use memory_store::{InMemoryStore, StoreRow};
pub use model::{
    EntityType, EntityTypeDef, EntityTypeId, Key, KeyId, Model, ModelBuilder, Navigation,
    Property, PropertyDef, ValueGenerated,
};
pub use relationship::{
    DeleteBehavior, ForeignKey, ForeignKeyId, RelationshipDef, RelationshipKind,
};
pub use store::{
    ColumnValue, CommandBatch, CommandOperation, GeneratedValues, ModificationCommand,
    SaveResult, Store,
};
pub use value::{KeyValue, Value, ValueKind};
