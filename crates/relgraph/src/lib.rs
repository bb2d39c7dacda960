//! relgraph - relationship fixup and change tracking for object graphs.
//!
//! relgraph keeps an in-memory object graph consistent with the relational
//! model it maps to:
//!
//! - Identity resolution: one tracked instance per key
//! - Entity states (`Added`, `Unchanged`, `Modified`, `Deleted`, `Detached`)
//!   derived from snapshot diffs or explicit transitions
//! - Bidirectional fixup between foreign key values and navigations,
//!   independent of the order writes were made in
//! - Cascading deletes, nulling and restriction per relationship
//! - Ordered save batches with store-generated keys propagated to dependents
//!
//! # Quick Start
//!
//! ```ignore
//! use relgraph::prelude::*;
//!
//! let model = Arc::new(
//!     Model::builder()
//!         .entity(
//!             EntityTypeDef::new("Blog")
//!                 .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
//!                 .primary_key(&["id"]),
//!         )
//!         .entity(
//!             EntityTypeDef::new("Post")
//!                 .property(PropertyDef::new("id", ValueKind::BigInt).generated_on_add())
//!                 .property(PropertyDef::new("blog_id", ValueKind::BigInt))
//!                 .primary_key(&["id"]),
//!         )
//!         .relationship(
//!             RelationshipDef::one_to_many("Blog", "Post")
//!                 .foreign_key(&["blog_id"])
//!                 .principal_navigation("posts")
//!                 .dependent_navigation("blog"),
//!         )
//!         .build()?,
//! );
//!
//! let context = TrackingContext::new(Arc::clone(&model), InMemoryStore::new(model));
//! let blog = context.create("Blog")?;
//! let post = context.create("Post")?;
//! context.set_reference(post, "blog", Some(blog))?;
//! context.add(post)?;
//!
//! assert_eq!(context.collection(blog, "posts")?, vec![post]);
//! context.save_changes()?;
//! ```
//!
//! # Async
//!
//! [`TrackingContext::save_changes_async`] runs the store call on the
//! asupersync runtime and reports an [`Outcome`]; cancellation and store
//! failures leave the tracker exactly as it was.

pub use relgraph_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Values and identity
    EntityId,
    KeyValue,
    Value,
    ValueKind,
    // Model
    DeleteBehavior,
    EntityType,
    EntityTypeDef,
    ForeignKey,
    Model,
    ModelBuilder,
    PropertyDef,
    RelationshipDef,
    RelationshipKind,
    ValueGenerated,
    // Store
    ColumnValue,
    CommandBatch,
    CommandOperation,
    InMemoryStore,
    ModificationCommand,
    SaveResult,
    Store,
    StoreRow,
    // Errors
    Error,
    InvalidOperationKind,
    ModelErrorKind,
    RelationshipErrorKind,
    Result,
    StoreError,
    StoreErrorKind,
};

pub use relgraph_tracker::{
    CascadeTiming, ChangeTrackingStrategy, DetectedChanges, EntityEntry, EntityState,
    EntryDebugInfo, PropertyChange, PropertyEntry, RelationshipChange, RelationshipChangeKind,
    SaveEvent, StateChange, TrackerConfig, TrackerDebugInfo, TrackingContext,
};

/// Sub-crates, for items not re-exported at the top level.
pub use relgraph_core as model_core;
pub use relgraph_tracker as tracker;

/// Everything needed to define a model and track a graph.
pub mod prelude {
    pub use crate::{
        CascadeTiming, ChangeTrackingStrategy, Cx, DeleteBehavior, EntityId, EntityState,
        EntityTypeDef, Error, InMemoryStore, Model, Outcome, PropertyDef, RelationshipDef,
        Result, Store, TrackerConfig, TrackingContext, Value, ValueKind,
    };
    pub use std::sync::Arc;
}
