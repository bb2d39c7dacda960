//! Error types for tracking, fixup and save operations.

use crate::entity::EntityId;
use std::fmt;

/// The primary error type for all relgraph operations.
#[derive(Debug)]
pub enum Error {
    /// Misuse of the tracker (reentrancy, read-only writes, unknown names)
    InvalidOperation(InvalidOperationError),
    /// A relationship would be left in a state the model does not allow
    Relationship(RelationshipError),
    /// The persistence store rejected a save
    Store(StoreError),
    /// The metadata model is inconsistent
    Model(ModelError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct InvalidOperationError {
    pub kind: InvalidOperationKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidOperationKind {
    /// The context was entered while another operation was in progress
    ConcurrentUse,
    /// No entity type with that name exists in the model
    UnknownEntityType,
    /// The handle does not address an instance of this context
    UnknownEntity,
    /// The entity type has no property with that name
    UnknownProperty,
    /// The entity type has no navigation with that name
    UnknownNavigation,
    /// The operation requires a tracked entity
    NotTracked,
    /// Another tracked instance already has the same key
    IdentityConflict,
    /// A key required for tracking is NULL
    NullKey,
    /// The value does not match the declared property kind
    TypeMismatch,
    /// A key property of an entity that exists in the store was changed
    KeyModified,
    /// A read-only property of an entity that exists in the store was changed
    ReadOnlyProperty,
    /// A navigation was pointed at an instance of the wrong type
    InvalidNavigationTarget,
    /// Commands cannot be ordered because entities depend on each other
    CircularDependency,
    /// Fixup kept producing new writes and change detection never settled
    DetectionUnsettled,
}

#[derive(Debug)]
pub struct RelationshipError {
    pub kind: RelationshipErrorKind,
    pub message: String,
    pub foreign_key: String,
    pub principal_type: String,
    pub dependent_type: String,
    /// Dependents that caused the violation.
    pub entities: Vec<EntityId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipErrorKind {
    /// Deleting the principal would orphan a required dependent
    RequiredDependent,
    /// A required dependent was severed from its principal without replacement
    SeveredRequired,
    /// A dependent was claimed by more than one principal at once
    AmbiguousPrincipal,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
    /// Entities whose commands were part of the failed batch.
    pub entities: Vec<EntityId>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Unique, primary key or foreign key constraint violation
    Constraint,
    /// An update or delete matched no row
    Concurrency,
    /// The store could not be reached
    Connection,
    /// A temporary placeholder did not match any insert in the batch
    UnresolvedTemporary,
    /// Other store failure
    Other,
}

#[derive(Debug)]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    UnknownEntityType,
    UnknownProperty,
    DuplicateName,
    MissingPrimaryKey,
    KeyMismatch,
    InvalidDeleteBehavior,
    OverlappingForeignKeys,
    InvalidGeneratedKey,
    InheritanceCycle,
}

impl InvalidOperationError {
    pub fn new(kind: InvalidOperationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            entities: Vec::new(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_entities(mut self, entities: Vec<EntityId>) -> Self {
        self.entities = entities;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Box<dyn std::error::Error + Send + Sync>) -> Self {
        self.source = Some(source);
        self
    }

    /// Is this a constraint violation reported by the store?
    pub fn is_constraint_violation(&self) -> bool {
        self.kind == StoreErrorKind::Constraint
    }
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Error {
    /// Shorthand for an `InvalidOperation` error.
    pub fn invalid(kind: InvalidOperationKind, message: impl Into<String>) -> Self {
        Error::InvalidOperation(InvalidOperationError::new(kind, message))
    }

    /// Is this the reentrancy error raised by the concurrency guard?
    pub fn is_concurrent_use(&self) -> bool {
        matches!(
            self,
            Error::InvalidOperation(InvalidOperationError {
                kind: InvalidOperationKind::ConcurrentUse,
                ..
            })
        )
    }

    /// Is this a relationship integrity violation?
    pub fn is_relationship_violation(&self) -> bool {
        matches!(self, Error::Relationship(_))
    }

    /// Is this a failure reported by the persistence store?
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::Store(_))
    }

    /// Kind of an `InvalidOperation` error, if this is one.
    pub fn invalid_operation_kind(&self) -> Option<InvalidOperationKind> {
        match self {
            Error::InvalidOperation(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Kind of a `Relationship` error, if this is one.
    pub fn relationship_kind(&self) -> Option<RelationshipErrorKind> {
        match self {
            Error::Relationship(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Entities implicated by this error.
    pub fn entities(&self) -> &[EntityId] {
        match self {
            Error::Relationship(e) => &e.entities,
            Error::Store(e) => &e.entities,
            _ => &[],
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidOperation(e) => write!(f, "Invalid operation: {}", e.message),
            Error::Relationship(e) => write!(f, "Relationship integrity violation: {}", e),
            Error::Store(e) => write!(f, "Store update failed: {}", e),
            Error::Model(e) => write!(f, "Model error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for InvalidOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for RelationshipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} -> {} via '{}')",
            self.message, self.dependent_type, self.principal_type, self.foreign_key
        )
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entities.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} ({} entities affected)", self.message, self.entities.len())
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl From<InvalidOperationError> for Error {
    fn from(err: InvalidOperationError) -> Self {
        Error::InvalidOperation(err)
    }
}

impl From<RelationshipError> for Error {
    fn from(err: RelationshipError) -> Self {
        Error::Relationship(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

impl From<ModelError> for Error {
    fn from(err: ModelError) -> Self {
        Error::Model(err)
    }
}

/// Result type alias for relgraph operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_use_predicate() {
        let err = Error::invalid(InvalidOperationKind::ConcurrentUse, "second operation");
        assert!(err.is_concurrent_use());
        assert!(!err.is_store_failure());
        assert_eq!(
            err.invalid_operation_kind(),
            Some(InvalidOperationKind::ConcurrentUse)
        );
        assert_eq!(err.to_string(), "Invalid operation: second operation");
    }

    #[test]
    fn store_error_keeps_source_and_entities() {
        let io = std::io::Error::other("socket closed");
        let err: Error = StoreError::new(StoreErrorKind::Connection, "store unreachable")
            .with_entities(vec![EntityId::from_raw(1), EntityId::from_raw(2)])
            .with_source(Box::new(io))
            .into();

        assert!(err.is_store_failure());
        assert_eq!(err.entities().len(), 2);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(
            err.to_string(),
            "Store update failed: store unreachable (2 entities affected)"
        );
    }

    #[test]
    fn relationship_error_display() {
        let err = Error::Relationship(RelationshipError {
            kind: RelationshipErrorKind::RequiredDependent,
            message: "dependent blocks delete".to_string(),
            foreign_key: "Archive.blog_id".to_string(),
            principal_type: "Blog".to_string(),
            dependent_type: "Archive".to_string(),
            entities: vec![EntityId::from_raw(9)],
        });
        assert!(err.is_relationship_violation());
        assert_eq!(
            err.relationship_kind(),
            Some(RelationshipErrorKind::RequiredDependent)
        );
        assert_eq!(
            err.to_string(),
            "Relationship integrity violation: dependent blocks delete (Archive -> Blog via 'Archive.blog_id')"
        );
    }
}
