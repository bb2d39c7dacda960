//! The persistence-store interface.
//!
//! The tracker hands the store one ordered [`CommandBatch`] per save. The
//! store executes it as a single transactional unit and reports, per insert,
//! the values it generated.
//!
//! # Temporary placeholders
//!
//! Store-generated keys are not known before the save, so the tracker uses
//! placeholder values that are unique within a tracking context. A column
//! flagged `generated` must be filled by the store. A column flagged
//! `temporary` but not `generated` (typically a dependent's foreign key)
//! carries the placeholder of an earlier insert in the same batch and must
//! be replaced by the value generated for it.

use crate::entity::EntityId;
use crate::error::StoreError;
use crate::model::EntityTypeId;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::Serialize;
use std::future::Future;

/// The write a command performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandOperation {
    Insert,
    Update,
    Delete,
}

/// One column of a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnValue {
    /// Property index on the command's entity type.
    pub property: usize,
    pub name: String,
    pub value: Value,
    /// The value is a placeholder pending store generation.
    pub temporary: bool,
    /// The store must generate this value.
    pub generated: bool,
}

/// A write of one entity.
#[derive(Debug, Clone, Serialize)]
pub struct ModificationCommand {
    pub entity: EntityId,
    pub entity_type: EntityTypeId,
    pub type_name: String,
    pub operation: CommandOperation,
    /// Primary key identifying the row (original values for updates and deletes).
    pub key: Vec<ColumnValue>,
    /// Columns to write: every property for inserts, modified ones for updates.
    pub columns: Vec<ColumnValue>,
}

impl ModificationCommand {
    /// Look up a column by property name.
    pub fn column(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// An ordered batch: principals before dependents for inserts, dependents
/// before principals for deletes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandBatch {
    commands: Vec<ModificationCommand>,
}

impl CommandBatch {
    pub fn new(commands: Vec<ModificationCommand>) -> Self {
        Self { commands }
    }

    pub fn commands(&self) -> &[ModificationCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Entities written by this batch, in command order.
    pub fn entities(&self) -> Vec<EntityId> {
        self.commands.iter().map(|c| c.entity).collect()
    }
}

/// Values the store generated for one command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedValues {
    /// Index of the command in its batch.
    pub command: usize,
    /// `(property index, value)` pairs.
    pub values: Vec<(usize, Value)>,
}

/// The outcome of a successful save.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveResult {
    generated: Vec<GeneratedValues>,
}

impl SaveResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: usize, values: Vec<(usize, Value)>) {
        if !values.is_empty() {
            self.generated.push(GeneratedValues { command, values });
        }
    }

    pub fn generated(&self) -> &[GeneratedValues] {
        &self.generated
    }
}

/// A persistence store the tracker saves through.
pub trait Store: Send + Sync {
    /// Execute a batch atomically.
    fn save(&self, batch: &CommandBatch) -> Result<SaveResult, StoreError>;

    /// Execute a batch atomically, suspending while the store works.
    ///
    /// The default implementation honours cancellation and then runs
    /// [`Store::save`].
    fn save_async(
        &self,
        cx: &Cx,
        batch: &CommandBatch,
    ) -> impl Future<Output = Outcome<SaveResult, StoreError>> + Send {
        let cancelled = cx.cancel_reason();
        let result = if cancelled.is_none() {
            Some(self.save(batch))
        } else {
            None
        };
        async move {
            match (cancelled, result) {
                (Some(reason), _) => Outcome::Cancelled(reason),
                (None, Some(Ok(saved))) => Outcome::Ok(saved),
                (None, Some(Err(e))) => Outcome::Err(e),
                (None, None) => Outcome::Ok(SaveResult::new()),
            }
        }
    }
}
