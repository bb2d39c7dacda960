//! Change tracking and relationship fixup for relgraph.
//!
//! `relgraph-tracker` is the **unit-of-work layer**. A [`TrackingContext`]
//! owns an object graph, tracks the lifecycle state of its entities, keeps
//! foreign keys and navigations consistent in both directions, resolves
//! cascading deletes and writes everything back through a [`Store`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one tracked instance per key, across base and
//!   derived types.
//! - **Change detection**: snapshot diffing, or immediate fixup with
//!   notification-based tracking.
//! - **Fixup**: foreign key writes find their principal, navigation writes
//!   copy the principal key, and inverse navigations follow both.
//! - **Save pipeline**: ordered commands, store-generated values propagated
//!   to dependents, all-or-nothing tracker state on failure.
//!
//! # Example
//!
//! ```ignore
//! let context = TrackingContext::new(model, store);
//! let blog = context.create("Blog")?;
//! let post = context.create("Post")?;
//! context.add_to_collection(blog, "posts", post)?;
//! context.add(blog)?;
//!
//! // post.blog_id now carries the blog's temporary key
//! context.save_changes()?;
//! ```

pub mod change_detector;
pub mod config;
pub mod entry;
pub mod guard;
pub mod state_manager;

mod access;
mod cascade;
mod fixup;
mod graph;
mod identity_map;
mod save;

pub use change_detector::{
    DetectedChanges, PropertyChange, RelationshipChange, RelationshipChangeKind,
};
pub use config::{CascadeTiming, ChangeTrackingStrategy, TrackerConfig};
pub use entry::{EntityEntry, PropertyEntry};
pub use guard::{ConcurrencyGuard, CriticalSection};
pub use state_manager::{EntityState, StateChange};

use relgraph_core::{
    CommandBatch, Cx, EntityId, Error, Model, Outcome, Result, SaveResult, Store, Value,
};
use serde::Serialize;
use state_manager::StateManager;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

// ============================================================================
// Save Events
// ============================================================================

/// Points in the save pipeline where callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveEvent {
    /// After change detection, before commands are built.
    SavingChanges,
    /// After the store accepted the batch and generated values were applied.
    SavedChanges,
    /// After a failed save restored the tracker state.
    SaveFailed,
}

type SaveEventFn<S> = Box<dyn FnMut(&TrackingContext<S>) -> Result<()> + Send>;

/// Registered save callbacks.
///
/// Callbacks receive the context, but every tracker call made from inside
/// one is rejected as concurrent use.
pub struct SaveEventCallbacks<S: Store> {
    saving_changes: Vec<SaveEventFn<S>>,
    saved_changes: Vec<SaveEventFn<S>>,
    save_failed: Vec<SaveEventFn<S>>,
}

impl<S: Store> Default for SaveEventCallbacks<S> {
    fn default() -> Self {
        Self {
            saving_changes: Vec::new(),
            saved_changes: Vec::new(),
            save_failed: Vec::new(),
        }
    }
}

impl<S: Store> std::fmt::Debug for SaveEventCallbacks<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveEventCallbacks")
            .field("saving_changes", &self.saving_changes.len())
            .field("saved_changes", &self.saved_changes.len())
            .field("save_failed", &self.save_failed.len())
            .finish()
    }
}

impl<S: Store> SaveEventCallbacks<S> {
    fn slot(&mut self, event: SaveEvent) -> &mut Vec<SaveEventFn<S>> {
        match event {
            SaveEvent::SavingChanges => &mut self.saving_changes,
            SaveEvent::SavedChanges => &mut self.saved_changes,
            SaveEvent::SaveFailed => &mut self.save_failed,
        }
    }

    fn fire(&mut self, context: &TrackingContext<S>, event: SaveEvent) -> Result<()> {
        for cb in self.slot(event).iter_mut() {
            cb(context)?;
        }
        Ok(())
    }
}

// ============================================================================
// Debug Info
// ============================================================================

/// Serializable summary of a context's tracking state.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerDebugInfo {
    /// Instances in the graph, tracked or not.
    pub instances: usize,
    pub tracked: usize,
    pub added: usize,
    pub unchanged: usize,
    pub modified: usize,
    pub deleted: usize,
    /// Required relationships severed without a replacement principal.
    pub conceptual_nulls: usize,
    pub entries: Vec<EntryDebugInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryDebugInfo {
    pub entity: EntityId,
    pub entity_type: String,
    pub state: EntityState,
    /// Primary key values; only with sensitive data logging.
    pub key: Option<String>,
    pub temporary_key: bool,
    pub modified_properties: Vec<String>,
}

// ============================================================================
// Tracking Context
// ============================================================================

/// A unit of work over an object graph.
///
/// The context is `Sync`, but it is not a concurrent data structure: an
/// operation started while another one is running, on any thread, fails
/// with [`relgraph_core::InvalidOperationKind::ConcurrentUse`].
pub struct TrackingContext<S: Store> {
    guard: ConcurrencyGuard,
    state: Mutex<StateManager>,
    store: S,
    config: TrackerConfig,
    callbacks: Mutex<SaveEventCallbacks<S>>,
}

impl<S: Store> std::fmt::Debug for TrackingContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingContext")
            .field("config", &self.config)
            .field("in_use", &self.guard.is_entered())
            .finish_non_exhaustive()
    }
}

/// Restores the pre-save checkpoint and fires `SaveFailed` unless
/// disarmed, including when a save's future is dropped mid-flight.
struct Rollback<'a, S: Store> {
    context: &'a TrackingContext<S>,
    checkpoint: Option<StateManager>,
}

impl<S: Store> Rollback<'_, S> {
    fn disarm(mut self) {
        self.checkpoint = None;
    }
}

impl<S: Store> Drop for Rollback<'_, S> {
    fn drop(&mut self) {
        let Some(checkpoint) = self.checkpoint.take() else {
            return;
        };
        *self.context.lock_state() = checkpoint;
        tracing::debug!("Restored tracker state after failed save");
        if std::thread::panicking() {
            return;
        }
        if let Err(e) = self.context.fire(SaveEvent::SaveFailed) {
            tracing::warn!(error = %e, "Save failure callback returned an error");
        }
    }
}

impl<S: Store> TrackingContext<S> {
    pub fn new(model: Arc<Model>, store: S) -> Self {
        Self::with_config(model, store, TrackerConfig::default())
    }

    pub fn with_config(model: Arc<Model>, store: S, config: TrackerConfig) -> Self {
        tracing::debug!(
            change_tracking = ?config.change_tracking,
            auto_detect_changes = config.auto_detect_changes,
            cascade_delete_timing = ?config.cascade_delete_timing,
            delete_orphans_timing = ?config.delete_orphans_timing,
            "Creating tracking context"
        );
        Self {
            guard: ConcurrencyGuard::new(),
            state: Mutex::new(StateManager::new(model, config.clone())),
            store,
            config,
            callbacks: Mutex::new(SaveEventCallbacks::default()),
        }
    }

    pub fn model(&self) -> Arc<Model> {
        Arc::clone(&self.lock_state().model)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, StateManager> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one operation inside the critical section, all-or-nothing.
    pub(crate) fn run<T>(
        &self,
        operation: &'static str,
        detect: bool,
        f: impl FnOnce(&mut StateManager) -> Result<T>,
    ) -> Result<T> {
        let _section = self.guard.enter(operation)?;
        let mut state = self.lock_state();
        state.atomically(|state| {
            if detect && state.config.auto_detect_changes {
                state.detect_changes()?;
                state.claims.clear();
            }
            f(state)
        })
    }

    // ========================================================================
    // Graph
    // ========================================================================

    /// Create an untracked instance with every property NULL.
    pub fn create(&self, type_name: &str) -> Result<EntityId> {
        self.run("create", false, |state| state.create_instance(type_name))
    }

    /// Create an untracked instance with the given property values.
    pub fn create_with(&self, type_name: &str, values: &[(&str, Value)]) -> Result<EntityId> {
        self.run("create_with", false, |state| {
            let id = state.create_instance(type_name)?;
            for (name, value) in values {
                state.set_instance_value(id, name, value.clone())?;
            }
            Ok(id)
        })
    }

    pub fn set_value(&self, entity: EntityId, property: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.run("set_value", false, |state| {
            state.set_instance_value(entity, property, value)
        })
    }

    pub fn value(&self, entity: EntityId, property: &str) -> Result<Value> {
        self.run("value", true, |state| state.instance_value(entity, property))
    }

    pub fn set_reference(&self, entity: EntityId, navigation: &str, target: Option<EntityId>) -> Result<()> {
        self.run("set_reference", false, |state| {
            state.set_instance_reference(entity, navigation, target)
        })
    }

    pub fn reference(&self, entity: EntityId, navigation: &str) -> Result<Option<EntityId>> {
        self.run("reference", true, |state| {
            state.instance_reference(entity, navigation)
        })
    }

    /// Returns `false` if `member` was already in the collection.
    pub fn add_to_collection(&self, entity: EntityId, navigation: &str, member: EntityId) -> Result<bool> {
        self.run("add_to_collection", false, |state| {
            state.write_collection(entity, navigation, member, true)
        })
    }

    /// Returns `false` if `member` was not in the collection.
    pub fn remove_from_collection(
        &self,
        entity: EntityId,
        navigation: &str,
        member: EntityId,
    ) -> Result<bool> {
        self.run("remove_from_collection", false, |state| {
            state.write_collection(entity, navigation, member, false)
        })
    }

    pub fn collection(&self, entity: EntityId, navigation: &str) -> Result<Vec<EntityId>> {
        self.run("collection", true, |state| {
            state.instance_collection(entity, navigation)
        })
    }

    /// Name of the runtime entity type of `entity`.
    pub fn entity_type_of(&self, entity: EntityId) -> Result<String> {
        self.run("entity_type_of", false, |state| {
            Ok(state.entity_type_of(entity)?.name().to_string())
        })
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track the untracked graph reachable from `entity` as `Added`.
    ///
    /// A `Deleted` entity is restored instead.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn add(&self, entity: EntityId) -> Result<()> {
        self.run("add", true, |state| state.add_graph(entity))
    }

    /// Track the untracked graph reachable from `entity` as existing rows.
    ///
    /// Entities whose generated key is still unset become `Added`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn attach(&self, entity: EntityId) -> Result<()> {
        self.run("attach", true, |state| state.attach_graph(entity))
    }

    /// Mark `entity` for deletion and cascade to its dependents.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn remove(&self, entity: EntityId) -> Result<()> {
        self.run("remove", true, |state| state.remove(entity))
    }

    /// Resolve a row loaded from the store to a tracked instance.
    ///
    /// Returns the instance already tracked with that primary key, if any;
    /// otherwise a new `Unchanged` instance fixed up against the graph.
    pub fn materialize(&self, type_name: &str, values: &[(&str, Value)]) -> Result<EntityId> {
        self.run("materialize", true, |state| state.materialize(type_name, values))
    }

    /// Tracked instance of `type_name` (or a derived type) with primary key `key`.
    pub fn find(&self, type_name: &str, key: &[Value]) -> Result<Option<EntityId>> {
        self.run("find", false, |state| state.find_tracked(type_name, key))
    }

    pub fn entry(&self, entity: EntityId) -> EntityEntry<'_, S> {
        EntityEntry::new(self, entity)
    }

    /// Observe caller writes to tracked instances and fix them up.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detect_changes(&self) -> Result<DetectedChanges> {
        self.run("detect_changes", false, StateManager::detect_changes)
    }

    /// Whether saving would write anything.
    pub fn has_changes(&self) -> Result<bool> {
        self.run("has_changes", true, |state| {
            Ok(state
                .entries
                .values()
                .any(|e| e.state.is_pending() || !e.conceptual_nulls.is_empty()))
        })
    }

    /// Tracked entities and their states, in creation order.
    pub fn entries(&self) -> Result<Vec<(EntityId, EntityState)>> {
        self.run("entries", true, |state| {
            Ok(state.entries.values().map(|e| (e.entity, e.state)).collect())
        })
    }

    pub fn entries_in(&self, entity_state: EntityState) -> Result<Vec<EntityId>> {
        self.run("entries_in", true, |state| {
            Ok(state
                .entries
                .values()
                .filter(|e| e.state == entity_state)
                .map(|e| e.entity)
                .collect())
        })
    }

    pub fn count(&self, entity_state: EntityState) -> Result<usize> {
        self.run("count", true, |state| Ok(state.count(entity_state)))
    }

    /// Snapshot of the tracking state for diagnostics.
    pub fn debug_state(&self) -> Result<TrackerDebugInfo> {
        self.run("debug_state", false, |state| {
            let mut entries = Vec::with_capacity(state.entries.len());
            for entry in state.entries.values() {
                let ty = state.model.entity_type(entry.entity_type);
                let pk = state.model.key(ty.primary_key());
                entries.push(EntryDebugInfo {
                    entity: entry.entity,
                    entity_type: ty.name().to_string(),
                    state: entry.state,
                    key: state
                        .config
                        .sensitive_data_logging
                        .then(|| state.snapshot_key(entry.entity, pk.properties()).to_string()),
                    temporary_key: pk.properties().iter().any(|&p| entry.temporary[p]),
                    modified_properties: entry
                        .modified
                        .iter()
                        .enumerate()
                        .filter(|(_, m)| **m)
                        .map(|(p, _)| ty.property(p).name().to_string())
                        .collect(),
                });
            }
            Ok(TrackerDebugInfo {
                instances: state.graph.len(),
                tracked: state.entries.len(),
                added: state.count(EntityState::Added),
                unchanged: state.count(EntityState::Unchanged),
                modified: state.count(EntityState::Modified),
                deleted: state.count(EntityState::Deleted),
                conceptual_nulls: state
                    .entries
                    .values()
                    .map(|e| e.conceptual_nulls.len())
                    .sum(),
                entries,
            })
        })
    }

    /// Apply pending cascades and orphan deletions now, whatever the timing.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn cascade_changes(&self) -> Result<()> {
        self.run("cascade_changes", true, StateManager::cascade_changes)
    }

    /// Treat every tracked entity as in sync with the store.
    pub fn accept_all_changes(&self) -> Result<()> {
        self.run("accept_all_changes", true, |state| {
            state.accept_all_changes();
            Ok(())
        })
    }

    /// Stop tracking everything. Instances stay in the graph, untracked.
    pub fn clear(&self) -> Result<()> {
        self.run("clear", false, |state| {
            state.clear();
            Ok(())
        })
    }

    // ========================================================================
    // Save Events
    // ========================================================================

    pub fn on_saving_changes(
        &self,
        f: impl FnMut(&TrackingContext<S>) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.register(SaveEvent::SavingChanges, Box::new(f))
    }

    pub fn on_saved_changes(
        &self,
        f: impl FnMut(&TrackingContext<S>) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.register(SaveEvent::SavedChanges, Box::new(f))
    }

    pub fn on_save_failed(
        &self,
        f: impl FnMut(&TrackingContext<S>) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.register(SaveEvent::SaveFailed, Box::new(f))
    }

    fn register(&self, event: SaveEvent, f: SaveEventFn<S>) -> Result<()> {
        let _section = self.guard.enter("register_callback")?;
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slot(event)
            .push(f);
        Ok(())
    }

    fn fire(&self, event: SaveEvent) -> Result<()> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fire(self, event)
    }

    // ========================================================================
    // Saving
    // ========================================================================

    /// Save all pending changes and accept them. Returns the number of
    /// commands written.
    pub fn save_changes(&self) -> Result<usize> {
        self.save_changes_with(true)
    }

    /// Save all pending changes.
    ///
    /// On failure the tracker is left exactly as it was before the call.
    pub fn save_changes_with(&self, accept_all_changes_on_success: bool) -> Result<usize> {
        let _section = self.guard.enter("save_changes")?;
        let started = Instant::now();
        let (rollback, batch) = self.begin_save()?;
        if batch.is_empty() {
            return self.finish_save(rollback, &batch, &SaveResult::new(), accept_all_changes_on_success, started);
        }
        match self.store.save(&batch) {
            Ok(saved) => self.finish_save(rollback, &batch, &saved, accept_all_changes_on_success, started),
            Err(e) => {
                let error = Error::Store(e);
                self.fail_save(rollback, &error);
                Err(error)
            }
        }
    }

    /// Save all pending changes through the store's async path and accept
    /// them.
    ///
    /// No lock is held while the store works, but the context stays in
    /// use: any other operation started meanwhile is rejected. Dropping the
    /// future before it completes restores the tracker state.
    pub async fn save_changes_async(&self, cx: &Cx) -> Outcome<usize, Error> {
        self.save_changes_async_with(cx, true).await
    }

    /// Async counterpart of [`TrackingContext::save_changes_with`].
    pub async fn save_changes_async_with(
        &self,
        cx: &Cx,
        accept_all_changes_on_success: bool,
    ) -> Outcome<usize, Error> {
        let _section = match self.guard.enter("save_changes_async") {
            Ok(section) => section,
            Err(e) => return Outcome::Err(e),
        };
        let started = Instant::now();
        let (rollback, batch) = match self.begin_save() {
            Ok(prepared) => prepared,
            Err(e) => return Outcome::Err(e),
        };
        let saved = if batch.is_empty() {
            SaveResult::new()
        } else {
            match self.store.save_async(cx, &batch).await {
                Outcome::Ok(saved) => saved,
                Outcome::Err(e) => {
                    let error = Error::Store(e);
                    self.fail_save(rollback, &error);
                    return Outcome::Err(error);
                }
                Outcome::Cancelled(r) => {
                    self.fail_save(rollback, &Error::Cancelled);
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.fail_save(rollback, &"store panicked");
                    return Outcome::Panicked(p);
                }
            }
        };
        match self.finish_save(rollback, &batch, &saved, accept_all_changes_on_success, started) {
            Ok(count) => Outcome::Ok(count),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Detect, fire `SavingChanges`, checkpoint and build the batch.
    fn begin_save(&self) -> Result<(Rollback<'_, S>, CommandBatch)> {
        if self.config.auto_detect_changes {
            self.lock_state()
                .atomically(|state| state.detect_changes().map(|_| ()))?;
        }
        self.fire(SaveEvent::SavingChanges)?;

        let mut state = self.lock_state();
        let checkpoint = state.clone();
        let batch = match state.prepare_save() {
            Ok(batch) => batch,
            Err(e) => {
                *state = checkpoint;
                tracing::warn!(error = %e, "Save rejected before reaching the store");
                return Err(e);
            }
        };
        drop(state);
        tracing::debug!(commands = batch.len(), "Prepared save batch");
        Ok((
            Rollback {
                context: self,
                checkpoint: Some(checkpoint),
            },
            batch,
        ))
    }

    fn finish_save(
        &self,
        rollback: Rollback<'_, S>,
        batch: &CommandBatch,
        saved: &SaveResult,
        accept: bool,
        started: Instant,
    ) -> Result<usize> {
        self.lock_state().complete_save(batch, saved, accept);
        rollback.disarm();
        tracing::info!(
            commands = batch.len(),
            generated = saved.generated().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Saved changes"
        );
        self.fire(SaveEvent::SavedChanges)?;
        Ok(batch.len())
    }

    fn fail_save(&self, rollback: Rollback<'_, S>, reason: &dyn std::fmt::Display) {
        tracing::warn!(reason = %reason, "Save failed; restoring tracker state");
        drop(rollback);
    }
}
