//! Tracker configuration.

use relgraph_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// How graph writes reach the fixup engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTrackingStrategy {
    /// Writes are found by diffing against snapshots on the next detection pass.
    #[default]
    Snapshot,
    /// Every write to a tracked instance is fixed up before the call returns.
    Notifications,
}

/// When cascading deletes and orphan deletions are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeTiming {
    /// As soon as the triggering change is observed.
    #[default]
    Immediate,
    /// When changes are saved.
    OnSaveChanges,
    /// Never; the store is responsible.
    Never,
}

/// Configuration for a [`TrackingContext`](crate::TrackingContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// How graph writes are observed.
    pub change_tracking: ChangeTrackingStrategy,
    /// Run change detection before every operation that reads or changes state.
    pub auto_detect_changes: bool,
    /// When dependents of a deleted principal are cascaded.
    pub cascade_delete_timing: CascadeTiming,
    /// When required dependents severed from their principal are deleted.
    pub delete_orphans_timing: CascadeTiming,
    /// Include key values in log fields and error messages.
    pub sensitive_data_logging: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            change_tracking: ChangeTrackingStrategy::Snapshot,
            auto_detect_changes: true,
            cascade_delete_timing: CascadeTiming::Immediate,
            delete_orphans_timing: CascadeTiming::Immediate,
            sensitive_data_logging: false,
        }
    }
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Custom(format!("invalid tracker configuration: {}", e)))
    }

    pub fn with_change_tracking(mut self, strategy: ChangeTrackingStrategy) -> Self {
        self.change_tracking = strategy;
        self
    }

    pub fn with_auto_detect_changes(mut self, enabled: bool) -> Self {
        self.auto_detect_changes = enabled;
        self
    }

    pub fn with_cascade_delete_timing(mut self, timing: CascadeTiming) -> Self {
        self.cascade_delete_timing = timing;
        self
    }

    pub fn with_delete_orphans_timing(mut self, timing: CascadeTiming) -> Self {
        self.delete_orphans_timing = timing;
        self
    }

    pub fn with_sensitive_data_logging(mut self, enabled: bool) -> Self {
        self.sensitive_data_logging = enabled;
        self
    }
}
