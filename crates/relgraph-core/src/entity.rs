//! Entity instance handles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of one entity instance in a tracking context's graph.
///
/// Handles are plain copyable ids; navigations store handles rather than
/// owning pointers, so principal/dependent cycles never own each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
