//! Reentrancy detection for tracking contexts.
//!
//! Every public operation of a tracking context runs inside a critical
//! section. Entering a second section while one is open, whether from a
//! save callback or from another thread, fails fast with
//! [`InvalidOperationKind::ConcurrentUse`] instead of waiting.

use relgraph_core::{Error, InvalidOperationKind, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    in_use: AtomicBool,
    operation: Mutex<Option<&'static str>>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a critical section for `operation`.
    pub fn enter(&self, operation: &'static str) -> Result<CriticalSection<'_>> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            let running = self.current_operation().unwrap_or("another operation");
            tracing::warn!(
                operation = operation,
                running = running,
                "Rejected reentrant use of tracking context"
            );
            return Err(Error::invalid(
                InvalidOperationKind::ConcurrentUse,
                format!(
                    "'{}' was started while '{}' is in progress on the same tracking context",
                    operation, running
                ),
            ));
        }
        *self
            .operation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(operation);
        Ok(CriticalSection { guard: self })
    }

    /// Whether a critical section is currently open.
    pub fn is_entered(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Name of the operation holding the critical section.
    pub fn current_operation(&self) -> Option<&'static str> {
        *self
            .operation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// An open critical section; closes on drop, including during unwinding.
#[derive(Debug)]
pub struct CriticalSection<'a> {
    guard: &'a ConcurrencyGuard,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        *self
            .guard
            .operation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.guard.in_use.store(false, Ordering::Release);
    }
}
