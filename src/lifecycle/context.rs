//! Per-request deadline and cancellation

use crate::error::{GuardError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Carries the caller's deadline and cancellation into a manager call.
///
/// Cloned handles share the cancellation flag, so a front end can keep one
/// clone and cancel the request it handed to the manager.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Context {
    /// Context with no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// Context that expires after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            cancelled: Arc::default(),
        }
    }

    /// Deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel every clone of this context
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the context was cancelled or its deadline has passed
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with `Cancelled` if the request should not proceed
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(GuardError::Cancelled(format!("{} cancelled by caller", operation)));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(GuardError::Cancelled(format!("{} deadline exceeded", operation)));
        }
        Ok(())
    }
}
