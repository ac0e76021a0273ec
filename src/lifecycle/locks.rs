//! Per-tunnel exclusive locks

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per tunnel ID, created on first use and kept for the
/// lifetime of the process
#[derive(Debug, Default)]
pub struct TunnelLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TunnelLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        self.handle(id).lock_owned().await
    }

    /// Number of tunnel IDs seen so far
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }

    /// Whether no tunnel has been locked yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, id: &str) -> Arc<AsyncMutex<()>> {
        // The table only ever grows, so a poisoned guard still holds valid data
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }
}
