//! In-memory device backend
//!
//! Keeps device state in a map instead of the kernel. Used by the `memory`
//! backend setting and by tests, which can make the next calls fail.

use crate::device::{DeviceBackend, DeviceState};
use crate::error::{GuardError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Device backend that records interfaces in memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    devices: Mutex<HashMap<String, DeviceState>>,
    failing_applies: AtomicUsize,
    failing_teardowns: AtomicUsize,
    applies: AtomicUsize,
}

impl MemoryBackend {
    /// Create a backend with no interfaces
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of one interface
    pub fn device(&self, interface: &str) -> Option<DeviceState> {
        self.devices.lock().ok()?.get(interface).cloned()
    }

    /// Names of every interface present
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .lock()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Make the next `count` applies fail after installing only the interface
    pub fn fail_next_applies(&self, count: usize) {
        self.failing_applies.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` teardowns fail without touching the interface
    pub fn fail_next_teardowns(&self, count: usize) {
        self.failing_teardowns.store(count, Ordering::SeqCst);
    }

    /// Number of apply calls seen, successful or not
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, DeviceState>>> {
        self.devices
            .lock()
            .map_err(|_| GuardError::Infrastructure("device map lock poisoned".to_string()))
    }
}

impl DeviceBackend for MemoryBackend {
    fn apply(&self, desired: &DeviceState) -> Result<()> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let mut devices = self.lock()?;

        if Self::take_failure(&self.failing_applies) {
            // Leave a half-configured interface behind, as a real failure might
            let partial = DeviceState {
                peers: Vec::new(),
                ..desired.clone()
            };
            devices.insert(desired.interface.clone(), partial);
            return Err(GuardError::Device {
                tunnel: desired.interface.clone(),
                message: "injected apply failure".to_string(),
            });
        }

        debug!(
            "memory device '{}' now has {} peers",
            desired.interface,
            desired.peers.len()
        );
        devices.insert(desired.interface.clone(), desired.clone());
        Ok(())
    }

    fn teardown(&self, interface: &str) -> Result<()> {
        let mut devices = self.lock()?;

        if Self::take_failure(&self.failing_teardowns) {
            return Err(GuardError::Device {
                tunnel: interface.to_string(),
                message: "injected teardown failure".to_string(),
            });
        }

        devices.remove(interface);
        Ok(())
    }
}
