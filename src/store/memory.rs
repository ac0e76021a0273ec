//! In-memory tunnel store

use crate::error::{GuardError, Result};
use crate::store::TunnelStore;
use crate::wireguard::Tunnel;
use std::collections::HashMap;
use std::sync::RwLock;

/// Tunnel store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tunnels: RwLock<HashMap<String, Tunnel>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> GuardError {
        GuardError::Infrastructure("tunnel store lock poisoned".to_string())
    }
}

impl TunnelStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Tunnel> {
        let tunnels = self.tunnels.read().map_err(|_| Self::poisoned())?;
        tunnels
            .get(id)
            .cloned()
            .ok_or_else(|| GuardError::tunnel_not_found(id))
    }

    fn create(&self, tunnel: &Tunnel) -> Result<()> {
        let mut tunnels = self.tunnels.write().map_err(|_| Self::poisoned())?;
        if tunnels.contains_key(&tunnel.id) {
            return Err(GuardError::tunnel_exists(&tunnel.id));
        }
        tunnels.insert(tunnel.id.clone(), tunnel.clone());
        Ok(())
    }

    fn put(&self, tunnel: &Tunnel) -> Result<()> {
        let mut tunnels = self.tunnels.write().map_err(|_| Self::poisoned())?;
        tunnels.insert(tunnel.id.clone(), tunnel.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut tunnels = self.tunnels.write().map_err(|_| Self::poisoned())?;
        tunnels
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| GuardError::tunnel_not_found(id))
    }

    fn list(&self) -> Result<Vec<Tunnel>> {
        let tunnels = self.tunnels.read().map_err(|_| Self::poisoned())?;
        Ok(tunnels.values().cloned().collect())
    }
}
