//! Durable tunnel records
//!
//! The store is the single source of truth for every tunnel and its peers.
//! Writes replace a whole record at once, so readers never observe a
//! half-written tunnel.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::wireguard::Tunnel;

/// Mapping from tunnel ID to tunnel record
pub trait TunnelStore: Send + Sync {
    /// Fetch one tunnel; fails with `NotFound` when absent
    fn get(&self, id: &str) -> Result<Tunnel>;

    /// Insert a new tunnel; fails with `AlreadyExists` when the ID is taken
    fn create(&self, tunnel: &Tunnel) -> Result<()>;

    /// Create or replace a tunnel record
    fn put(&self, tunnel: &Tunnel) -> Result<()>;

    /// Remove a tunnel; fails with `NotFound` when absent
    fn delete(&self, id: &str) -> Result<()>;

    /// Snapshot of every tunnel, in no meaningful order
    fn list(&self) -> Result<Vec<Tunnel>>;
}
