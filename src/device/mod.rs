//! Device reconciliation
//!
//! The live WireGuard interface is a projection of the stored tunnel record.
//! The [`Reconciler`] is the only writer of device state: it pushes the full
//! desired configuration through a [`DeviceBackend`] on every change, so a
//! repeated or interrupted apply is always repaired by the next one.

mod memory;
mod wg_quick;

pub use memory::MemoryBackend;
pub use wg_quick::{CommandRunner, SystemRunner, WgQuickBackend};

use crate::error::{GuardError, Result};
use crate::render::{InterfaceSection, PeerSection, Profile};
use crate::wireguard::{PrivateKey, PublicKey, Tunnel};
use ipnet::IpNet;
use std::sync::Arc;
use tracing::{debug, info};

/// Desired configuration of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    /// Interface name (the tunnel ID)
    pub interface: String,
    /// Interface private key
    pub private_key: PrivateKey,
    /// Interface address
    pub address: IpNet,
    /// UDP listen port
    pub listen_port: u16,
    /// Peers to install, replacing any others
    pub peers: Vec<DevicePeer>,
}

/// One peer as installed on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeer {
    /// Peer public key
    pub public_key: PublicKey,
    /// Ranges routed to the peer
    pub allowed_ips: Vec<IpNet>,
}

impl DeviceState {
    /// Desired device state for a stored tunnel
    pub fn from_tunnel(tunnel: &Tunnel) -> Result<Self> {
        Ok(Self {
            interface: tunnel.id.clone(),
            private_key: tunnel.require_private_key()?.clone(),
            address: tunnel.address,
            listen_port: tunnel.listen_port,
            peers: tunnel
                .peers
                .iter()
                .map(|p| DevicePeer {
                    public_key: p.public_key.clone(),
                    allowed_ips: p.allowed_ips.clone(),
                })
                .collect(),
        })
    }

    /// Interface configuration in `wg-quick` form
    pub fn to_profile(&self) -> Profile {
        Profile {
            interface: InterfaceSection {
                private_key: self.private_key.clone(),
                address: self.address,
                listen_port: Some(self.listen_port),
                dns: None,
            },
            peers: self
                .peers
                .iter()
                .map(|p| PeerSection {
                    public_key: p.public_key.clone(),
                    endpoint: None,
                    allowed_ips: p.allowed_ips.clone(),
                    persistent_keepalive: None,
                })
                .collect(),
        }
    }
}

/// Platform capability that programs a real interface
#[cfg_attr(test, mockall::automock)]
pub trait DeviceBackend: Send + Sync {
    /// Make the interface match `desired` exactly, creating it if needed
    fn apply(&self, desired: &DeviceState) -> Result<()>;

    /// Remove the interface; removing an absent interface succeeds
    fn teardown(&self, interface: &str) -> Result<()>;
}

/// Translates tunnel records into device backend calls
#[derive(Clone)]
pub struct Reconciler {
    backend: Arc<dyn DeviceBackend>,
}

impl Reconciler {
    /// Create a reconciler over a backend
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }

    /// Push the tunnel's full desired state onto the device
    pub fn apply(&self, tunnel: &Tunnel) -> Result<()> {
        let desired = DeviceState::from_tunnel(tunnel)?;
        debug!(
            "Applying tunnel '{}' ({} peers, port {})",
            tunnel.id,
            desired.peers.len(),
            desired.listen_port
        );

        self.backend
            .apply(&desired)
            .map_err(|e| device_error(&tunnel.id, e))?;

        info!("Device '{}' reconciled", tunnel.id);
        Ok(())
    }

    /// Remove the tunnel's device entirely
    pub fn teardown(&self, id: &str) -> Result<()> {
        debug!("Tearing down device '{}'", id);
        self.backend.teardown(id).map_err(|e| device_error(id, e))?;
        info!("Device '{}' removed", id);
        Ok(())
    }
}

fn device_error(id: &str, err: GuardError) -> GuardError {
    match err {
        GuardError::Device { .. } => err,
        other => GuardError::Device {
            tunnel: id.to_string(),
            message: other.to_string(),
        },
    }
}
