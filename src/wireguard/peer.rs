//! WireGuard peer records
//!
//! A peer is a remote party authorized to reach a tunnel. Its private key is
//! handed out once, in the response that created it, and never persisted.

use crate::wireguard::{PrivateKey, PublicKey};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A peer authorized on a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer ID, unique within the owning tunnel
    pub id: String,

    /// Private key, only present in the response to NewPeer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKey>,

    /// Peer's public key
    pub public_key: PublicKey,

    /// Allowed IP ranges; the peer's own host address is always first
    pub allowed_ips: Vec<IpNet>,

    /// Resolver recommended to the peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
}

impl Peer {
    /// The host address allocated to this peer
    pub fn address(&self) -> Option<IpAddr> {
        self.allowed_ips.first().map(IpNet::addr)
    }

    /// Copy of this peer without its private key
    pub fn redacted(&self) -> Self {
        Self {
            private_key: None,
            ..self.clone()
        }
    }
}

/// Single-host network (`/32` or `/128`) for an address
pub fn host_net(addr: IpAddr) -> IpNet {
    let prefix = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    // A full-length prefix is always valid for its family
    IpNet::new(addr, prefix).unwrap_or_else(|_| IpNet::from(addr))
}
