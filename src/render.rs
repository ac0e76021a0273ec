//! Connection profile rendering
//!
//! Renders the INI-style text understood by `wg-quick` and the WireGuard
//! apps. Field order inside each section is fixed, so identical input always
//! yields byte-identical output.

use crate::error::{GuardError, Result};
use crate::wireguard::{Peer, PrivateKey, PublicKey, Tunnel};
use ipnet::IpNet;
use std::fmt::Write;

/// `[Interface]` section: the local side of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSection {
    /// Local private key
    pub private_key: PrivateKey,
    /// Local address in CIDR form
    pub address: IpNet,
    /// UDP port to bind
    pub listen_port: Option<u16>,
    /// Resolver to use while the tunnel is up
    pub dns: Option<String>,
}

/// `[Peer]` section: one remote party
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSection {
    /// Remote public key
    pub public_key: PublicKey,
    /// Remote `host:port`
    pub endpoint: Option<String>,
    /// Ranges routed to this remote
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds
    pub persistent_keepalive: Option<u16>,
}

/// A complete connection profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// Local interface
    pub interface: InterfaceSection,
    /// Remote parties, rendered in order
    pub peers: Vec<PeerSection>,
}

impl Profile {
    /// Build the profile a freshly created peer uses to reach its tunnel.
    ///
    /// The peer dials the tunnel's published host on its listen port.
    /// `allowed_ips` are the ranges the peer routes through the tunnel; when
    /// empty the tunnel's subnet is used.
    pub fn for_peer(peer: &Peer, tunnel: &Tunnel, allowed_ips: Vec<IpNet>) -> Result<Self> {
        let private_key = peer.private_key.clone().ok_or_else(|| {
            GuardError::Validation(format!(
                "Peer '{}' private key is only available when the peer is created",
                peer.id
            ))
        })?;
        let address = peer.allowed_ips.first().copied().ok_or_else(|| {
            GuardError::Validation(format!("Peer '{}' has no address", peer.id))
        })?;

        let allowed_ips = if allowed_ips.is_empty() {
            vec![tunnel.subnet()]
        } else {
            allowed_ips
        };

        Ok(Self {
            interface: InterfaceSection {
                private_key,
                address,
                listen_port: None,
                dns: peer.dns.clone(),
            },
            peers: vec![PeerSection {
                public_key: tunnel.public_key.clone(),
                endpoint: Some(tunnel.dial_endpoint()),
                allowed_ips,
                persistent_keepalive: None,
            }],
        })
    }

    /// Render the profile to text
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) -> std::fmt::Result {
        let iface = &self.interface;
        writeln!(out, "[Interface]")?;
        writeln!(out, "PrivateKey = {}", iface.private_key.to_base64())?;
        writeln!(out, "Address = {}", iface.address)?;
        if let Some(port) = iface.listen_port {
            writeln!(out, "ListenPort = {}", port)?;
        }
        if let Some(dns) = &iface.dns {
            writeln!(out, "DNS = {}", dns)?;
        }

        for peer in &self.peers {
            writeln!(out)?;
            writeln!(out, "[Peer]")?;
            writeln!(out, "PublicKey = {}", peer.public_key.to_base64())?;
            if let Some(endpoint) = &peer.endpoint {
                writeln!(out, "Endpoint = {}", endpoint)?;
            }
            if !peer.allowed_ips.is_empty() {
                let ranges: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
                writeln!(out, "AllowedIPs = {}", ranges.join(", "))?;
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                writeln!(out, "PersistentKeepalive = {}", keepalive)?;
            }
        }

        Ok(())
    }
}
