//! WireGuard tunnel records
//!
//! A tunnel is one local WireGuard interface: its key pair, address, listen
//! port and the ordered list of peers allowed to reach it. The record stored
//! here is the desired state the device is reconciled towards.

use crate::config::validation;
use crate::error::{GuardError, Result};
use crate::wireguard::{Peer, PrivateKey, PublicKey};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;

/// A local WireGuard endpoint and its authorized peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    /// Tunnel ID, also used as the interface name
    pub id: String,

    /// Tunnel address in CIDR form; the prefix defines the peer subnet
    pub address: IpNet,

    /// Externally reachable `host:port`
    pub endpoint: String,

    /// Private key; stripped from every listing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKey>,

    /// Public key
    pub public_key: PublicKey,

    /// UDP port the device binds
    pub listen_port: u16,

    /// Peers in insertion order
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl Tunnel {
    /// Subnet peers are allocated from
    pub fn subnet(&self) -> IpNet {
        self.address.trunc()
    }

    /// Look up a peer by ID
    pub fn peer(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Check whether a peer with this ID exists
    pub fn has_peer(&self, id: &str) -> bool {
        self.peer(id).is_some()
    }

    /// Remove a peer by ID, returning it
    pub fn remove_peer(&mut self, id: &str) -> Option<Peer> {
        let index = self.peers.iter().position(|p| p.id == id)?;
        Some(self.peers.remove(index))
    }

    /// Addresses currently held in the subnet: the tunnel's own first, then peers
    pub fn used_addresses(&self) -> Vec<IpAddr> {
        std::iter::once(self.address.addr())
            .chain(self.peers.iter().filter_map(Peer::address))
            .collect()
    }

    /// Copy of this tunnel with every private key removed
    pub fn redacted(&self) -> Self {
        Self {
            id: self.id.clone(),
            address: self.address,
            endpoint: self.endpoint.clone(),
            private_key: None,
            public_key: self.public_key.clone(),
            listen_port: self.listen_port,
            peers: self.peers.iter().map(Peer::redacted).collect(),
        }
    }

    /// Private key, required to reconcile the device
    pub fn require_private_key(&self) -> Result<&PrivateKey> {
        self.private_key.as_ref().ok_or_else(|| {
            GuardError::Infrastructure(format!("Tunnel '{}' record has no private key", self.id))
        })
    }

    /// Endpoint peers dial: the published host with the device's listen port
    pub fn dial_endpoint(&self) -> String {
        let host = self
            .endpoint
            .rsplit_once(':')
            .map_or(self.endpoint.as_str(), |(host, _)| host);
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.listen_port)
        } else {
            format!("{}:{}", host, self.listen_port)
        }
    }

    /// Check extra ranges routed to `peer_id`.
    ///
    /// Ranges must lie outside the tunnel subnet, which is handed out one host
    /// at a time, and must not overlap any range held by another peer.
    pub fn check_routes(&self, peer_id: &str, routes: &[IpNet]) -> Result<()> {
        let subnet = self.subnet();
        for route in routes {
            if overlaps(route, &subnet) {
                return Err(GuardError::Validation(format!(
                    "Route {} for peer '{}' overlaps tunnel subnet {}",
                    route, peer_id, subnet
                )));
            }

            let held = self
                .peers
                .iter()
                .filter(|p| p.id != peer_id)
                .flat_map(|p| p.allowed_ips.iter())
                .any(|net| overlaps(route, net));
            if held {
                return Err(GuardError::AddressConflict {
                    tunnel: self.id.clone(),
                    address: route.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Validate the tunnel record
    pub fn validate(&self) -> Result<()> {
        validation::validate_id(&self.id)?;
        validation::validate_endpoint(&self.endpoint)?;

        let subnet = self.subnet();
        let mut held: HashSet<IpAddr> = HashSet::from([self.address.addr()]);
        for peer in &self.peers {
            validation::validate_id(&peer.id)?;
            match peer.address() {
                Some(addr) if subnet.contains(&addr) => {
                    if !held.insert(addr) {
                        return Err(GuardError::AddressConflict {
                            tunnel: self.id.clone(),
                            address: addr.to_string(),
                        });
                    }
                    self.check_routes(&peer.id, &peer.allowed_ips[1..])?;
                }
                Some(addr) => {
                    return Err(GuardError::Validation(format!(
                        "Peer '{}' address {} lies outside subnet {}",
                        peer.id, addr, subnet
                    )))
                }
                None => {
                    return Err(GuardError::Validation(format!(
                        "Peer '{}' has no allowed IPs",
                        peer.id
                    )))
                }
            }
        }

        Ok(())
    }
}

/// Two CIDR blocks overlap exactly when one contains the other
fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireguard::{host_net, KeyPair};

    fn test_tunnel() -> Tunnel {
        let keypair = KeyPair::generate().unwrap();
        Tunnel {
            id: "t0".to_string(),
            address: "10.0.0.1/24".parse().unwrap(),
            endpoint: "1.2.3.4:51820".to_string(),
            private_key: Some(keypair.private),
            public_key: keypair.public,
            listen_port: 51820,
            peers: vec![],
        }
    }

    fn test_peer(id: &str, addr: &str) -> Peer {
        let keypair = KeyPair::generate().unwrap();
        Peer {
            id: id.to_string(),
            private_key: None,
            public_key: keypair.public,
            allowed_ips: vec![host_net(addr.parse().unwrap())],
            dns: None,
        }
    }

    #[test]
    fn test_subnet() {
        let tunnel = test_tunnel();
        assert_eq!(tunnel.subnet().to_string(), "10.0.0.0/24");
        assert_eq!(tunnel.address.to_string(), "10.0.0.1/24");
    }

    #[test]
    fn test_used_addresses() {
        let mut tunnel = test_tunnel();
        tunnel.peers.push(test_peer("p0", "10.0.0.2"));
        tunnel.peers.push(test_peer("p1", "10.0.0.5"));

        let used = tunnel.used_addresses();
        assert_eq!(used.len(), 3);
        assert_eq!(used[0], "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(used[2], "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_remove_peer_keeps_order() {
        let mut tunnel = test_tunnel();
        tunnel.peers.push(test_peer("p0", "10.0.0.2"));
        tunnel.peers.push(test_peer("p1", "10.0.0.3"));
        tunnel.peers.push(test_peer("p2", "10.0.0.4"));

        assert!(tunnel.remove_peer("p1").is_some());
        assert!(tunnel.remove_peer("p1").is_none());
        let ids: Vec<_> = tunnel.peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p0", "p2"]);
    }

    #[test]
    fn test_redacted_strips_keys() {
        let tunnel = test_tunnel();
        let redacted = tunnel.redacted();
        assert!(redacted.private_key.is_none());
        assert_eq!(redacted.public_key, tunnel.public_key);
        assert!(redacted.require_private_key().is_err());
    }

    #[test]
    fn test_validate_rejects_peer_outside_subnet() {
        let mut tunnel = test_tunnel();
        tunnel.peers.push(test_peer("p0", "10.0.1.2"));
        assert!(tunnel.validate().is_err());
    }

    #[test]
    fn test_routes_must_avoid_subnet_and_other_peers() {
        let mut tunnel = test_tunnel();
        let mut p0 = test_peer("p0", "10.0.0.2");
        p0.allowed_ips.push("192.168.10.0/24".parse().unwrap());
        tunnel.peers.push(p0);

        let route = |s: &str| vec![s.parse::<IpNet>().unwrap()];
        assert!(tunnel.check_routes("p1", &route("192.168.20.0/24")).is_ok());
        // A peer may keep its own ranges
        assert!(tunnel.check_routes("p0", &route("192.168.10.0/24")).is_ok());

        let err = tunnel.check_routes("p1", &route("10.0.0.1/32")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        let err = tunnel.check_routes("p1", &route("10.0.0.0/16")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        let err = tunnel.check_routes("p1", &route("192.168.10.128/25")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AddressConflict);
        let err = tunnel.check_routes("p1", &route("192.168.0.0/16")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AddressConflict);
    }

    #[test]
    fn test_validate_rejects_overlapping_peers() {
        let mut tunnel = test_tunnel();
        let mut p0 = test_peer("p0", "10.0.0.2");
        p0.allowed_ips.push("10.0.0.3/32".parse().unwrap());
        tunnel.peers.push(p0);
        assert!(tunnel.validate().is_err());

        let mut tunnel = test_tunnel();
        tunnel.peers.push(test_peer("p0", "10.0.0.2"));
        tunnel.peers.push(test_peer("p1", "10.0.0.2"));
        assert_eq!(
            tunnel.validate().unwrap_err().kind(),
            crate::error::ErrorKind::AddressConflict
        );

        let mut tunnel = test_tunnel();
        tunnel.peers.push(test_peer("p0", "10.0.0.1"));
        assert!(tunnel.validate().is_err());
    }

    #[test]
    fn test_dial_endpoint_uses_listen_port() {
        let mut tunnel = test_tunnel();
        tunnel.endpoint = "vpn.example.com:31000".to_string();
        tunnel.listen_port = 51821;
        assert_eq!(tunnel.dial_endpoint(), "vpn.example.com:51821");

        tunnel.endpoint = "[fd00::1]:31000".to_string();
        assert_eq!(tunnel.dial_endpoint(), "[fd00::1]:51821");
    }

    #[test]
    fn test_serde_uses_cidr_strings() {
        let tunnel = test_tunnel();
        let json = serde_json::to_value(&tunnel).unwrap();
        assert_eq!(json["address"], "10.0.0.1/24");

        let parsed: Tunnel = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, tunnel);
    }
}
