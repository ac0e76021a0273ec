//! Peer address allocation
//!
//! The allocator keeps no state of its own. It is rebuilt from a tunnel
//! record on every call, so it can never drift from the store.

use crate::error::{GuardError, Result};
use crate::wireguard::Tunnel;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::debug;

/// Address allocator for one tunnel's subnet
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    tunnel: String,
    subnet: IpNet,
    in_use: BTreeSet<IpAddr>,
}

impl AddressAllocator {
    /// Build an allocator from a tunnel's address and current peers
    pub fn for_tunnel(tunnel: &Tunnel) -> Self {
        Self {
            tunnel: tunnel.id.clone(),
            subnet: tunnel.subnet(),
            in_use: tunnel.used_addresses().into_iter().collect(),
        }
    }

    /// Subnet being allocated from
    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    /// Check whether an address is currently held
    pub fn is_allocated(&self, addr: &IpAddr) -> bool {
        self.in_use.contains(addr)
    }

    /// Allocate the lowest free host address in the subnet
    pub fn allocate(&mut self) -> Result<IpAddr> {
        let addr = self
            .subnet
            .hosts()
            .find(|candidate| !self.in_use.contains(candidate))
            .ok_or_else(|| GuardError::AddressSpaceExhausted {
                tunnel: self.tunnel.clone(),
                subnet: self.subnet.to_string(),
            })?;

        debug!("Allocated {} on tunnel '{}'", addr, self.tunnel);
        self.in_use.insert(addr);
        Ok(addr)
    }

    /// Claim a specific address requested by the caller
    pub fn reserve(&mut self, addr: IpAddr) -> Result<IpAddr> {
        if !self.is_host(&addr) {
            return Err(GuardError::Validation(format!(
                "Address {} is not a host address in {}",
                addr, self.subnet
            )));
        }

        if !self.in_use.insert(addr) {
            return Err(GuardError::AddressConflict {
                tunnel: self.tunnel.clone(),
                address: addr.to_string(),
            });
        }

        debug!("Reserved {} on tunnel '{}'", addr, self.tunnel);
        Ok(addr)
    }

    /// Return an address to the pool. Releasing a free address is a no-op.
    pub fn release(&mut self, addr: &IpAddr) {
        if self.in_use.remove(addr) {
            debug!("Released {} on tunnel '{}'", addr, self.tunnel);
        }
    }

    fn is_host(&self, addr: &IpAddr) -> bool {
        if !self.subnet.contains(addr) {
            return false;
        }
        // Point-to-point prefixes have no network/broadcast addresses to skip
        match self.subnet {
            IpNet::V4(net) if net.prefix_len() < 31 => {
                *addr != IpAddr::V4(net.network()) && *addr != IpAddr::V4(net.broadcast())
            }
            IpNet::V6(net) if net.prefix_len() < 127 => *addr != IpAddr::V6(net.network()),
            _ => true,
        }
    }
}
