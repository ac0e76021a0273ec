//! WireGuard entities and key material
//!
//! This module holds the tunnel and peer records, x25519 key generation,
//! and the per-tunnel address allocator.

mod allocator;
mod keys;
mod peer;
mod tunnel;

pub use allocator::AddressAllocator;
pub use keys::{KeyPair, PrivateKey, PublicKey, KEY_LEN};
pub use peer::{host_net, Peer};
pub use tunnel::Tunnel;
