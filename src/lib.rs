//! wg-guard: WireGuard control plane
//!
//! Manages WireGuard tunnels and their peers on a single host. Tunnel records
//! are stored durably and pushed onto the kernel interface by a reconciler,
//! so the live device is always rebuildable from the store.
//!
//! # Modules
//!
//! - `wireguard`: keys, address allocation and the tunnel/peer data model
//! - `store`: durable tunnel records
//! - `device`: device backends and the reconciler
//! - `lifecycle`: tunnel and peer operations with per-tunnel locking
//! - `render`: connection profile rendering
//! - `control`: control API server and client
//! - `config`: configuration parsing and validation
//! - `error`: error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod render;
pub mod store;
pub mod wireguard;

// Re-export commonly used types
pub use error::{GuardError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
