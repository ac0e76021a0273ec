//! Error types for wg-guard
//!
//! This module defines the error types used throughout the control plane.
//! We use `thiserror` for ergonomic error definitions and `anyhow` for
//! error propagation in the binary.
//!
//! Every lifecycle failure carries its kind plus the offending identifier so
//! callers can decide between retrying and aborting without parsing messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Entity referenced by a lifecycle error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    /// A tunnel, identified by its ID
    Tunnel,
    /// A peer, identified by its ID within a tunnel
    Peer,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Tunnel => write!(f, "tunnel"),
            Entity::Peer => write!(f, "peer"),
        }
    }
}

/// Machine-readable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Referenced tunnel or peer does not exist
    NotFound,
    /// ID collision on create
    AlreadyExists,
    /// Requested address is already taken
    AddressConflict,
    /// No free host address left in the subnet
    AddressSpaceExhausted,
    /// The device backend failed to apply or tear down
    Device,
    /// Entropy or persistence failure
    Infrastructure,
    /// Malformed input
    Validation,
    /// Daemon configuration problem
    Config,
    /// The request was cancelled or its deadline passed
    Cancelled,
}

/// Main error type for wg-guard operations
#[derive(Error, Debug)]
pub enum GuardError {
    /// Referenced tunnel or peer is absent
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up
        entity: Entity,
        /// Offending ID
        id: String,
    },

    /// A tunnel or peer with this ID already exists
    #[error("{entity} already exists: {id}")]
    AlreadyExists {
        /// Kind of entity being created
        entity: Entity,
        /// Offending ID
        id: String,
    },

    /// Requested peer address is held by another party
    #[error("address {address} already in use on tunnel {tunnel}")]
    AddressConflict {
        /// Tunnel whose subnet was searched
        tunnel: String,
        /// Conflicting address
        address: String,
    },

    /// The tunnel subnet has no free host address
    #[error("address space {subnet} of tunnel {tunnel} is exhausted")]
    AddressSpaceExhausted {
        /// Tunnel whose subnet was searched
        tunnel: String,
        /// Subnet in CIDR form
        subnet: String,
    },

    /// The device backend rejected an apply or teardown
    #[error("device error on tunnel {tunnel}: {message}")]
    Device {
        /// Tunnel being reconciled
        tunnel: String,
        /// Backend failure description
        message: String,
    },

    /// Entropy source or persistence failure
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request cancelled before it committed
    #[error("request cancelled: {0}")]
    Cancelled(String),
}

impl GuardError {
    /// Shorthand for a missing tunnel
    pub fn tunnel_not_found(id: impl Into<String>) -> Self {
        GuardError::NotFound {
            entity: Entity::Tunnel,
            id: id.into(),
        }
    }

    /// Shorthand for a missing peer
    pub fn peer_not_found(id: impl Into<String>) -> Self {
        GuardError::NotFound {
            entity: Entity::Peer,
            id: id.into(),
        }
    }

    /// Shorthand for a tunnel ID collision
    pub fn tunnel_exists(id: impl Into<String>) -> Self {
        GuardError::AlreadyExists {
            entity: Entity::Tunnel,
            id: id.into(),
        }
    }

    /// Shorthand for a peer ID collision
    pub fn peer_exists(id: impl Into<String>) -> Self {
        GuardError::AlreadyExists {
            entity: Entity::Peer,
            id: id.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardError::NotFound { .. } => ErrorKind::NotFound,
            GuardError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            GuardError::AddressConflict { .. } => ErrorKind::AddressConflict,
            GuardError::AddressSpaceExhausted { .. } => ErrorKind::AddressSpaceExhausted,
            GuardError::Device { .. } => ErrorKind::Device,
            GuardError::Infrastructure(_) | GuardError::Io(_) | GuardError::Serialization(_) => {
                ErrorKind::Infrastructure
            }
            GuardError::Config(_) => ErrorKind::Config,
            GuardError::Validation(_) => ErrorKind::Validation,
            GuardError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

/// Result type alias using GuardError
pub type Result<T> = std::result::Result<T, GuardError>;

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        GuardError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GuardError {
    fn from(err: toml::de::Error) -> Self {
        GuardError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(GuardError::tunnel_not_found("t0").kind(), ErrorKind::NotFound);
        assert_eq!(GuardError::peer_exists("p0").kind(), ErrorKind::AlreadyExists);
        assert_eq!(
            GuardError::Io(std::io::Error::other("disk")).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn test_error_messages_name_the_id() {
        let err = GuardError::tunnel_exists("t0");
        assert_eq!(err.to_string(), "tunnel already exists: t0");

        let err = GuardError::AddressConflict {
            tunnel: "t0".to_string(),
            address: "10.0.0.2".to_string(),
        };
        assert!(err.to_string().contains("10.0.0.2"));
    }
}
