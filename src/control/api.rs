//! Control API request and response types
//!
//! Requests and responses are single JSON objects, one per line. Every
//! failure is reported as a structured [`ApiError`] carrying the error kind
//! and the offending ID, so callers never have to parse messages.

use crate::error::{Entity, ErrorKind, GuardError};
use crate::lifecycle::{CreateTunnel, NewPeer};
use serde::{Deserialize, Serialize};

/// API request from client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Request ID for tracking
    #[serde(default = "default_request_id")]
    pub id: String,

    /// Action to perform
    pub action: Action,
}

/// Operations offered by the control server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Create a tunnel
    CreateTunnel(CreateTunnel),
    /// Delete a tunnel and its device
    DeleteTunnel {
        /// Tunnel to delete
        id: String,
    },
    /// List every tunnel
    ListTunnels,
    /// Fetch one tunnel
    GetTunnel {
        /// Tunnel to fetch
        id: String,
    },
    /// Add a peer to a tunnel
    NewPeer(NewPeer),
    /// Remove a peer from a tunnel
    DeletePeer {
        /// Owning tunnel
        tunnel_id: String,
        /// Peer to remove
        peer_id: String,
    },
}

impl Action {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Action::CreateTunnel(_) => "create_tunnel",
            Action::DeleteTunnel { .. } => "delete_tunnel",
            Action::ListTunnels => "list_tunnels",
            Action::GetTunnel { .. } => "get_tunnel",
            Action::NewPeer(_) => "new_peer",
            Action::DeletePeer { .. } => "delete_peer",
        }
    }
}

impl ApiRequest {
    /// Create a new API request
    pub fn new(id: String, action: Action) -> Self {
        Self { id, action }
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, ApiError> {
        serde_json::from_str(json).map_err(|e| ApiError::Parse {
            message: e.to_string(),
        })
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, ApiError> {
        serde_json::to_string(self).map_err(|e| ApiError::Serialization {
            message: e.to_string(),
        })
    }
}

/// API response to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Request ID this response corresponds to
    pub id: String,

    /// Whether the request was successful
    pub success: bool,

    /// Optional result data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Optional error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    /// Create a successful response
    pub fn success(id: String, data: Option<serde_json::Value>) -> Self {
        Self {
            id,
            success: true,
            data,
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: String, error: ApiError) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, ApiError> {
        serde_json::to_string(self).map_err(|e| ApiError::Serialization {
            message: e.to_string(),
        })
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, ApiError> {
        serde_json::from_str(json).map_err(|e| ApiError::Parse {
            message: e.to_string(),
        })
    }
}

/// API error types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiError {
    /// Referenced tunnel or peer is absent
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity
        entity: Entity,
        /// Offending ID
        id: String,
    },

    /// ID already taken
    #[error("{entity} already exists: {id}")]
    AlreadyExists {
        /// Kind of entity
        entity: Entity,
        /// Offending ID
        id: String,
    },

    /// Requested address is taken
    #[error("address {address} already in use on tunnel {tunnel}")]
    AddressConflict {
        /// Tunnel searched
        tunnel: String,
        /// Conflicting address
        address: String,
    },

    /// No free address left
    #[error("address space {subnet} of tunnel {tunnel} is exhausted")]
    AddressSpaceExhausted {
        /// Tunnel searched
        tunnel: String,
        /// Subnet in CIDR form
        subnet: String,
    },

    /// Device backend failure
    #[error("device error on tunnel {tunnel}: {message}")]
    Device {
        /// Tunnel being reconciled
        tunnel: String,
        /// Failure description
        message: String,
    },

    /// Entropy or persistence failure on the server
    #[error("infrastructure error: {message}")]
    Infrastructure {
        /// Failure description
        message: String,
    },

    /// Invalid request parameters
    #[error("invalid request: {message}")]
    Validation {
        /// Failure description
        message: String,
    },

    /// Server configuration problem
    #[error("configuration error: {message}")]
    Config {
        /// Failure description
        message: String,
    },

    /// Request cancelled or timed out
    #[error("cancelled: {message}")]
    Cancelled {
        /// Failure description
        message: String,
    },

    /// Failed to parse a request or response
    #[error("parse error: {message}")]
    Parse {
        /// Failure description
        message: String,
    },

    /// Failed to serialize a request or response
    #[error("serialization error: {message}")]
    Serialization {
        /// Failure description
        message: String,
    },
}

impl ApiError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::NotFound { .. } => ErrorKind::NotFound,
            ApiError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ApiError::AddressConflict { .. } => ErrorKind::AddressConflict,
            ApiError::AddressSpaceExhausted { .. } => ErrorKind::AddressSpaceExhausted,
            ApiError::Device { .. } => ErrorKind::Device,
            ApiError::Validation { .. } | ApiError::Parse { .. } => ErrorKind::Validation,
            ApiError::Config { .. } => ErrorKind::Config,
            ApiError::Cancelled { .. } => ErrorKind::Cancelled,
            ApiError::Infrastructure { .. } | ApiError::Serialization { .. } => {
                ErrorKind::Infrastructure
            }
        }
    }
}

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::NotFound { entity, id } => ApiError::NotFound { entity, id },
            GuardError::AlreadyExists { entity, id } => ApiError::AlreadyExists { entity, id },
            GuardError::AddressConflict { tunnel, address } => {
                ApiError::AddressConflict { tunnel, address }
            }
            GuardError::AddressSpaceExhausted { tunnel, subnet } => {
                ApiError::AddressSpaceExhausted { tunnel, subnet }
            }
            GuardError::Device { tunnel, message } => ApiError::Device { tunnel, message },
            GuardError::Validation(message) => ApiError::Validation { message },
            GuardError::Config(message) => ApiError::Config { message },
            GuardError::Cancelled(message) => ApiError::Cancelled { message },
            GuardError::Infrastructure(message) | GuardError::Serialization(message) => {
                ApiError::Infrastructure { message }
            }
            GuardError::Io(e) => ApiError::Infrastructure {
                message: e.to_string(),
            },
        }
    }
}

impl From<ApiError> for GuardError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::NotFound { entity, id } => GuardError::NotFound { entity, id },
            ApiError::AlreadyExists { entity, id } => GuardError::AlreadyExists { entity, id },
            ApiError::AddressConflict { tunnel, address } => {
                GuardError::AddressConflict { tunnel, address }
            }
            ApiError::AddressSpaceExhausted { tunnel, subnet } => {
                GuardError::AddressSpaceExhausted { tunnel, subnet }
            }
            ApiError::Device { tunnel, message } => GuardError::Device { tunnel, message },
            ApiError::Validation { message } => GuardError::Validation(message),
            ApiError::Config { message } => GuardError::Config(message),
            ApiError::Cancelled { message } => GuardError::Cancelled(message),
            ApiError::Infrastructure { message } => GuardError::Infrastructure(message),
            ApiError::Parse { message } | ApiError::Serialization { message } => {
                GuardError::Serialization(message)
            }
        }
    }
}

fn default_request_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("req-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let json = r#"{"id":"r1","action":{"type":"create_tunnel","id":"t0","address":"10.0.0.1/24","endpoint":"1.2.3.4:51820"}}"#;
        let req = ApiRequest::from_json(json).unwrap();
        assert_eq!(req.id, "r1");
        assert_eq!(
            req.action,
            Action::CreateTunnel(CreateTunnel {
                id: "t0".to_string(),
                address: "10.0.0.1/24".to_string(),
                endpoint: "1.2.3.4:51820".to_string(),
            })
        );
    }

    #[test]
    fn test_request_defaults() {
        let req = ApiRequest::from_json(r#"{"action":{"type":"list_tunnels"}}"#).unwrap();
        assert!(req.id.starts_with("req-"));
        assert_eq!(req.action, Action::ListTunnels);

        let req = ApiRequest::from_json(
            r#"{"action":{"type":"new_peer","tunnel_id":"t0","peer_id":"p0"}}"#,
        )
        .unwrap();
        match req.action {
            Action::NewPeer(p) => {
                assert!(p.address.is_none());
                assert!(p.allowed_ips.is_empty());
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_is_parse_error() {
        let err = ApiRequest::from_json(r#"{"action":{"type":"reboot"}}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_error_is_structured_on_the_wire() {
        let resp = ApiResponse::error("r1".to_string(), GuardError::tunnel_exists("t0").into());
        let json = resp.to_json().unwrap();
        assert!(json.contains(r#""type":"already_exists""#));
        assert!(json.contains(r#""entity":"tunnel""#));
        assert!(json.contains(r#""id":"t0""#));

        let parsed = ApiResponse::from_json(&json).unwrap();
        assert!(!parsed.success);
        let err: GuardError = parsed.error.unwrap().into();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_error_kinds_survive_conversion() {
        let errors = vec![
            GuardError::peer_not_found("p0"),
            GuardError::AddressConflict {
                tunnel: "t0".to_string(),
                address: "10.0.0.2".to_string(),
            },
            GuardError::AddressSpaceExhausted {
                tunnel: "t0".to_string(),
                subnet: "10.0.0.0/30".to_string(),
            },
            GuardError::Device {
                tunnel: "t0".to_string(),
                message: "down".to_string(),
            },
            GuardError::Infrastructure("disk".to_string()),
            GuardError::Cancelled("deadline".to_string()),
        ];

        for err in errors {
            let kind = err.kind();
            let api: ApiError = err.into();
            assert_eq!(api.kind(), kind);
            assert_eq!(GuardError::from(api).kind(), kind);
        }
    }
}
