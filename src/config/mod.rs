//! Configuration management
//!
//! This module handles parsing and validation of the daemon's TOML
//! configuration file. Command-line flags are layered on top by the binary.

pub mod validation;

use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wg-guard/config.toml";

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Control plane server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Device backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Drive the kernel through `wg-quick` and `wg`
    #[default]
    WgQuick,
    /// Keep device state in memory (no kernel changes)
    Memory,
}

/// Control plane server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Control listen address; its host is also the guard tunnel's address
    #[serde(default = "default_address")]
    pub address: String,

    /// External endpoint of the guard tunnel (defaults to 127.0.0.1:<control port>)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Directory holding tunnel records and interface configs
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// ID of the tunnel the control plane itself is served through
    #[serde(default = "default_guard_tunnel")]
    pub guard_tunnel: String,

    /// Prefix length of the guard tunnel's subnet
    #[serde(default = "default_guard_prefix")]
    pub guard_prefix: u8,

    /// First UDP port handed to new tunnels
    #[serde(default = "default_base_listen_port")]
    pub base_listen_port: u16,

    /// Device backend
    #[serde(default)]
    pub backend: BackendKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            endpoint: None,
            state_dir: default_state_dir(),
            guard_tunnel: default_guard_tunnel(),
            guard_prefix: default_guard_prefix(),
            base_listen_port: default_base_listen_port(),
            backend: BackendKind::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            GuardError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        debug!("Loaded configuration from {:?}", path);
        Self::parse(&contents)
    }

    /// Load the file if it exists, falling back to defaults otherwise
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            debug!("No config file at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string
    pub fn parse(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| GuardError::Config(format!("Failed to parse TOML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()
    }
}

impl ServerConfig {
    /// Validate server settings
    pub fn validate(&self) -> Result<()> {
        validation::parse_listen_address(&self.address)?;
        validation::validate_id(&self.guard_tunnel)
            .map_err(|e| GuardError::Config(format!("guard_tunnel: {}", e)))?;
        validation::validate_port(self.base_listen_port)
            .map_err(|e| GuardError::Config(format!("base_listen_port: {}", e)))?;

        if let Some(endpoint) = &self.endpoint {
            validation::validate_endpoint(endpoint)
                .map_err(|e| GuardError::Config(format!("endpoint: {}", e)))?;
        }

        let max_prefix = match self.listen_address()? {
            SocketAddr::V4(_) => 32,
            SocketAddr::V6(_) => 128,
        };
        if self.guard_prefix > max_prefix {
            return Err(GuardError::Config(format!(
                "guard_prefix {} exceeds maximum {}",
                self.guard_prefix, max_prefix
            )));
        }

        if self.state_dir.as_os_str().is_empty() {
            return Err(GuardError::Config("state_dir cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Parsed control listen address
    pub fn listen_address(&self) -> Result<SocketAddr> {
        validation::parse_listen_address(&self.address)
    }

    /// Guard tunnel address in CIDR form, e.g. `10.199.199.1/24`
    pub fn guard_address(&self) -> Result<String> {
        let listen = self.listen_address()?;
        Ok(format!("{}/{}", listen.ip(), self.guard_prefix))
    }

    /// Guard tunnel endpoint, defaulting to loopback on the control port
    pub fn guard_endpoint(&self) -> Result<String> {
        match &self.endpoint {
            Some(endpoint) => Ok(endpoint.clone()),
            None => Ok(format!("127.0.0.1:{}", self.listen_address()?.port())),
        }
    }
}

// Default value functions for serde
fn default_address() -> String {
    "10.199.199.1:10100".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/etc/wireguard")
}

fn default_guard_tunnel() -> String {
    "guard0".to_string()
}

fn default_guard_prefix() -> u8 {
    24
}

fn default_base_listen_port() -> u16 {
    51820
}
