//! Configuration and request validation functions
//!
//! This module provides validation for tunnel and peer IDs, CIDR ranges,
//! endpoints and ports, used by both the daemon config and control requests.

use crate::error::{GuardError, Result};
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

/// Maximum ID length; tunnel IDs double as Linux interface names
pub const MAX_ID_LEN: usize = 15;

/// Validate a tunnel or peer ID (alphanumeric, dashes, underscores)
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(GuardError::Validation("ID cannot be empty".to_string()));
    }

    if id.len() > MAX_ID_LEN {
        return Err(GuardError::Validation(format!(
            "ID '{}' exceeds maximum length of {} characters",
            id, MAX_ID_LEN
        )));
    }

    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(GuardError::Validation(format!(
            "ID '{}' contains invalid characters (only alphanumeric, '_', and '-' allowed)",
            id
        )));
    }

    if id.starts_with('-') || id.starts_with('_') {
        return Err(GuardError::Validation(format!(
            "ID '{}' cannot start with dash or underscore",
            id
        )));
    }

    Ok(())
}

/// Parse an IP address
pub fn parse_ip_address(ip: &str) -> Result<IpAddr> {
    ip.trim()
        .parse::<IpAddr>()
        .map_err(|_| GuardError::Validation(format!("Invalid IP address: {}", ip)))
}

/// Parse CIDR notation (IP/prefix), keeping the host part
pub fn parse_cidr(cidr: &str) -> Result<IpNet> {
    let cidr = cidr.trim();
    if !cidr.contains('/') {
        return Err(GuardError::Validation(format!(
            "Invalid CIDR notation: {} (expected format: IP/prefix)",
            cidr
        )));
    }

    cidr.parse::<IpNet>()
        .map_err(|e| GuardError::Validation(format!("Invalid CIDR notation '{}': {}", cidr, e)))
}

/// Parse either a bare IP address or an `IP/prefix` and return the address
pub fn parse_host(value: &str) -> Result<IpAddr> {
    if value.contains('/') {
        parse_cidr(value).map(|net| net.addr())
    } else {
        parse_ip_address(value)
    }
}

/// Validate endpoint format (host:port)
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let parts: Vec<&str> = endpoint.rsplitn(2, ':').collect();

    if parts.len() != 2 {
        return Err(GuardError::Validation(format!(
            "Invalid endpoint format: {} (expected format: host:port)",
            endpoint
        )));
    }

    let port: u16 = parts[0].parse().map_err(|_| {
        GuardError::Validation(format!("Invalid port in endpoint: {}", endpoint))
    })?;
    validate_port(port)?;

    // Host validation is lenient (can be hostname or IP)
    let host = parts[1];
    if host.is_empty() {
        return Err(GuardError::Validation(
            "Host cannot be empty in endpoint".to_string(),
        ));
    }

    Ok(())
}

/// Validate a port number
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(GuardError::Validation("Port number cannot be 0".to_string()));
    }
    Ok(())
}

/// Parse a control listen address (must be a literal socket address)
pub fn parse_listen_address(address: &str) -> Result<SocketAddr> {
    address.parse().map_err(|e| {
        GuardError::Config(format!("Invalid listen address '{}': {}", address, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("t0").is_ok());
        assert!(validate_id("guard0").is_ok());
        assert!(validate_id("wg-test").is_ok());
        assert!(validate_id("wg_test").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("wg@test").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("-wg").is_err());
        assert!(validate_id("toolonginterfacename").is_err());
    }

    #[test]
    fn test_parse_cidr() {
        let net = parse_cidr("10.0.0.1/24").unwrap();
        assert_eq!(net.addr().to_string(), "10.0.0.1");
        assert_eq!(net.prefix_len(), 24);
        assert!(parse_cidr("fe80::/64").is_ok());
        assert!(parse_cidr("192.168.1.1").is_err());
        assert!(parse_cidr("192.168.1.0/33").is_err());
        assert!(parse_cidr("fe80::/129").is_err());
    }

    #[test]
    fn test_parse_host() {
        assert_eq!(parse_host("10.0.0.9").unwrap().to_string(), "10.0.0.9");
        assert_eq!(parse_host("10.0.0.9/32").unwrap().to_string(), "10.0.0.9");
        assert!(parse_host("invalid").is_err());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("example.com:51820").is_ok());
        assert!(validate_endpoint("192.168.1.1:51820").is_ok());
        assert!(validate_endpoint("[::1]:51820").is_ok());
        assert!(validate_endpoint("invalid").is_err());
        assert!(validate_endpoint("example.com:0").is_err());
        assert!(validate_endpoint(":51820").is_err());
    }

    #[test]
    fn test_parse_listen_address() {
        assert!(parse_listen_address("10.199.199.1:10100").is_ok());
        assert!(parse_listen_address("localhost").is_err());
    }
}
