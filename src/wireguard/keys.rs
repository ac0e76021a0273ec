//! WireGuard key management
//!
//! This module handles generation and encoding of WireGuard cryptographic
//! keys using x25519. Keys travel as base64 strings on the wire and on disk.

use crate::error::{GuardError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Length in bytes of every WireGuard key
pub const KEY_LEN: usize = 32;

/// WireGuard private key (32 bytes, x25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: Zeroizing<[u8; KEY_LEN]>,
}

impl PrivateKey {
    /// Generate a new random private key from the OS entropy source
    pub fn generate() -> Result<Self> {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.try_fill_bytes(&mut bytes[..]).map_err(|e| {
            GuardError::Infrastructure(format!("Entropy source unavailable: {}", e))
        })?;

        // Clamp the same way `wg genkey` does
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;

        Ok(Self { secret: bytes })
    }

    /// Create a private key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            secret: Zeroizing::new(bytes),
        }
    }

    /// Parse a private key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s, "private").map(Self::from_bytes)
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.secret)
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.secret);
        let public = X25519PublicKey::from(&secret);
        PublicKey {
            key: public.to_bytes(),
        }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.secret
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        *self.secret == *other.secret
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

// Ensure private keys are never accidentally logged
impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(self.to_base64());
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        PrivateKey::from_base64(&encoded).map_err(de::Error::custom)
    }
}

/// WireGuard public key (32 bytes, x25519)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: [u8; KEY_LEN],
}

impl PublicKey {
    /// Create a public key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { key: bytes }
    }

    /// Parse a public key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s, "public").map(Self::from_bytes)
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        PublicKey::from_base64(&encoded).map_err(de::Error::custom)
    }
}

/// WireGuard key pair (private + public)
#[derive(Clone)]
pub struct KeyPair {
    /// Private key
    pub private: PrivateKey,
    /// Public key (derived from private)
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair. Fails only when the entropy source does.
    pub fn generate() -> Result<Self> {
        PrivateKey::generate().map(Self::from_private)
    }

    /// Create a key pair from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

fn decode_key(s: &str, which: &str) -> Result<[u8; KEY_LEN]> {
    let decoded = BASE64
        .decode(s.trim())
        .map_err(|e| GuardError::Validation(format!("Invalid base64 {} key: {}", which, e)))?;

    if decoded.len() != KEY_LEN {
        return Err(GuardError::Validation(format!(
            "Invalid {} key length: expected {} bytes, got {}",
            which,
            KEY_LEN,
            decoded.len()
        )));
    }

    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_keypair() {
        let keypair = KeyPair::generate().unwrap();
        assert_eq!(keypair.private.as_bytes().len(), 32);
        assert_eq!(keypair.public, keypair.private.public_key());
    }

    #[test]
    fn test_generated_keys_are_distinct() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        assert_ne!(a.private, b.private);
        assert_ne!(a.public, b.public);
    }

    #[test]
    fn test_generated_key_is_clamped() {
        let private = PrivateKey::generate().unwrap();
        let bytes = private.as_bytes();
        assert_eq!(bytes[0] & 0b0000_0111, 0);
        assert_eq!(bytes[31] & 0b1000_0000, 0);
        assert_eq!(bytes[31] & 0b0100_0000, 0b0100_0000);
    }

    #[test]
    fn test_private_key_to_base64() {
        let private = PrivateKey::generate().unwrap();
        assert_eq!(private.to_base64().len(), 44); // Base64 of 32 bytes
    }

    #[test]
    fn test_private_key_not_logged() {
        let private = PrivateKey::generate().unwrap();
        let debug_str = format!("{:?}", private);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains(&private.to_base64()));
        assert_eq!(private.to_string(), "[REDACTED]");
    }

    #[test]
    fn test_keys_serialize_as_base64() {
        let keypair = KeyPair::generate().unwrap();
        let json = serde_json::to_string(&keypair.public).unwrap();
        assert_eq!(json, format!("\"{}\"", keypair.public.to_base64()));

        let private: PrivateKey =
            serde_json::from_str(&format!("\"{}\"", keypair.private.to_base64())).unwrap();
        assert_eq!(private, keypair.private);
    }

    #[test]
    fn test_invalid_base64() {
        assert!(PrivateKey::from_base64("invalid!@#$").is_err());
        assert!(serde_json::from_str::<PublicKey>("\"not a key\"").is_err());
    }

    #[test]
    fn test_invalid_length() {
        let short_key = BASE64.encode([0u8; 16]);
        assert!(PrivateKey::from_base64(&short_key).is_err());
        assert!(PublicKey::from_base64(&short_key).is_err());
    }
}
