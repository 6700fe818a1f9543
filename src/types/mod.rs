//! Shared data types for the identity core

pub mod error;

pub use error::{IdentityError, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::DigestAlgorithm;

// =============================================================================
// Device Identity
// =============================================================================

/// The alias under which this device's identity key is stored.
///
/// `alias = alias_prefix ++ device_id`. For a fixed prefix and device the
/// alias is identical across process restarts; it is the only lookup key
/// into the key store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub alias_prefix: String,
    pub alias: String,
}

impl DeviceIdentity {
    pub fn new(alias_prefix: impl Into<String>, device_id: impl Into<String>) -> Self {
        let alias_prefix = alias_prefix.into();
        let device_id = device_id.into();
        let alias = format!("{}{}", alias_prefix, device_id);
        Self {
            device_id,
            alias_prefix,
            alias,
        }
    }
}

// =============================================================================
// Provisioning Report
// =============================================================================

/// Outcome of `ensure_identity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityReport {
    pub device_id: String,
    pub alias: String,
    /// DER SubjectPublicKeyInfo, base64
    pub public_key: String,
    /// True when this call generated the key pair
    pub created: bool,
}

// =============================================================================
// Signature Result
// =============================================================================

/// Raw signature produced by the signing engine.
///
/// Hex rendering is a boundary concern; the engine only deals in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureResult {
    /// ASN.1 DER encoded ECDSA signature
    pub bytes: Vec<u8>,
    pub alias: String,
    pub digest: DigestAlgorithm,
    pub signed_at: DateTime<Utc>,
}

impl SignatureResult {
    /// Lowercase hex rendering used on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_is_prefix_then_device_id() {
        let identity = DeviceIdentity::new("payments-", "a1b2c3");
        assert_eq!(identity.alias, "payments-a1b2c3");
        assert_eq!(identity.device_id, "a1b2c3");
        assert_eq!(identity.alias_prefix, "payments-");
    }

    #[test]
    fn test_empty_prefix_alias_is_device_id() {
        let identity = DeviceIdentity::new("", "a1b2c3");
        assert_eq!(identity.alias, "a1b2c3");
    }

    #[test]
    fn test_signature_hex_is_lowercase() {
        let result = SignatureResult {
            bytes: vec![0xAB, 0x01, 0xFF],
            alias: "alias".into(),
            digest: DigestAlgorithm::Sha256,
            signed_at: Utc::now(),
        };
        assert_eq!(result.to_hex(), "ab01ff");
    }
}
