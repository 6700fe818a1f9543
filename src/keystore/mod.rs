//! Key Store Abstraction
//!
//! Capability surface over a hardware or OS backed key container. The
//! private half of a key never crosses this interface: callers obtain a
//! single-use [`Challenge`] with `begin_signing`, the authentication gate
//! authorizes it, and `sign` consumes it.
//!
//! # Implementations
//!
//! - [`MemoryKeyStore`]: process-local container, keys vanish on exit
//! - [`FileKeyStore`]: persistent directory store, keys wrapped at rest

pub mod file;
pub mod memory;

pub use file::{FileKeyStore, StoreSecret};
pub use memory::MemoryKeyStore;

use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{DigestAlgorithm, KeyAlgorithm, PublicKey};

// =============================================================================
// Errors
// =============================================================================

/// Error types for key store operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid alias: {0}")]
    InvalidAlias(String),

    /// Challenge was never issued, already consumed, or released
    #[error("Signing challenge expired or already used")]
    ChallengeExpired,

    #[error("Key requires user authentication: {0}")]
    AuthenticationRequired(String),

    #[error("Digest {digest} not permitted for key {alias}")]
    DigestNotPermitted {
        alias: String,
        digest: DigestAlgorithm,
    },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for KeyStoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for KeyStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("JSON error: {}", err))
    }
}

// =============================================================================
// Key Spec / Record
// =============================================================================

/// Parameters for generating an identity key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    pub algorithm: KeyAlgorithm,
    /// Digests the key may be used with
    pub digests: Vec<DigestAlgorithm>,
    /// Whether each signature needs a fresh authentication event
    pub requires_authentication: bool,
    /// Certificate validity from the moment of generation
    pub validity_days: u32,
}

impl Default for KeySpec {
    fn default() -> Self {
        Self {
            algorithm: KeyAlgorithm::EcP256,
            digests: vec![DigestAlgorithm::Sha256, DigestAlgorithm::Sha512],
            requires_authentication: true,
            validity_days: 365,
        }
    }
}

impl KeySpec {
    pub fn with_authentication(mut self, required: bool) -> Self {
        self.requires_authentication = required;
        self
    }
}

/// Public description of a stored key pair.
///
/// Never carries private material. Created at generation, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairRecord {
    pub alias: String,
    pub algorithm: KeyAlgorithm,
    pub digests: Vec<DigestAlgorithm>,
    pub requires_authentication: bool,
    pub public_key: PublicKey,
    /// Self-signed certificate subject, `CN=<alias>`
    pub subject: String,
    pub serial_number: u64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl KeyPairRecord {
    pub(crate) fn new(alias: &str, spec: &KeySpec, public_key: PublicKey) -> Self {
        let not_before = Utc::now();
        Self {
            alias: alias.to_string(),
            algorithm: spec.algorithm,
            digests: spec.digests.clone(),
            requires_authentication: spec.requires_authentication,
            public_key,
            subject: format!("CN={}", alias),
            serial_number: 1,
            not_before,
            not_after: not_before + ChronoDuration::days(i64::from(spec.validity_days)),
        }
    }

    pub fn permits(&self, digest: DigestAlgorithm) -> bool {
        self.digests.contains(&digest)
    }

    /// Reject a digest the key was not generated for.
    pub(crate) fn check_digest(&self, digest: DigestAlgorithm) -> Result<(), KeyStoreError> {
        if self.permits(digest) {
            Ok(())
        } else {
            Err(KeyStoreError::DigestNotPermitted {
                alias: self.alias.clone(),
                digest,
            })
        }
    }
}

// =============================================================================
// Signing Challenge
// =============================================================================

/// Single-use token for one private-key operation.
///
/// Issued by a key store for one alias. Only this crate's authentication
/// gate can mark it authorized, so a store can refuse to sign with an
/// authentication-bound key unless a real authentication event happened.
#[derive(Debug)]
pub struct Challenge {
    id: Uuid,
    alias: String,
    issued_at: Instant,
    authorized: bool,
}

impl Challenge {
    /// Create a fresh, unauthorized challenge for `alias`.
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alias: alias.into(),
            issued_at: Instant::now(),
            authorized: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub(crate) fn authorize(&mut self) {
        self.authorized = true;
    }
}

/// Outstanding challenges issued by a store, keyed by challenge id.
#[derive(Debug, Default)]
pub struct PendingChallenges {
    issued: DashMap<Uuid, String>,
}

impl PendingChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue and register a challenge for `alias`.
    pub fn issue(&self, alias: &str) -> Challenge {
        let challenge = Challenge::new(alias);
        self.issued.insert(challenge.id(), alias.to_string());
        challenge
    }

    /// Remove the challenge, failing if it is unknown or bound to another alias.
    pub fn redeem(&self, challenge: &Challenge) -> Result<(), KeyStoreError> {
        match self.issued.remove(&challenge.id()) {
            Some((_, alias)) if alias == challenge.alias() => Ok(()),
            _ => Err(KeyStoreError::ChallengeExpired),
        }
    }

    pub fn release(&self, challenge_id: Uuid) -> bool {
        self.issued.remove(&challenge_id).is_some()
    }

    /// Drop every challenge bound to `alias`.
    pub fn revoke_alias(&self, alias: &str) -> usize {
        let before = self.issued.len();
        self.issued.retain(|_, issued_for| issued_for != alias);
        before - self.issued.len()
    }

    pub fn len(&self) -> usize {
        self.issued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}

/// Shared signing precondition: the key must allow the digest, and an
/// authentication-bound key needs an authorized challenge.
pub(crate) fn check_signing_allowed(
    record: &KeyPairRecord,
    challenge: &Challenge,
    digest: DigestAlgorithm,
) -> Result<(), KeyStoreError> {
    record.check_digest(digest)?;
    if record.requires_authentication && !challenge.is_authorized() {
        return Err(KeyStoreError::AuthenticationRequired(record.alias.clone()));
    }
    Ok(())
}

pub(crate) fn validate_alias(alias: &str) -> Result<(), KeyStoreError> {
    if alias.is_empty() {
        return Err(KeyStoreError::InvalidAlias("alias is empty".into()));
    }
    if alias.chars().any(char::is_control) {
        return Err(KeyStoreError::InvalidAlias(
            "alias contains control characters".into(),
        ));
    }
    Ok(())
}

// =============================================================================
// Key Store Trait
// =============================================================================

/// Core trait for key containers.
///
/// Implementations do their own internal locking; every method may be
/// called from several threads at once. All methods may block.
pub trait KeyStore: Send + Sync {
    /// Backend identifier for logs.
    fn id(&self) -> &str;

    /// Whether a key pair exists under `alias`. Absence is not an error.
    fn exists(&self, alias: &str) -> Result<bool, KeyStoreError>;

    /// Create a key pair under `alias`.
    ///
    /// Callers check [`KeyStore::exists`] first; an existing alias fails
    /// with `AlreadyExists`.
    fn generate(&self, alias: &str, spec: &KeySpec) -> Result<KeyPairRecord, KeyStoreError>;

    fn record(&self, alias: &str) -> Result<KeyPairRecord, KeyStoreError>;

    fn public_key(&self, alias: &str) -> Result<PublicKey, KeyStoreError> {
        Ok(self.record(alias)?.public_key)
    }

    /// Remove a key pair and invalidate its outstanding challenges.
    /// Returns whether a key was removed.
    fn delete(&self, alias: &str) -> Result<bool, KeyStoreError>;

    /// Issue a single-use challenge for a private-key operation.
    fn begin_signing(&self, alias: &str) -> Result<Challenge, KeyStoreError>;

    /// Sign `payload` under the challenge's key, consuming the challenge.
    fn sign(
        &self,
        challenge: Challenge,
        digest: DigestAlgorithm,
        payload: &[u8],
    ) -> Result<Vec<u8>, KeyStoreError>;

    /// Invalidate an unused challenge. Unknown ids are ignored.
    fn release(&self, challenge_id: Uuid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_matches_identity_key() {
        let spec = KeySpec::default();
        assert_eq!(spec.algorithm, KeyAlgorithm::EcP256);
        assert!(spec.digests.contains(&DigestAlgorithm::Sha256));
        assert!(spec.digests.contains(&DigestAlgorithm::Sha512));
        assert!(spec.requires_authentication);
        assert_eq!(spec.validity_days, 365);
    }

    #[test]
    fn test_challenge_single_redeem() {
        let pending = PendingChallenges::new();
        let challenge = pending.issue("alias-1");
        assert_eq!(pending.len(), 1);

        assert!(pending.redeem(&challenge).is_ok());
        assert!(matches!(
            pending.redeem(&challenge),
            Err(KeyStoreError::ChallengeExpired)
        ));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_foreign_challenge_rejected() {
        let pending = PendingChallenges::new();
        let forged = Challenge::new("alias-1");

        assert!(matches!(
            pending.redeem(&forged),
            Err(KeyStoreError::ChallengeExpired)
        ));
    }

    #[test]
    fn test_revoke_alias_only_touches_that_alias() {
        let pending = PendingChallenges::new();
        let _a1 = pending.issue("a");
        let _a2 = pending.issue("a");
        let b = pending.issue("b");

        assert_eq!(pending.revoke_alias("a"), 2);
        assert_eq!(pending.len(), 1);
        assert!(pending.redeem(&b).is_ok());
    }

    #[test]
    fn test_validate_alias() {
        assert!(validate_alias("prefix-device").is_ok());
        assert!(validate_alias("").is_err());
        assert!(validate_alias("bad\nalias").is_err());
    }
}
