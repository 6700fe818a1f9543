//! Process-local key store.
//!
//! Keys live in a concurrent map for the lifetime of the store. Signing
//! keys are zeroized when an entry is dropped.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use p256::ecdsa::SigningKey;
use tracing::debug;
use uuid::Uuid;

use super::{
    check_signing_allowed, validate_alias, Challenge, KeyPairRecord, KeySpec, KeyStore,
    KeyStoreError, PendingChallenges,
};
use crate::crypto::{generate_keypair, sign_payload, DigestAlgorithm, PublicKey};

struct StoredKey {
    signing_key: SigningKey,
    record: KeyPairRecord,
}

/// In-memory key container.
pub struct MemoryKeyStore {
    keys: DashMap<String, StoredKey>,
    challenges: PendingChallenges,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            challenges: PendingChallenges::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of issued, not yet consumed challenges.
    pub fn outstanding_challenges(&self) -> usize {
        self.challenges.len()
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    fn id(&self) -> &str {
        "memory"
    }

    fn exists(&self, alias: &str) -> Result<bool, KeyStoreError> {
        Ok(self.keys.contains_key(alias))
    }

    fn generate(&self, alias: &str, spec: &KeySpec) -> Result<KeyPairRecord, KeyStoreError> {
        validate_alias(alias)?;

        match self.keys.entry(alias.to_string()) {
            Entry::Occupied(_) => Err(KeyStoreError::AlreadyExists(alias.to_string())),
            Entry::Vacant(slot) => {
                let (signing_key, verifying_key) = generate_keypair();
                let record =
                    KeyPairRecord::new(alias, spec, PublicKey::from_verifying_key(verifying_key)?);
                slot.insert(StoredKey {
                    signing_key,
                    record: record.clone(),
                });
                debug!(alias = %alias, "Generated in-memory key pair");
                Ok(record)
            }
        }
    }

    fn record(&self, alias: &str) -> Result<KeyPairRecord, KeyStoreError> {
        self.keys
            .get(alias)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| KeyStoreError::NotFound(alias.to_string()))
    }

    fn delete(&self, alias: &str) -> Result<bool, KeyStoreError> {
        let removed = self.keys.remove(alias).is_some();
        if removed {
            let revoked = self.challenges.revoke_alias(alias);
            debug!(alias = %alias, revoked, "Deleted in-memory key pair");
        }
        Ok(removed)
    }

    fn begin_signing(&self, alias: &str) -> Result<Challenge, KeyStoreError> {
        if !self.keys.contains_key(alias) {
            return Err(KeyStoreError::NotFound(alias.to_string()));
        }
        Ok(self.challenges.issue(alias))
    }

    fn sign(
        &self,
        challenge: Challenge,
        digest: DigestAlgorithm,
        payload: &[u8],
    ) -> Result<Vec<u8>, KeyStoreError> {
        self.challenges.redeem(&challenge)?;

        let entry = self
            .keys
            .get(challenge.alias())
            .ok_or_else(|| KeyStoreError::NotFound(challenge.alias().to_string()))?;

        check_signing_allowed(&entry.record, &challenge, digest)?;
        sign_payload(&entry.signing_key, digest, payload)
    }

    fn release(&self, challenge_id: Uuid) {
        self.challenges.release(challenge_id);
    }
}
