//! Verification Engine

use tracing::debug;

use crate::crypto::{verify_payload, DigestAlgorithm};
use crate::keystore::{KeyStore, KeyStoreError};
use crate::types::{IdentityError, Result};

/// Decode a hex signature strictly. Odd length or any non-hex character
/// is malformed input.
pub fn decode_signature(signature_hex: &str) -> Result<Vec<u8>> {
    hex::decode(signature_hex).map_err(|e| IdentityError::MalformedSignature(e.to_string()))
}

/// Check `signature_hex` over `payload` against the public key stored
/// under `alias`.
///
/// A well-formed hex string that is not a valid signature is a plain
/// `false`, not an error.
pub fn verify(
    store: &dyn KeyStore,
    alias: &str,
    digest: DigestAlgorithm,
    payload: &[u8],
    signature_hex: &str,
) -> Result<bool> {
    let public_key = store.public_key(alias).map_err(|e| match e {
        KeyStoreError::NotFound(alias) => IdentityError::KeyNotFound(alias),
        other => IdentityError::KeyStore(other),
    })?;

    let signature = decode_signature(signature_hex)?;

    if payload.is_empty() {
        return Err(IdentityError::NoPayload);
    }

    let valid = verify_payload(&public_key, digest, payload, &signature);
    debug!(alias = %alias, digest = %digest, valid, "Signature verified");
    Ok(valid)
}
