//! Signing Engine
//!
//! Turns an authorized handle and a payload into raw signature bytes. The
//! handle is consumed by the first call that reaches the key store.

use chrono::Utc;
use tracing::debug;

use crate::auth::AuthorizedSigningHandle;
use crate::keystore::KeyStoreError;
use crate::types::{IdentityError, Result, SignatureResult};

/// Sign `payload` with the handle's key.
///
/// An empty payload is rejected before the handle is touched, so the same
/// handle can still be used with a real payload.
pub fn sign(handle: &mut AuthorizedSigningHandle, payload: &[u8]) -> Result<SignatureResult> {
    if payload.is_empty() {
        return Err(IdentityError::NoPayload);
    }

    let digest = handle.digest();
    let (challenge, store) = handle.take_challenge()?;
    let alias = challenge.alias().to_string();

    let bytes = store.sign(challenge, digest, payload).map_err(|e| match e {
        // Key deleted or challenge revoked after authorization
        KeyStoreError::NotFound(_) | KeyStoreError::ChallengeExpired => {
            IdentityError::HandleExpired
        }
        other => IdentityError::KeyStore(other),
    })?;

    debug!(
        alias = %alias,
        digest = %digest,
        payload_len = payload.len(),
        signature_len = bytes.len(),
        "Payload signed"
    );

    Ok(SignatureResult {
        bytes,
        alias,
        digest,
        signed_at: Utc::now(),
    })
}
