//! Authorized signing handle

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::crypto::DigestAlgorithm;
use crate::keystore::{Challenge, KeyStore};
use crate::types::{IdentityError, Result};

/// Permission to perform exactly one signature with one alias's key.
///
/// Produced only by a successful authentication. Not cloneable and not
/// serializable; the underlying challenge is released when the handle is
/// dropped unused.
pub struct AuthorizedSigningHandle {
    id: Uuid,
    alias: String,
    digest: DigestAlgorithm,
    challenge: Option<Challenge>,
    store: Arc<dyn KeyStore>,
    authorized_at: Instant,
    ttl: Duration,
}

impl AuthorizedSigningHandle {
    pub(crate) fn new(
        challenge: Challenge,
        digest: DigestAlgorithm,
        store: Arc<dyn KeyStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: challenge.id(),
            alias: challenge.alias().to_string(),
            digest,
            challenge: Some(challenge),
            store,
            authorized_at: Instant::now(),
            ttl,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    /// Whether the handle was used or outlived its validity window.
    pub fn is_expired(&self) -> bool {
        self.challenge.is_none() || self.authorized_at.elapsed() > self.ttl
    }

    /// Take the challenge for the one permitted signature.
    pub(crate) fn take_challenge(&mut self) -> Result<(Challenge, Arc<dyn KeyStore>)> {
        let challenge = self.challenge.take().ok_or(IdentityError::HandleExpired)?;

        if self.authorized_at.elapsed() > self.ttl {
            debug!(alias = %self.alias, handle = %self.id, "Signing handle outlived its window");
            self.store.release(challenge.id());
            return Err(IdentityError::HandleExpired);
        }

        Ok((challenge, Arc::clone(&self.store)))
    }
}

impl std::fmt::Debug for AuthorizedSigningHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedSigningHandle")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("digest", &self.digest)
            .field("used", &self.challenge.is_none())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Drop for AuthorizedSigningHandle {
    fn drop(&mut self) {
        if let Some(challenge) = self.challenge.take() {
            self.store.release(challenge.id());
        }
    }
}
