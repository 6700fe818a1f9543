//! Identity Service
//!
//! Boundary operations over the identity core. Key store and crypto work
//! runs on the blocking pool; the authentication prompt runs as its own
//! task and its verdict is awaited here.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::{AuthCanceller, AuthSession, AuthenticationGate, Authenticator};
use crate::config::IdentityConfig;
use crate::crypto::DigestAlgorithm;
use crate::device::DeviceIdSource;
use crate::identity::IdentityKeyManager;
use crate::keystore::KeyStore;
use crate::signing;
use crate::types::{DeviceIdentity, IdentityError, IdentityReport, Result, SignatureResult};
use crate::verification;

pub struct IdentityService {
    manager: Arc<IdentityKeyManager>,
    gate: AuthenticationGate,
    config: IdentityConfig,
    last_signature: RwLock<Option<SignatureResult>>,
}

impl IdentityService {
    pub fn new(
        store: Arc<dyn KeyStore>,
        device: Arc<dyn DeviceIdSource>,
        authenticator: Arc<dyn Authenticator>,
        config: IdentityConfig,
    ) -> Self {
        let mut manager = IdentityKeyManager::new(Arc::clone(&store), device)
            .with_spec(config.key_spec.clone());
        if config.require_enrollment {
            manager = manager.require_enrollment(Arc::clone(&authenticator));
        }

        let gate = AuthenticationGate::new(store, authenticator, config.gate.clone());

        Self {
            manager: Arc::new(manager),
            gate,
            config,
            last_signature: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn digest(&self) -> DigestAlgorithm {
        self.config.digest
    }

    pub fn gate(&self) -> &AuthenticationGate {
        &self.gate
    }

    pub fn manager(&self) -> &IdentityKeyManager {
        &self.manager
    }

    /// Alias for `alias_prefix` on this device.
    pub async fn resolve(&self, alias_prefix: &str) -> Result<DeviceIdentity> {
        let manager = Arc::clone(&self.manager);
        let prefix = alias_prefix.to_string();
        tokio::task::spawn_blocking(move || manager.resolve(&prefix)).await?
    }

    /// Provision the identity key for `alias_prefix` if absent.
    pub async fn ensure_identity(&self, alias_prefix: &str) -> Result<IdentityReport> {
        let manager = Arc::clone(&self.manager);
        let prefix = alias_prefix.to_string();
        tokio::task::spawn_blocking(move || manager.ensure_identity(&prefix)).await?
    }

    /// Authenticate the user, then sign `payload`. Returns lowercase hex.
    pub async fn authenticate_and_sign(
        &self,
        alias_prefix: &str,
        payload: Vec<u8>,
    ) -> Result<String> {
        self.request_signature(alias_prefix, payload)
            .await?
            .complete()
            .await
    }

    /// Put the prompt up for a signature without waiting for the verdict.
    ///
    /// The payload is checked before anything is prompted.
    pub async fn request_signature(
        &self,
        alias_prefix: &str,
        payload: Vec<u8>,
    ) -> Result<SignatureRequest<'_>> {
        if payload.is_empty() {
            return Err(IdentityError::NoPayload);
        }

        let identity = self.resolve(alias_prefix).await?;
        let session = self.gate.begin(&identity.alias, self.digest()).await?;

        debug!(alias = %identity.alias, payload_len = payload.len(), "Signature requested");

        Ok(SignatureRequest {
            service: self,
            session,
            payload,
        })
    }

    /// Check a hex signature over `payload` against the identity key.
    pub async fn verify(
        &self,
        alias_prefix: &str,
        payload: Vec<u8>,
        signature_hex: &str,
    ) -> Result<bool> {
        let identity = self.resolve(alias_prefix).await?;
        let store = Arc::clone(self.manager.store());
        let digest = self.digest();
        let signature_hex = signature_hex.to_string();

        tokio::task::spawn_blocking(move || {
            verification::verify(
                store.as_ref(),
                &identity.alias,
                digest,
                &payload,
                &signature_hex,
            )
        })
        .await?
    }

    /// Hex of the most recent signature produced by this service.
    ///
    /// Absence is a soft failure: logged, never an error.
    pub async fn export_last_signature(&self) -> Option<String> {
        let last = self.last_signature.read().await;
        match last.as_ref() {
            Some(signature) => Some(signature.to_hex()),
            None => {
                warn!("No signature to export");
                None
            }
        }
    }

    pub async fn last_signature(&self) -> Option<SignatureResult> {
        self.last_signature.read().await.clone()
    }

    async fn record_signature(&self, signature: SignatureResult) {
        *self.last_signature.write().await = Some(signature);
    }
}

/// A signature waiting on its authentication prompt.
///
/// Dropping it withdraws the prompt.
pub struct SignatureRequest<'a> {
    service: &'a IdentityService,
    session: AuthSession,
    payload: Vec<u8>,
}

impl SignatureRequest<'_> {
    pub fn alias(&self) -> &str {
        self.session.alias()
    }

    pub fn canceller(&self) -> AuthCanceller {
        self.session.canceller()
    }

    /// Wait for authentication and sign.
    pub async fn complete(self) -> Result<String> {
        let Self {
            service,
            session,
            payload,
        } = self;

        let mut handle = session.wait().await?;
        let signature =
            tokio::task::spawn_blocking(move || signing::sign(&mut handle, &payload)).await??;

        info!(
            alias = %signature.alias,
            digest = %signature.digest,
            "Signature produced"
        );

        let hex = signature.to_hex();
        service.record_signature(signature).await;
        Ok(hex)
    }
}
