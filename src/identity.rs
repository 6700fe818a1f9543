//! Identity Key Manager
//!
//! Derives the device alias and provisions the identity key pair on first
//! use. Provisioning is idempotent: a second call for the same prefix on
//! the same device returns the existing public key.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::device::DeviceIdSource;
use crate::keystore::{KeySpec, KeyStore, KeyStoreError};
use crate::types::{DeviceIdentity, IdentityError, IdentityReport, Result};

pub struct IdentityKeyManager {
    store: Arc<dyn KeyStore>,
    device: Arc<dyn DeviceIdSource>,
    spec: KeySpec,
    /// Consulted before generating an authentication-bound key
    enrollment: Option<Arc<dyn Authenticator>>,
}

impl IdentityKeyManager {
    pub fn new(store: Arc<dyn KeyStore>, device: Arc<dyn DeviceIdSource>) -> Self {
        Self {
            store,
            device,
            spec: KeySpec::default(),
            enrollment: None,
        }
    }

    pub fn with_spec(mut self, spec: KeySpec) -> Self {
        self.spec = spec;
        self
    }

    /// Refuse to generate an authentication-bound key while `authenticator`
    /// has nothing enrolled.
    pub fn require_enrollment(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.enrollment = Some(authenticator);
        self
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub fn spec(&self) -> &KeySpec {
        &self.spec
    }

    /// Compute the alias for `alias_prefix` on this device.
    pub fn resolve(&self, alias_prefix: &str) -> Result<DeviceIdentity> {
        let device_id = self.device.device_id()?;
        Ok(DeviceIdentity::new(alias_prefix, device_id))
    }

    /// Return the identity key for `alias_prefix`, generating it if absent.
    ///
    /// Blocking. Every failure, an unreadable device id included, is
    /// `ProvisioningFailed`. Not atomic against a concurrent call for the
    /// same alias; the loser of such a race gets `ProvisioningFailed` too.
    pub fn ensure_identity(&self, alias_prefix: &str) -> Result<IdentityReport> {
        let identity = self.resolve(alias_prefix).map_err(|e| match e {
            IdentityError::DeviceIdUnavailable(reason) => {
                IdentityError::ProvisioningFailed(format!("device id unavailable: {}", reason))
            }
            other => other,
        })?;
        let alias = identity.alias.as_str();

        let exists = self.store.exists(alias).map_err(provisioning_failed)?;
        if exists {
            let public_key = self.store.public_key(alias).map_err(provisioning_failed)?;
            debug!(alias = %alias, "Identity key already provisioned");
            return Ok(IdentityReport {
                device_id: identity.device_id,
                alias: identity.alias,
                public_key: public_key.to_base64(),
                created: false,
            });
        }

        if self.spec.requires_authentication {
            if let Some(authenticator) = &self.enrollment {
                let availability = authenticator.availability();
                if !availability.is_available() {
                    warn!(
                        alias = %alias,
                        authenticator = %authenticator.id(),
                        reason = availability.reason(),
                        "Cannot provision authentication-bound key"
                    );
                    return Err(IdentityError::ProvisioningFailed(format!(
                        "authenticator not usable: {}",
                        availability.reason()
                    )));
                }
            }
        }

        let record = self
            .store
            .generate(alias, &self.spec)
            .map_err(provisioning_failed)?;

        info!(
            alias = %alias,
            store = %self.store.id(),
            algorithm = %record.algorithm,
            requires_authentication = record.requires_authentication,
            "Provisioned identity key"
        );

        Ok(IdentityReport {
            device_id: identity.device_id,
            alias: identity.alias,
            public_key: record.public_key.to_base64(),
            created: true,
        })
    }
}

fn provisioning_failed(err: KeyStoreError) -> IdentityError {
    IdentityError::ProvisioningFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Availability, ScriptedAuthenticator};
    use crate::device::StaticDeviceId;
    use crate::keystore::MemoryKeyStore;

    fn manager(device_id: &str) -> (Arc<MemoryKeyStore>, IdentityKeyManager) {
        let store = Arc::new(MemoryKeyStore::new());
        let manager =
            IdentityKeyManager::new(store.clone(), Arc::new(StaticDeviceId::new(device_id)));
        (store, manager)
    }

    #[test]
    fn test_ensure_identity_idempotent() {
        let (store, manager) = manager("device-1");

        let first = manager.ensure_identity("app-").unwrap();
        let second = manager.ensure_identity("app-").unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.public_key, second.public_key);
        assert_eq!(first.alias, "app-device-1");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_distinct_prefixes_distinct_keys() {
        let (store, manager) = manager("device-1");

        let a = manager.ensure_identity("a-").unwrap();
        let b = manager.ensure_identity("b-").unwrap();

        assert_ne!(a.public_key, b.public_key);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_resolve_does_not_touch_store() {
        let (store, manager) = manager("device-1");

        let identity = manager.resolve("app-").unwrap();
        assert_eq!(identity.alias, "app-device-1");
        assert!(store.is_empty());
    }

    #[test]
    fn test_empty_device_id() {
        let (store, manager) = manager("");
        assert!(matches!(
            manager.resolve("app-"),
            Err(IdentityError::DeviceIdUnavailable(_))
        ));

        match manager.ensure_identity("app-") {
            Err(IdentityError::ProvisioningFailed(reason)) => {
                assert!(reason.starts_with("device id unavailable"))
            }
            other => panic!("expected provisioning failure, got {other:?}"),
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_unenrolled_authenticator_fails_fast() {
        let (store, manager) = manager("device-1");
        let authenticator =
            ScriptedAuthenticator::approving().with_availability(Availability::NoneEnrolled);
        let manager = manager.require_enrollment(Arc::new(authenticator));

        let result = manager.ensure_identity("app-");
        assert!(matches!(result, Err(IdentityError::ProvisioningFailed(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_unbound_key_skips_enrollment_check() {
        let (_store, manager) = manager("device-1");
        let authenticator =
            ScriptedAuthenticator::approving().with_availability(Availability::NoHardware);
        let manager = manager
            .with_spec(KeySpec::default().with_authentication(false))
            .require_enrollment(Arc::new(authenticator));

        assert!(manager.ensure_identity("app-").unwrap().created);
    }

    #[test]
    fn test_invalid_alias_is_provisioning_failure() {
        let (_store, manager) = manager("dev\nice");
        assert!(matches!(
            manager.ensure_identity("app-"),
            Err(IdentityError::ProvisioningFailed(_))
        ));
    }
}
