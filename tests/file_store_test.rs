//! Identity flows over the persistent file-backed key store.

use std::sync::Arc;

use device_identity::auth::ScriptedAuthenticator;
use device_identity::crypto::KdfParams;
use device_identity::device::StaticDeviceId;
use device_identity::keystore::{FileKeyStore, KeyStore, KeyStoreError, StoreSecret};
use device_identity::{IdentityConfig, IdentityError, IdentityService};
use tempfile::TempDir;

const PREFIX: &str = "app-";

fn fast_kdf() -> KdfParams {
    KdfParams {
        memory_kb: 64,
        iterations: 1,
        parallelism: 1,
    }
}

fn service_with(store: FileKeyStore) -> IdentityService {
    IdentityService::new(
        Arc::new(store),
        Arc::new(StaticDeviceId::new("host-1")),
        Arc::new(ScriptedAuthenticator::approving()),
        IdentityConfig::default(),
    )
}

fn open(dir: &TempDir, secret: &str) -> IdentityService {
    let store =
        FileKeyStore::open(dir.path(), StoreSecret::from_passphrase(secret), fast_kdf()).unwrap();
    service_with(store)
}

#[tokio::test]
async fn test_identity_survives_restart() {
    let dir = TempDir::new().unwrap();

    let (report, signature) = {
        let service = open(&dir, "secret");
        let report = service.ensure_identity(PREFIX).await.unwrap();
        let signature = service
            .authenticate_and_sign(PREFIX, b"payload".to_vec())
            .await
            .unwrap();
        (report, signature)
    };
    assert!(report.created);

    let restarted = open(&dir, "secret");
    let again = restarted.ensure_identity(PREFIX).await.unwrap();

    assert!(!again.created);
    assert_eq!(again.public_key, report.public_key);
    assert!(restarted
        .verify(PREFIX, b"payload".to_vec(), &signature)
        .await
        .unwrap());

    // Export is per process
    assert_eq!(restarted.export_last_signature().await, None);
}

#[tokio::test]
async fn test_wrong_secret_cannot_sign() {
    let dir = TempDir::new().unwrap();
    open(&dir, "right").ensure_identity(PREFIX).await.unwrap();

    let service = open(&dir, "wrong");

    // Public material stays readable
    let report = service.ensure_identity(PREFIX).await.unwrap();
    assert!(!report.created);

    let result = service.authenticate_and_sign(PREFIX, b"payload".to_vec()).await;
    assert!(matches!(
        result,
        Err(IdentityError::KeyStore(KeyStoreError::Crypto(_)))
    ));
}

#[tokio::test]
async fn test_generated_store_secret() {
    let dir = TempDir::new().unwrap();

    let public_key = {
        let store = FileKeyStore::open_with_generated_secret(dir.path(), fast_kdf()).unwrap();
        let service = service_with(store);
        service.ensure_identity(PREFIX).await.unwrap().public_key
    };
    assert!(dir.path().join(".store-key").is_file());

    let store = FileKeyStore::open_with_generated_secret(dir.path(), fast_kdf()).unwrap();
    assert!(store.exists("app-host-1").unwrap());

    let service = service_with(store);
    assert_eq!(
        service.ensure_identity(PREFIX).await.unwrap().public_key,
        public_key
    );
    assert!(service
        .authenticate_and_sign(PREFIX, b"payload".to_vec())
        .await
        .is_ok());
}

#[test]
fn test_record_metadata_persisted() {
    let dir = TempDir::new().unwrap();
    let store =
        FileKeyStore::open(dir.path(), StoreSecret::from_passphrase("s"), fast_kdf()).unwrap();
    store
        .generate("alias", &device_identity::keystore::KeySpec::default())
        .unwrap();

    let reopened =
        FileKeyStore::open(dir.path(), StoreSecret::from_passphrase("s"), fast_kdf()).unwrap();
    let record = reopened.record("alias").unwrap();

    assert_eq!(record.subject, "CN=alias");
    assert_eq!(record.serial_number, 1);
    assert!(record.requires_authentication);
    assert_eq!((record.not_after - record.not_before).num_days(), 365);
}
