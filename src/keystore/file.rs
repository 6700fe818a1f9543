//! Persistent directory-backed key store.
//!
//! Each key pair is one JSON document named after the hex SHA-256 of its
//! alias. The private scalar is wrapped with ChaCha20-Poly1305 under a key
//! derived (Argon2id) from the store secret and a per-key random salt, so
//! the document on disk is useless without the secret.
//!
//! The store secret comes from configuration or is generated once into
//! `<dir>/.store-key` with owner-only permissions.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use p256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use super::{
    check_signing_allowed, validate_alias, Challenge, KeyPairRecord, KeySpec, KeyStore,
    KeyStoreError, PendingChallenges,
};
use crate::crypto::{
    decrypt_private_key, derive_key_encryption_key, encrypt_private_key, generate_keypair,
    generate_random_bytes, sign_payload, DigestAlgorithm, KdfParams, KeyAlgorithm, PublicKey,
    NONCE_LEN, PRIVATE_KEY_LEN, SALT_LEN,
};

/// Current key document format version
const KEY_FILE_VERSION: u32 = 1;

/// Generated store secret length
const STORE_SECRET_LEN: usize = 32;

/// File name of the generated store secret inside the store directory
pub const STORE_SECRET_FILE: &str = ".store-key";

// =============================================================================
// Store Secret
// =============================================================================

/// Secret the key-wrapping keys are derived from. Zeroized on drop.
pub struct StoreSecret(Zeroizing<Vec<u8>>);

impl StoreSecret {
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self(Zeroizing::new(passphrase.as_bytes().to_vec()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Read the secret file, creating it with fresh random bytes if absent.
    pub fn load_or_create(path: &Path) -> Result<Self, KeyStoreError> {
        match fs::read(path) {
            Ok(bytes) if bytes.len() == STORE_SECRET_LEN => Ok(Self::from_bytes(bytes)),
            Ok(bytes) => Err(KeyStoreError::Storage(format!(
                "Store secret {} has invalid length {}",
                path.display(),
                bytes.len()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut bytes: [u8; STORE_SECRET_LEN] = generate_random_bytes();
                write_private_file(path, &bytes, true)?;
                let secret = Self::from_bytes(bytes.to_vec());
                bytes.zeroize();
                info!(path = %path.display(), "Generated new key store secret");
                Ok(secret)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for StoreSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreSecret(..)")
    }
}

// =============================================================================
// Key Document
// =============================================================================

/// On-disk representation of one key pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyDocument {
    version: u32,
    alias: String,
    algorithm: KeyAlgorithm,
    digests: Vec<DigestAlgorithm>,
    requires_authentication: bool,
    subject: String,
    serial_number: u64,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    /// DER SubjectPublicKeyInfo (base64)
    public_key: String,
    /// Wrapped private scalar (base64)
    encrypted_private_key: String,
    /// Key derivation salt (base64)
    key_derivation_salt: String,
    /// Encryption nonce (base64)
    encryption_nonce: String,
}

impl KeyDocument {
    fn to_record(&self) -> Result<KeyPairRecord, KeyStoreError> {
        Ok(KeyPairRecord {
            alias: self.alias.clone(),
            algorithm: self.algorithm,
            digests: self.digests.clone(),
            requires_authentication: self.requires_authentication,
            public_key: PublicKey::from_base64(&self.public_key)?,
            subject: self.subject.clone(),
            serial_number: self.serial_number,
            not_before: self.not_before,
            not_after: self.not_after,
        })
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, KeyStoreError> {
    BASE64
        .decode(value)
        .map_err(|e| KeyStoreError::Storage(format!("Invalid {name} encoding: {e}")))
}

// =============================================================================
// File Key Store
// =============================================================================

/// Key container persisted in a directory.
pub struct FileKeyStore {
    dir: PathBuf,
    secret: StoreSecret,
    kdf: KdfParams,
    challenges: PendingChallenges,
    /// Serializes generate/delete so check-then-write is atomic per store
    write_lock: Mutex<()>,
}

impl FileKeyStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(
        dir: impl Into<PathBuf>,
        secret: StoreSecret,
        kdf: KdfParams,
    ) -> Result<Self, KeyStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }

        debug!(dir = %dir.display(), "Opened file key store");

        Ok(Self {
            dir,
            secret,
            kdf,
            challenges: PendingChallenges::new(),
            write_lock: Mutex::new(()),
        })
    }

    /// Open with the secret stored in `<dir>/.store-key`.
    pub fn open_with_generated_secret(
        dir: impl Into<PathBuf>,
        kdf: KdfParams,
    ) -> Result<Self, KeyStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let secret = StoreSecret::load_or_create(&dir.join(STORE_SECRET_FILE))?;
        Self::open(dir, secret, kdf)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, alias: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(alias.as_bytes()));
        self.dir.join(format!("{name}.json"))
    }

    fn read_document(&self, alias: &str) -> Result<KeyDocument, KeyStoreError> {
        let path = self.key_path(alias);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyStoreError::NotFound(alias.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let document: KeyDocument = serde_json::from_str(&content)?;
        if document.version != KEY_FILE_VERSION {
            return Err(KeyStoreError::Storage(format!(
                "Unsupported key document version {} in {}",
                document.version,
                path.display()
            )));
        }
        if document.alias != alias {
            return Err(KeyStoreError::Storage(format!(
                "Key document {} belongs to a different alias",
                path.display()
            )));
        }
        Ok(document)
    }

    fn unwrap_signing_key(&self, document: &KeyDocument) -> Result<SigningKey, KeyStoreError> {
        let salt = decode_field("salt", &document.key_derivation_salt)?;
        let nonce = decode_field("nonce", &document.encryption_nonce)?;
        let encrypted = decode_field("ciphertext", &document.encrypted_private_key)?;

        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| KeyStoreError::Storage("Invalid nonce length".into()))?;

        let mut encryption_key =
            derive_key_encryption_key(self.secret.as_bytes(), &salt, &self.kdf)?;
        let decrypted = decrypt_private_key(&encrypted, &encryption_key, &nonce);
        encryption_key.zeroize();

        let mut private_key = decrypted?;
        let signing_key = SigningKey::from_slice(&private_key)
            .map_err(|e| KeyStoreError::Crypto(format!("Invalid stored private key: {e}")));
        private_key.zeroize();
        signing_key
    }

    fn wrap_new_key(&self, alias: &str, spec: &KeySpec) -> Result<KeyDocument, KeyStoreError> {
        let (signing_key, verifying_key) = generate_keypair();
        let public_key = PublicKey::from_verifying_key(verifying_key)?;
        let record = KeyPairRecord::new(alias, spec, public_key);

        let salt: [u8; SALT_LEN] = generate_random_bytes();
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();

        let mut encryption_key =
            derive_key_encryption_key(self.secret.as_bytes(), &salt, &self.kdf)?;
        let mut private_key = [0u8; PRIVATE_KEY_LEN];
        private_key.copy_from_slice(&signing_key.to_bytes());

        let encrypted = encrypt_private_key(&private_key, &encryption_key, &nonce);
        private_key.zeroize();
        encryption_key.zeroize();

        Ok(KeyDocument {
            version: KEY_FILE_VERSION,
            alias: record.alias,
            algorithm: record.algorithm,
            digests: record.digests,
            requires_authentication: record.requires_authentication,
            subject: record.subject,
            serial_number: record.serial_number,
            not_before: record.not_before,
            not_after: record.not_after,
            public_key: record.public_key.to_base64(),
            encrypted_private_key: BASE64.encode(encrypted?),
            key_derivation_salt: BASE64.encode(salt),
            encryption_nonce: BASE64.encode(nonce),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, KeyStoreError> {
        self.write_lock
            .lock()
            .map_err(|_| KeyStoreError::Storage("Key store lock poisoned".into()))
    }
}

/// Write `contents` to `path` readable only by the owner.
///
/// Goes through a temporary sibling and a rename so readers never see a
/// partially written document.
fn write_private_file(path: &Path, contents: &[u8], create_new: bool) -> Result<(), KeyStoreError> {
    if create_new && path.exists() {
        return Err(KeyStoreError::Storage(format!(
            "{} already exists",
            path.display()
        )));
    }

    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = (|| -> Result<(), KeyStoreError> {
        let mut file = options.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

impl KeyStore for FileKeyStore {
    fn id(&self) -> &str {
        "file"
    }

    fn exists(&self, alias: &str) -> Result<bool, KeyStoreError> {
        Ok(self.key_path(alias).is_file())
    }

    fn generate(&self, alias: &str, spec: &KeySpec) -> Result<KeyPairRecord, KeyStoreError> {
        validate_alias(alias)?;
        let _guard = self.lock()?;

        let path = self.key_path(alias);
        if path.exists() {
            return Err(KeyStoreError::AlreadyExists(alias.to_string()));
        }

        let document = self.wrap_new_key(alias, spec)?;
        let json = serde_json::to_vec_pretty(&document)?;
        write_private_file(&path, &json, true)?;

        info!(alias = %alias, path = %path.display(), "Generated persistent key pair");
        document.to_record()
    }

    fn record(&self, alias: &str) -> Result<KeyPairRecord, KeyStoreError> {
        self.read_document(alias)?.to_record()
    }

    fn delete(&self, alias: &str) -> Result<bool, KeyStoreError> {
        let _guard = self.lock()?;
        let revoked = self.challenges.revoke_alias(alias);

        match fs::remove_file(self.key_path(alias)) {
            Ok(()) => {
                info!(alias = %alias, revoked, "Deleted persistent key pair");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(alias = %alias, error = %e, "Failed to delete key document");
                Err(e.into())
            }
        }
    }

    fn begin_signing(&self, alias: &str) -> Result<Challenge, KeyStoreError> {
        if !self.exists(alias)? {
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

        let document = self.read_document(challenge.alias())?;
        let record = document.to_record()?;
        check_signing_allowed(&record, &challenge, digest)?;

        let signing_key = self.unwrap_signing_key(&document)?;
        sign_payload(&signing_key, digest, payload)
    }

    fn release(&self, challenge_id: Uuid) {
        self.challenges.release(challenge_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_payload;
    use tempfile::TempDir;

    fn fast_kdf() -> KdfParams {
        KdfParams {
            memory_kb: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn open(dir: &Path, secret: &str) -> FileKeyStore {
        FileKeyStore::open(dir, StoreSecret::from_passphrase(secret), fast_kdf()).unwrap()
    }

    #[test]
    fn test_generate_persists_across_reopen() {
        let dir = TempDir::new().unwrap();

        let record = {
            let store = open(dir.path(), "secret");
            store.generate("prefix-device", &KeySpec::default()).unwrap()
        };

        let reopened = open(dir.path(), "secret");
        assert!(reopened.exists("prefix-device").unwrap());
        assert_eq!(reopened.public_key("prefix-device").unwrap(), record.public_key);
        assert_eq!(reopened.record("prefix-device").unwrap().subject, "CN=prefix-device");
    }

    #[test]
    fn test_document_does_not_contain_alias_in_file_name() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path(), "secret");
        store.generate("prefix/../device", &KeySpec::default()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
        assert_eq!(names[0].len(), 64 + ".json".len());
    }

    #[test]
    fn test_generate_existing_alias_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path(), "secret");
        store.generate("alias", &KeySpec::default()).unwrap();

        assert!(matches!(
            store.generate("alias", &KeySpec::default()),
            Err(KeyStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_sign_with_unwrapped_key() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path(), "secret");
        let record = store
            .generate("alias", &KeySpec::default().with_authentication(false))
            .unwrap();

        let challenge = store.begin_signing("alias").unwrap();
        let signature = store.sign(challenge, DigestAlgorithm::Sha256, b"payload").unwrap();

        assert!(verify_payload(
            &record.public_key,
            DigestAlgorithm::Sha256,
            b"payload",
            &signature
        ));
    }

    #[test]
    fn test_wrong_secret_cannot_sign() {
        let dir = TempDir::new().unwrap();
        open(dir.path(), "right")
            .generate("alias", &KeySpec::default().with_authentication(false))
            .unwrap();

        let store = open(dir.path(), "wrong");
        let challenge = store.begin_signing("alias").unwrap();
        let result = store.sign(challenge, DigestAlgorithm::Sha256, b"payload");

        assert!(matches!(result, Err(KeyStoreError::Crypto(_))));
    }

    #[test]
    fn test_delete_removes_document() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path(), "secret");
        store.generate("alias", &KeySpec::default()).unwrap();

        assert!(store.delete("alias").unwrap());
        assert!(!store.exists("alias").unwrap());
        assert!(!store.delete("alias").unwrap());
        assert!(matches!(store.record("alias"), Err(KeyStoreError::NotFound(_))));
    }

    #[test]
    fn test_generated_secret_is_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_SECRET_FILE);

        let first = StoreSecret::load_or_create(&path).unwrap();
        let second = StoreSecret::load_or_create(&path).unwrap();

        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(first.as_bytes().len(), STORE_SECRET_LEN);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_document_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = open(dir.path(), "secret");
        store.generate("alias", &KeySpec::default()).unwrap();

        let mode = fs::metadata(store.key_path("alias"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
