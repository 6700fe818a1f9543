//! Cryptographic primitives for the device identity key.
//!
//! # Algorithms
//!
//! - **Identity Key**: ECDSA over NIST P-256
//! - **Signature Digest**: SHA-256 (default) or SHA-512, i.e. `SHA256withECDSA`
//! - **Signature Encoding**: ASN.1 DER
//! - **Public Key Encoding**: DER SubjectPublicKeyInfo
//! - **Key-at-rest Derivation**: Argon2id
//! - **Key-at-rest Encryption**: ChaCha20-Poly1305

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::keystore::KeyStoreError;

// =============================================================================
// Constants
// =============================================================================

/// Argon2id memory cost in KiB (64 MB)
pub const ARGON2_MEMORY_KB: u32 = 65536;

/// Argon2id iteration count
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id parallelism (threads)
pub const ARGON2_PARALLELISM: u32 = 4;

/// Salt length for key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// P-256 private scalar length (32 bytes)
pub const PRIVATE_KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

// =============================================================================
// Algorithms
// =============================================================================

/// Asymmetric algorithm of the identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    EcP256,
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EcP256 => write!(f, "EC P-256"),
        }
    }
}

/// Digest applied to the payload before ECDSA signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Hash the payload.
    pub fn digest(&self, payload: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(payload).to_vec(),
            Self::Sha512 => Sha512::digest(payload).to_vec(),
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha256 => write!(f, "SHA-256"),
            Self::Sha512 => write!(f, "SHA-512"),
        }
    }
}

// =============================================================================
// Public Key
// =============================================================================

/// Public half of an identity key, with its DER encoding precomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
    der: Vec<u8>,
}

impl PublicKey {
    pub fn from_verifying_key(key: VerifyingKey) -> Result<Self, KeyStoreError> {
        let der = key
            .to_public_key_der()
            .map_err(|e| KeyStoreError::Crypto(format!("Public key encoding failed: {e}")))?
            .as_bytes()
            .to_vec();
        Ok(Self { key, der })
    }

    /// Parse a DER SubjectPublicKeyInfo.
    pub fn from_der(der: &[u8]) -> Result<Self, KeyStoreError> {
        let key = VerifyingKey::from_public_key_der(der)
            .map_err(|e| KeyStoreError::Crypto(format!("Invalid public key: {e}")))?;
        Ok(Self {
            key,
            der: der.to_vec(),
        })
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyStoreError> {
        let der = BASE64
            .decode(encoded)
            .map_err(|e| KeyStoreError::Crypto(format!("Invalid public key encoding: {e}")))?;
        Self::from_der(&der)
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    /// Base64 (standard, no wrapping) of the DER encoding.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.der)
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.key
    }
}

// =============================================================================
// Key Generation
// =============================================================================

/// Generate a new P-256 signing keypair.
///
/// Uses the OS cryptographically secure random number generator.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::random(&mut OsRng);
    let verifying_key = VerifyingKey::from(&signing_key);
    (signing_key, verifying_key)
}

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Argon2id cost parameters for wrapping stored private keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kb: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kb: ARGON2_MEMORY_KB,
            iterations: ARGON2_ITERATIONS,
            parallelism: ARGON2_PARALLELISM,
        }
    }
}

/// Derive a 256-bit key encryption key from the store secret using Argon2id.
///
/// The salt is random per stored key, so every key file gets its own KEK.
pub fn derive_key_encryption_key(
    secret: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<[u8; 32], KeyStoreError> {
    let params = Params::new(
        params.memory_kb,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| KeyStoreError::Crypto(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret, salt, &mut key)
        .map_err(|e| KeyStoreError::Crypto(format!("Key derivation failed: {e}")))?;

    Ok(key)
}

// =============================================================================
// Encryption / Decryption
// =============================================================================

/// Encrypt a private scalar using ChaCha20-Poly1305.
///
/// Returns 48 bytes: 32 bytes encrypted key + 16 bytes auth tag.
/// The nonce must never be reused with the same key.
pub fn encrypt_private_key(
    private_key: &[u8; PRIVATE_KEY_LEN],
    encryption_key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>, KeyStoreError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(encryption_key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), private_key.as_slice())
        .map_err(|e| KeyStoreError::Crypto(format!("Encryption failed: {e}")))?;

    Ok(ciphertext)
}

/// Decrypt a private scalar using ChaCha20-Poly1305.
///
/// Fails if the ciphertext was tampered with or the store secret is wrong.
pub fn decrypt_private_key(
    ciphertext: &[u8],
    encryption_key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
) -> Result<[u8; PRIVATE_KEY_LEN], KeyStoreError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(encryption_key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| KeyStoreError::Crypto("Failed to decrypt key (wrong store secret?)".into()))?;

    if plaintext.len() != PRIVATE_KEY_LEN {
        return Err(KeyStoreError::Crypto(format!(
            "Invalid decrypted key length: expected {}, got {}",
            PRIVATE_KEY_LEN,
            plaintext.len()
        )));
    }

    let mut key = [0u8; PRIVATE_KEY_LEN];
    key.copy_from_slice(&plaintext);
    Ok(key)
}

// =============================================================================
// Signing / Verification
// =============================================================================

/// Digest the payload and sign it, returning a DER encoded signature.
pub fn sign_payload(
    signing_key: &SigningKey,
    digest: DigestAlgorithm,
    payload: &[u8],
) -> Result<Vec<u8>, KeyStoreError> {
    let prehash = digest.digest(payload);
    let signature: Signature = signing_key
        .sign_prehash(&prehash)
        .map_err(|e| KeyStoreError::Crypto(format!("Signing failed: {e}")))?;
    Ok(signature.to_der().as_bytes().to_vec())
}

/// Check a signature over the payload.
///
/// Accepts DER or fixed-width (r || s) encodings. Bytes that decode as
/// neither are a non-matching signature, not an error.
pub fn verify_payload(
    public_key: &PublicKey,
    digest: DigestAlgorithm,
    payload: &[u8],
    signature: &[u8],
) -> bool {
    let parsed = Signature::from_der(signature).or_else(|_| Signature::from_slice(signature));
    let Ok(signature) = parsed else {
        return false;
    };

    let prehash = digest.digest(payload);
    public_key
        .verifying_key()
        .verify_prehash(&prehash, &signature)
        .is_ok()
}

// =============================================================================
// Tests
// =============================================================================
