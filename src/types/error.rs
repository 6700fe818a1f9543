//! Error types for device identity operations
//!
//! Every failure in the identity core is a typed variant. Callers match on
//! the variant (or on [`IdentityError::code`] at the channel boundary); no
//! failure is ever folded into a success value.

use crate::device::DeviceIdError;
use crate::keystore::KeyStoreError;

/// Main error type for identity operations
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Key store failure while querying or generating the identity key
    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// The user or the system dismissed the authentication prompt
    #[error("Authentication canceled")]
    AuthCanceled,

    /// Too many consecutive recognition mismatches
    #[error("Authentication locked out")]
    AuthLockedOut,

    /// No usable authenticator on this device or account
    #[error("Authentication unavailable: {0}")]
    AuthUnavailable(String),

    /// Recoverable authenticator failure; the caller may request again
    #[error("Authentication error: {message} (code: {code})")]
    AuthError { code: i32, message: String },

    #[error("No payload supplied")]
    NoPayload,

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    /// Signing handle already used, timed out, or its key is gone
    #[error("Signing handle expired")]
    HandleExpired,

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Device identifier unavailable: {0}")]
    DeviceIdUnavailable(String),

    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IdentityError {
    /// Stable snake_case code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProvisioningFailed(_) => "provisioning_failed",
            Self::AuthCanceled => "auth_canceled",
            Self::AuthLockedOut => "auth_locked_out",
            Self::AuthUnavailable(_) => "auth_unavailable",
            Self::AuthError { .. } => "auth_error",
            Self::NoPayload => "no_payload",
            Self::MalformedSignature(_) => "malformed_signature",
            Self::HandleExpired => "handle_expired",
            Self::KeyNotFound(_) => "key_not_found",
            Self::DeviceIdUnavailable(_) => "device_id_unavailable",
            Self::KeyStore(_) => "key_store",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether repeating the same request can reasonably succeed.
    ///
    /// Unavailable authenticators are a capability gap and caller-contract
    /// violations will fail identically, so neither is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProvisioningFailed(_)
                | Self::AuthCanceled
                | Self::AuthLockedOut
                | Self::AuthError { .. }
                | Self::HandleExpired
                | Self::KeyStore(_)
                | Self::Internal(_)
        )
    }
}

impl From<DeviceIdError> for IdentityError {
    fn from(err: DeviceIdError) -> Self {
        Self::DeviceIdUnavailable(err.to_string())
    }
}

impl From<tokio::task::JoinError> for IdentityError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Background task failed: {}", err))
    }
}

/// Result type alias for identity operations
pub type Result<T> = std::result::Result<T, IdentityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = [
            IdentityError::ProvisioningFailed("x".into()),
            IdentityError::AuthCanceled,
            IdentityError::AuthLockedOut,
            IdentityError::AuthUnavailable("x".into()),
            IdentityError::AuthError {
                code: 2,
                message: "x".into(),
            },
            IdentityError::NoPayload,
            IdentityError::MalformedSignature("x".into()),
            IdentityError::HandleExpired,
            IdentityError::KeyNotFound("x".into()),
            IdentityError::DeviceIdUnavailable("x".into()),
            IdentityError::Internal("x".into()),
        ];

        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(IdentityError::AuthCanceled.is_retryable());
        assert!(IdentityError::AuthError {
            code: 3,
            message: "timeout".into()
        }
        .is_retryable());
        assert!(!IdentityError::AuthUnavailable("no biometrics".into()).is_retryable());
        assert!(!IdentityError::NoPayload.is_retryable());
        assert!(!IdentityError::MalformedSignature("odd length".into()).is_retryable());
    }

    #[test]
    fn test_auth_error_display_includes_code() {
        let err = IdentityError::AuthError {
            code: 8,
            message: "Vendor failure".into(),
        };
        assert_eq!(err.to_string(), "Authentication error: Vendor failure (code: 8)");
    }
}
