//! Configuration for device-identity
//!
//! CLI arguments and environment variable handling using clap, converted
//! into the library-level [`IdentityConfig`].

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::auth::{GateConfig, PromptInfo};
use crate::crypto::{DigestAlgorithm, KdfParams};
use crate::keystore::KeySpec;

/// Alias prefix used when none is configured
pub const DEFAULT_ALIAS_PREFIX: &str = "device-identity-";

// =============================================================================
// Library Configuration
// =============================================================================

/// Settings of an [`IdentityService`](crate::service::IdentityService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentityConfig {
    /// Prefix used when a request does not name one
    pub alias_prefix: String,
    pub digest: DigestAlgorithm,
    pub key_spec: KeySpec,
    pub gate: GateConfig,
    /// Fail provisioning when the authenticator has nothing enrolled
    pub require_enrollment: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            alias_prefix: DEFAULT_ALIAS_PREFIX.to_string(),
            digest: DigestAlgorithm::Sha256,
            key_spec: KeySpec::default(),
            gate: GateConfig::default(),
            require_enrollment: true,
        }
    }
}

// =============================================================================
// CLI
// =============================================================================

/// How presence is confirmed before signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthMode {
    /// Ask on the controlling terminal
    Console,
    /// Approve every prompt (development only)
    Approve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DigestArg {
    Sha256,
    Sha512,
}

impl From<DigestArg> for DigestAlgorithm {
    fn from(arg: DigestArg) -> Self {
        match arg {
            DigestArg::Sha256 => DigestAlgorithm::Sha256,
            DigestArg::Sha512 => DigestAlgorithm::Sha512,
        }
    }
}

/// device-identity - device-bound, presence-gated ECDSA identity
#[derive(Parser, Debug, Clone)]
#[command(name = "device-identity")]
#[command(about = "Device-bound signing identity gated by local authentication")]
pub struct Args {
    /// Directory holding the key store
    #[arg(long, env = "DEVICE_IDENTITY_STORE_DIR", default_value = ".device-identity")]
    pub store_dir: PathBuf,

    /// Secret protecting stored keys (generated into the store directory if unset)
    #[arg(long, env = "DEVICE_IDENTITY_STORE_SECRET", hide_env_values = true)]
    pub store_secret: Option<String>,

    /// Override the device identifier (defaults to the host machine id)
    #[arg(long, env = "DEVICE_IDENTITY_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Alias prefix; the key alias is prefix followed by device id
    #[arg(long, env = "DEVICE_IDENTITY_ALIAS_PREFIX", default_value = DEFAULT_ALIAS_PREFIX)]
    pub alias_prefix: String,

    /// Payload digest
    #[arg(long, env = "DEVICE_IDENTITY_DIGEST", value_enum, default_value = "sha256")]
    pub digest: DigestArg,

    /// Presence check used before signing
    #[arg(long, env = "DEVICE_IDENTITY_AUTH", value_enum, default_value = "console")]
    pub auth: AuthMode,

    /// Consecutive mismatches before the prompt locks out
    #[arg(long, env = "DEVICE_IDENTITY_MAX_FAILED_ATTEMPTS", default_value = "5")]
    pub max_failed_attempts: u32,

    /// Seconds an authorized signing handle stays valid
    #[arg(long, env = "DEVICE_IDENTITY_HANDLE_TTL_SECS", default_value = "30")]
    pub handle_ttl_secs: u64,

    /// Provision even if the authenticator reports nothing enrolled
    #[arg(long, env = "DEVICE_IDENTITY_ALLOW_UNENROLLED", default_value = "false")]
    pub allow_unenrolled: bool,

    /// Validity of generated key certificates, in days
    #[arg(long, env = "DEVICE_IDENTITY_KEY_VALIDITY_DAYS", default_value = "365")]
    pub key_validity_days: u32,

    /// Argon2 memory cost in KiB for key wrapping
    #[arg(long, env = "DEVICE_IDENTITY_KDF_MEMORY_KB", default_value = "65536")]
    pub kdf_memory_kb: u32,

    /// Argon2 iterations for key wrapping
    #[arg(long, env = "DEVICE_IDENTITY_KDF_ITERATIONS", default_value = "3")]
    pub kdf_iterations: u32,

    /// Argon2 parallelism for key wrapping
    #[arg(long, env = "DEVICE_IDENTITY_KDF_PARALLELISM", default_value = "4")]
    pub kdf_parallelism: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Provision the identity key if absent and print its public key
    Ensure,

    /// Authenticate, then sign a payload and print the hex signature
    Sign {
        #[command(flatten)]
        payload: PayloadArgs,
    },

    /// Verify a hex signature over a payload
    Verify {
        /// Hex encoded signature
        #[arg(long)]
        signature: String,

        #[command(flatten)]
        payload: PayloadArgs,
    },

    /// Print the signature saved by the last successful `sign` run
    Export,

    /// Serve the platform channel as JSON lines over stdin/stdout
    Serve,
}

/// Where the payload bytes come from. Exactly one must be given.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct PayloadArgs {
    /// Read payload from a file
    #[arg(long, conflicts_with_all = ["text", "base64"])]
    pub file: Option<PathBuf>,

    /// Use the UTF-8 bytes of this text
    #[arg(long, conflicts_with = "base64")]
    pub text: Option<String>,

    /// Decode payload from base64
    #[arg(long)]
    pub base64: Option<String>,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_failed_attempts == 0 {
            return Err("MAX_FAILED_ATTEMPTS must be at least 1".to_string());
        }

        if self.handle_ttl_secs == 0 {
            return Err("HANDLE_TTL_SECS must be at least 1".to_string());
        }

        if self.key_validity_days == 0 {
            return Err("KEY_VALIDITY_DAYS must be at least 1".to_string());
        }

        if self.kdf_iterations == 0 || self.kdf_parallelism == 0 {
            return Err("KDF iterations and parallelism must be at least 1".to_string());
        }

        // Argon2 requires at least 8 KiB per lane
        if self.kdf_memory_kb < 8 * self.kdf_parallelism {
            return Err("KDF_MEMORY_KB must be at least 8 * KDF_PARALLELISM".to_string());
        }

        if let Some(secret) = &self.store_secret {
            if secret.is_empty() {
                return Err("STORE_SECRET must not be empty when set".to_string());
            }
        }

        if let Some(device_id) = &self.device_id {
            if device_id.trim().is_empty() {
                return Err("DEVICE_ID must not be empty when set".to_string());
            }
        }

        Ok(())
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kb: self.kdf_memory_kb,
            iterations: self.kdf_iterations,
            parallelism: self.kdf_parallelism,
        }
    }

    pub fn identity_config(&self) -> IdentityConfig {
        IdentityConfig {
            alias_prefix: self.alias_prefix.clone(),
            digest: self.digest.into(),
            key_spec: KeySpec {
                validity_days: self.key_validity_days,
                ..KeySpec::default()
            },
            gate: GateConfig {
                max_failed_attempts: self.max_failed_attempts,
                handle_ttl: Duration::from_secs(self.handle_ttl_secs),
                prompt: PromptInfo::default(),
            },
            require_enrollment: !self.allow_unenrolled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["device-identity"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["ensure"]);
        assert_eq!(args.alias_prefix, DEFAULT_ALIAS_PREFIX);
        assert_eq!(args.auth, AuthMode::Console);
        assert!(args.validate().is_ok());

        let config = args.identity_config();
        assert_eq!(config.gate.max_failed_attempts, 5);
        assert_eq!(config.gate.handle_ttl, Duration::from_secs(30));
        assert_eq!(config.digest, DigestAlgorithm::Sha256);
        assert!(config.require_enrollment);
    }

    #[test]
    fn test_zero_attempts_invalid() {
        let args = parse(&["--max-failed-attempts", "0", "ensure"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_allow_unenrolled() {
        let args = parse(&["--allow-unenrolled", "ensure"]);
        assert!(!args.identity_config().require_enrollment);
    }
}
