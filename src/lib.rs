//! device-identity - device-bound signing identity
//!
//! An EC P-256 key pair whose private half stays inside a key store and
//! whose every use is gated by a live local authentication check. A remote
//! party holding the public key can then trust that a signature came from
//! this device, with its holder present at signing time.
//!
//! ## Components
//!
//! - **Key Store**: generate, look up and sign with keys by alias
//! - **Identity Key Manager**: alias derivation and idempotent provisioning
//! - **Authentication Gate**: prompt state machine yielding single-use handles
//! - **Signing / Verification**: SHA-256 (or SHA-512) with ECDSA, DER signatures
//! - **Identity Service**: async boundary operations
//! - **Platform Channel**: JSON-lines method dispatcher for host UIs

pub mod auth;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod device;
pub mod identity;
pub mod keystore;
pub mod service;
pub mod signing;
pub mod types;
pub mod verification;

pub use config::{Args, IdentityConfig};
pub use service::IdentityService;
pub use types::{IdentityError, Result};
