//! Authentication Gate
//!
//! Local presence / biometric check in front of every private-key use.
//!
//! An [`Authenticator`] drives the actual prompt and reports what happens
//! as [`AuthEvent`]s over a channel. The [`AuthenticationGate`] folds those
//! events into exactly one outcome per request and, only on success, hands
//! out an [`AuthorizedSigningHandle`] good for a single signature.
//!
//! ```text
//! Idle -> Prompting -> Authorized
//!                   -> Canceled     (user, system or caller)
//!                   -> Idle         (recoverable error)
//!                   -> Failed       (no usable authenticator)
//!                   -> LockedOut    (N consecutive mismatches)
//! ```

pub mod console;
pub mod gate;
pub mod handle;
pub mod scripted;

pub use console::ConsoleAuthenticator;
pub use gate::{
    AttemptOutcome, AuthAttempt, AuthCanceller, AuthSession, AuthenticationGate, GateConfig,
    GateState,
};
pub use handle::AuthorizedSigningHandle;
pub use scripted::ScriptedAuthenticator;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// =============================================================================
// Platform Error Codes
// =============================================================================

/// Raw authenticator error codes, numbered as the mobile biometric API does.
pub mod codes {
    pub const HW_UNAVAILABLE: i32 = 1;
    pub const UNABLE_TO_PROCESS: i32 = 2;
    pub const TIMEOUT: i32 = 3;
    pub const NO_SPACE: i32 = 4;
    pub const CANCELED: i32 = 5;
    pub const LOCKOUT: i32 = 7;
    pub const VENDOR: i32 = 8;
    pub const LOCKOUT_PERMANENT: i32 = 9;
    pub const USER_CANCELED: i32 = 10;
    pub const NO_BIOMETRICS: i32 = 11;
    pub const HW_NOT_PRESENT: i32 = 12;
    pub const NEGATIVE_BUTTON: i32 = 13;
    pub const NO_DEVICE_CREDENTIAL: i32 = 14;
    pub const SECURITY_UPDATE_REQUIRED: i32 = 15;
}

// =============================================================================
// Events
// =============================================================================

/// Who dismissed the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSource {
    User,
    System,
    NegativeButton,
    /// The requesting code withdrew the request
    Caller,
}

/// One thing the authenticator observed while prompting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    Succeeded,
    /// Credential presented but not recognized; the prompt stays up
    Mismatch,
    Canceled(CancelSource),
    LockedOut,
    Unavailable(String),
    /// Recoverable failure
    Error { code: i32, message: String },
}

impl AuthEvent {
    /// Classify a raw platform error code.
    pub fn from_platform_error(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            codes::CANCELED => Self::Canceled(CancelSource::System),
            codes::USER_CANCELED => Self::Canceled(CancelSource::User),
            codes::NEGATIVE_BUTTON => Self::Canceled(CancelSource::NegativeButton),
            codes::LOCKOUT | codes::LOCKOUT_PERMANENT => Self::LockedOut,
            codes::NO_BIOMETRICS
            | codes::HW_NOT_PRESENT
            | codes::NO_DEVICE_CREDENTIAL
            | codes::SECURITY_UPDATE_REQUIRED => Self::Unavailable(message),
            _ => Self::Error { code, message },
        }
    }
}

/// Sending half handed to an authenticator for one prompt.
#[derive(Debug, Clone)]
pub struct AuthEventSender(mpsc::Sender<AuthEvent>);

impl AuthEventSender {
    pub(crate) fn new(tx: mpsc::Sender<AuthEvent>) -> Self {
        Self(tx)
    }

    /// Report an event. Returns false once the gate stopped listening.
    pub async fn send(&self, event: AuthEvent) -> bool {
        self.0.send(event).await.is_ok()
    }

    /// Report from a blocking thread.
    pub fn blocking_send(&self, event: AuthEvent) -> bool {
        self.0.blocking_send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Resolves when the gate stops listening.
    pub async fn closed(&self) {
        self.0.closed().await
    }
}

// =============================================================================
// Authenticator
// =============================================================================

/// Whether the authenticator can prompt at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    NoHardware,
    HardwareUnavailable,
    NoneEnrolled,
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::NoHardware => "no authentication hardware on this device",
            Self::HardwareUnavailable => "authentication hardware currently unavailable",
            Self::NoneEnrolled => "no credential enrolled",
        }
    }
}

/// Text shown on the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptInfo {
    pub title: String,
    pub subtitle: String,
    pub negative_button: String,
    /// Mismatches the gate accepts before locking out. Set by the gate for
    /// each request; an authenticator stops prompting once it is used up.
    #[serde(skip)]
    pub max_failed_attempts: u32,
}

impl Default for PromptInfo {
    fn default() -> Self {
        Self {
            title: "Biometric Authentication".to_string(),
            subtitle: "Authenticate using your biometric credential".to_string(),
            negative_button: "Cancel".to_string(),
            max_failed_attempts: gate::DEFAULT_MAX_FAILED_ATTEMPTS,
        }
    }
}

/// A local user-presence check.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    /// Backend identifier for logs
    fn id(&self) -> &str;

    /// Cheap capability probe; must not prompt.
    fn availability(&self) -> Availability;

    /// Show the prompt and report events until a terminal one is sent or
    /// the gate stops listening. Returning without a terminal event counts
    /// as a system cancel.
    async fn prompt(&self, info: &PromptInfo, events: AuthEventSender);
}
