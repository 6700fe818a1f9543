//! Gate state machine and prompt orchestration

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AuthEvent, AuthEventSender, Authenticator, Availability, AuthorizedSigningHandle,
    CancelSource, PromptInfo,
};
use crate::crypto::DigestAlgorithm;
use crate::keystore::{Challenge, KeyStore, KeyStoreError};
use crate::types::{IdentityError, Result};

/// Default consecutive mismatches before lockout
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;

/// Default validity window of an authorized handle
pub const DEFAULT_HANDLE_TTL: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// State Machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Idle,
    Prompting,
    Authorized,
    Canceled,
    Failed,
    LockedOut,
}

impl GateState {
    /// Terminal states need a fresh request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Authorized | Self::Canceled | Self::Failed | Self::LockedOut
        )
    }
}

/// How one prompt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Authorized,
    Canceled(CancelSource),
    /// Recoverable; the attempt went back to Idle
    Error { code: i32, message: String },
    Failed(String),
    LockedOut,
}

impl AttemptOutcome {
    /// Error the caller sees for a non-success outcome.
    pub fn into_error(self) -> Option<IdentityError> {
        match self {
            Self::Authorized => None,
            Self::Canceled(_) => Some(IdentityError::AuthCanceled),
            Self::Error { code, message } => Some(IdentityError::AuthError { code, message }),
            Self::Failed(reason) => Some(IdentityError::AuthUnavailable(reason)),
            Self::LockedOut => Some(IdentityError::AuthLockedOut),
        }
    }
}

/// Per-request authentication state.
///
/// Pure transition logic; the gate feeds it authenticator events.
#[derive(Debug, Clone)]
pub struct AuthAttempt {
    state: GateState,
    mismatches: u32,
    max_failed_attempts: u32,
}

impl AuthAttempt {
    pub fn new(max_failed_attempts: u32) -> Self {
        Self {
            state: GateState::Idle,
            mismatches: 0,
            max_failed_attempts: max_failed_attempts.max(1),
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn mismatches(&self) -> u32 {
        self.mismatches
    }

    /// Idle -> Prompting. Returns false from any other state.
    pub fn start(&mut self) -> bool {
        if self.state != GateState::Idle {
            return false;
        }
        self.state = GateState::Prompting;
        true
    }

    /// Apply one event. Returns the outcome once the prompt is over.
    ///
    /// Events outside Prompting are ignored.
    pub fn apply(&mut self, event: AuthEvent) -> Option<AttemptOutcome> {
        if self.state != GateState::Prompting {
            return None;
        }

        match event {
            AuthEvent::Succeeded => {
                self.state = GateState::Authorized;
                Some(AttemptOutcome::Authorized)
            }
            AuthEvent::Mismatch => {
                self.mismatches += 1;
                if self.mismatches >= self.max_failed_attempts {
                    self.state = GateState::LockedOut;
                    Some(AttemptOutcome::LockedOut)
                } else {
                    None
                }
            }
            AuthEvent::Canceled(source) => {
                self.state = GateState::Canceled;
                Some(AttemptOutcome::Canceled(source))
            }
            AuthEvent::LockedOut => {
                self.state = GateState::LockedOut;
                Some(AttemptOutcome::LockedOut)
            }
            AuthEvent::Unavailable(reason) => {
                self.state = GateState::Failed;
                Some(AttemptOutcome::Failed(reason))
            }
            AuthEvent::Error { code, message } => {
                self.state = GateState::Idle;
                Some(AttemptOutcome::Error { code, message })
            }
        }
    }
}

// =============================================================================
// Gate
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GateConfig {
    pub max_failed_attempts: u32,
    #[serde(with = "duration_secs")]
    pub handle_ttl: Duration,
    pub prompt: PromptInfo,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            handle_ttl: DEFAULT_HANDLE_TTL,
            prompt: PromptInfo::default(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Runs authentication requests against one key store.
pub struct AuthenticationGate {
    store: Arc<dyn KeyStore>,
    authenticator: Arc<dyn Authenticator>,
    config: GateConfig,
}

impl AuthenticationGate {
    pub fn new(
        store: Arc<dyn KeyStore>,
        authenticator: Arc<dyn Authenticator>,
        config: GateConfig,
    ) -> Self {
        Self {
            store,
            authenticator,
            config,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn availability(&self) -> Availability {
        self.authenticator.availability()
    }

    /// Start a request: check availability, bind a challenge to `alias`
    /// and put the prompt up.
    pub async fn begin(&self, alias: &str, digest: DigestAlgorithm) -> Result<AuthSession> {
        let availability = self.availability();
        if !availability.is_available() {
            warn!(
                alias = %alias,
                authenticator = %self.authenticator.id(),
                reason = availability.reason(),
                "Authenticator unavailable"
            );
            return Err(IdentityError::AuthUnavailable(availability.reason().to_string()));
        }

        // The guard is built on the blocking thread so a dropped `begin`
        // still releases the challenge once the task finishes
        let store = Arc::clone(&self.store);
        let owned_alias = alias.to_string();
        let challenge =
            tokio::task::spawn_blocking(move || ChallengeGuard::issue(store, &owned_alias))
                .await?
                .map_err(|e| match e {
                    KeyStoreError::NotFound(alias) => IdentityError::KeyNotFound(alias),
                    other => IdentityError::KeyStore(other),
                })?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cancel, canceled) = watch::channel(false);

        let mut attempt = AuthAttempt::new(self.config.max_failed_attempts);
        attempt.start();

        let authenticator = Arc::clone(&self.authenticator);
        let mut prompt = self.config.prompt.clone();
        prompt.max_failed_attempts = attempt.max_failed_attempts;
        let events = AuthEventSender::new(tx);
        let prompt_task = tokio::spawn(async move {
            authenticator.prompt(&prompt, events).await;
        });

        debug!(alias = %alias, challenge = ?challenge.id(), "Authentication prompt started");

        Ok(AuthSession {
            alias: alias.to_string(),
            digest,
            challenge,
            events: rx,
            cancel: Arc::new(cancel),
            canceled,
            attempt,
            prompt_task,
            handle_ttl: self.config.handle_ttl,
        })
    }

    /// Run a full request and wait for its outcome.
    pub async fn authenticate(
        &self,
        alias: &str,
        digest: DigestAlgorithm,
    ) -> Result<AuthorizedSigningHandle> {
        self.begin(alias, digest).await?.wait().await
    }
}

// =============================================================================
// Session
// =============================================================================

/// Issued challenge that goes back to the store unless taken.
struct ChallengeGuard {
    challenge: Option<Challenge>,
    store: Arc<dyn KeyStore>,
}

impl ChallengeGuard {
    fn issue(store: Arc<dyn KeyStore>, alias: &str) -> std::result::Result<Self, KeyStoreError> {
        let challenge = store.begin_signing(alias)?;
        Ok(Self {
            challenge: Some(challenge),
            store,
        })
    }

    fn id(&self) -> Option<Uuid> {
        self.challenge.as_ref().map(Challenge::id)
    }

    fn take(&mut self) -> Option<Challenge> {
        self.challenge.take()
    }
}

impl Drop for ChallengeGuard {
    fn drop(&mut self) {
        if let Some(challenge) = self.challenge.take() {
            self.store.release(challenge.id());
        }
    }
}

/// Withdraws a pending request from outside the awaiting task.
#[derive(Debug, Clone)]
pub struct AuthCanceller(Arc<watch::Sender<bool>>);

impl AuthCanceller {
    /// Returns false if the request already finished.
    pub fn cancel(&self) -> bool {
        self.0.send(true).is_ok()
    }
}

/// One in-flight authentication request.
///
/// Dropping it stops the prompt and releases the challenge.
pub struct AuthSession {
    alias: String,
    digest: DigestAlgorithm,
    challenge: ChallengeGuard,
    events: mpsc::Receiver<AuthEvent>,
    cancel: Arc<watch::Sender<bool>>,
    canceled: watch::Receiver<bool>,
    attempt: AuthAttempt,
    prompt_task: JoinHandle<()>,
    handle_ttl: Duration,
}

impl AuthSession {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn state(&self) -> GateState {
        self.attempt.state()
    }

    pub fn canceller(&self) -> AuthCanceller {
        AuthCanceller(self.cancel.clone())
    }

    /// Wait for the prompt to end.
    pub async fn wait(mut self) -> Result<AuthorizedSigningHandle> {
        let outcome = loop {
            // A withdrawal wins over events still queued behind it
            let event = tokio::select! {
                biased;
                _ = self.canceled.changed() => AuthEvent::Canceled(CancelSource::Caller),
                // Authenticator gone without a verdict
                event = self.events.recv() => {
                    event.unwrap_or(AuthEvent::Canceled(CancelSource::System))
                }
            };

            if event == AuthEvent::Mismatch {
                debug!(
                    alias = %self.alias,
                    mismatches = self.attempt.mismatches() + 1,
                    "Credential not recognized"
                );
            }

            if let Some(outcome) = self.attempt.apply(event) {
                break outcome;
            }
        };

        match outcome.into_error() {
            None => {
                let mut challenge = self.challenge.take().ok_or(IdentityError::HandleExpired)?;
                challenge.authorize();
                info!(alias = %self.alias, "Authentication succeeded");
                Ok(AuthorizedSigningHandle::new(
                    challenge,
                    self.digest,
                    Arc::clone(&self.challenge.store),
                    self.handle_ttl,
                ))
            }
            Some(err) => {
                info!(
                    alias = %self.alias,
                    error = %err,
                    state = ?self.attempt.state(),
                    "Authentication did not succeed"
                );
                Err(err)
            }
        }
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.prompt_task.abort();
    }
}
