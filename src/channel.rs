//! Platform Channel
//!
//! Method-call dispatcher in front of the [`IdentityService`], speaking the
//! same method names a host UI uses to reach the native identity code.
//!
//! ## Wire format
//!
//! One JSON object per line in each direction:
//!
//! ```text
//! -> {"method": "requestBiometricAuth", "arguments": {"imageBase64": "aGk="}}
//! <- {"status": "success", "value": "3045022100..."}
//! <- {"status": "error", "code": "auth_canceled", "message": "Authentication canceled"}
//! <- {"status": "not_implemented", "method": "unknownMethod"}
//! ```

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::service::IdentityService;
use crate::types::IdentityError;

/// Channel method names
pub mod methods {
    pub const GET_NATIVE_MESSAGE: &str = "getNativeMessage";
    pub const CHECK_AND_GENERATE_KEY_PAIR: &str = "checkAndGenerateKeyPair";
    pub const REQUEST_BIOMETRIC_AUTH: &str = "requestBiometricAuth";
    pub const VERIFY_SIGNATURE: &str = "verifySignature";
    pub const EXPORT_LAST_SIGNATURE: &str = "exportLastSignature";
    pub const COPY_SIGNED_KEY_TO_CLIPBOARD: &str = "copySignedKeyToClipboard";
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ChannelRequest {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }

    fn string_arg(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelResponse {
    Success { value: Value },
    Error { code: String, message: String },
    NotImplemented { method: String },
}

impl ChannelResponse {
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Success {
            value: value.into(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl From<IdentityError> for ChannelResponse {
    fn from(err: IdentityError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Dispatches channel requests to the identity service.
///
/// Remembers the alias prefix from the last `checkAndGenerateKeyPair` so
/// later calls in the same session can omit it.
pub struct PlatformChannel {
    service: Arc<IdentityService>,
    alias_prefix: RwLock<String>,
}

impl PlatformChannel {
    pub fn new(service: Arc<IdentityService>) -> Self {
        let alias_prefix = service.config().alias_prefix.clone();
        Self {
            service,
            alias_prefix: RwLock::new(alias_prefix),
        }
    }

    pub fn service(&self) -> &Arc<IdentityService> {
        &self.service
    }

    pub async fn alias_prefix(&self) -> String {
        self.alias_prefix.read().await.clone()
    }

    async fn prefix_for(&self, request: &ChannelRequest) -> String {
        match request.string_arg("aliasPrefix") {
            Some(prefix) => prefix.to_string(),
            None => self.alias_prefix().await,
        }
    }

    /// Handle one request.
    pub async fn handle(&self, request: ChannelRequest) -> ChannelResponse {
        debug!(method = %request.method, "Channel request");

        match request.method.as_str() {
            methods::GET_NATIVE_MESSAGE => {
                ChannelResponse::success(format!("Hello from {}!", std::env::consts::OS))
            }
            methods::CHECK_AND_GENERATE_KEY_PAIR => self.check_and_generate(&request).await,
            methods::REQUEST_BIOMETRIC_AUTH => self.request_auth(&request).await,
            methods::VERIFY_SIGNATURE => self.verify_signature(&request).await,
            methods::EXPORT_LAST_SIGNATURE | methods::COPY_SIGNED_KEY_TO_CLIPBOARD => {
                match self.service.export_last_signature().await {
                    Some(signature) => ChannelResponse::success(signature),
                    None => ChannelResponse::success(Value::Null),
                }
            }
            other => {
                warn!(method = %other, "Unknown channel method");
                ChannelResponse::NotImplemented {
                    method: other.to_string(),
                }
            }
        }
    }

    async fn check_and_generate(&self, request: &ChannelRequest) -> ChannelResponse {
        let prefix = self.prefix_for(request).await;
        *self.alias_prefix.write().await = prefix.clone();

        match self.service.ensure_identity(&prefix).await {
            Ok(report) => ChannelResponse::success(json!({
                "deviceId": report.device_id,
                "alias": report.alias,
                "publicKey": report.public_key,
                "created": report.created,
            })),
            Err(e) => e.into(),
        }
    }

    async fn request_auth(&self, request: &ChannelRequest) -> ChannelResponse {
        let payload = match decode_payload(request) {
            Ok(payload) => payload,
            Err(response) => return response,
        };
        let prefix = self.prefix_for(request).await;

        match self.service.authenticate_and_sign(&prefix, payload).await {
            Ok(signature) => ChannelResponse::success(signature),
            Err(e) => e.into(),
        }
    }

    async fn verify_signature(&self, request: &ChannelRequest) -> ChannelResponse {
        let payload = match decode_payload(request) {
            Ok(payload) => payload,
            Err(response) => return response,
        };
        let prefix = self.prefix_for(request).await;
        let signature = request.string_arg("signedKeyInput").unwrap_or_default();

        match self.service.verify(&prefix, payload, signature).await {
            Ok(valid) => ChannelResponse::success(valid),
            Err(e) => e.into(),
        }
    }

    /// Serve JSON lines from `reader`, writing one response line per request.
    ///
    /// Returns when the reader reaches end of input.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut served = 0usize;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<ChannelRequest>(&line) {
                Ok(request) => self.handle(request).await,
                Err(e) => {
                    warn!(error = %e, "Malformed channel request");
                    ChannelResponse::error("invalid_request", e.to_string())
                }
            };

            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
            served += 1;
        }

        info!(served, "Channel input closed");
        Ok(())
    }

    /// Serve over the process's stdin and stdout.
    pub async fn run_stdio(&self) -> std::io::Result<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.run(stdin, tokio::io::stdout()).await
    }
}

/// Payload bytes from the `imageBase64` argument. Missing means empty.
fn decode_payload(request: &ChannelRequest) -> Result<Vec<u8>, ChannelResponse> {
    let encoded = request.string_arg("imageBase64").unwrap_or_default();
    BASE64
        .decode(encoded)
        .map_err(|e| ChannelResponse::error("invalid_payload", format!("imageBase64: {e}")))
}
