//! device-identity - device-bound signing identity CLI

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use device_identity::{
    auth::{Authenticator, ConsoleAuthenticator, ScriptedAuthenticator},
    channel::PlatformChannel,
    config::{Args, AuthMode, Command, LogFormat, PayloadArgs},
    device::{DeviceIdSource, MachineIdSource, StaticDeviceId},
    keystore::{FileKeyStore, KeyStore, StoreSecret},
    IdentityService,
};

/// Signature of the last `sign` invocation, inside the store directory
const LAST_SIGNATURE_FILE: &str = "last-signature";

/// How long shutdown waits on blocking work such as a pending terminal read
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = runtime.block_on(run());

    // A prompt still reading the terminal must not keep the process alive
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    result
}

async fn run() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    init_tracing(&args);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(2);
    }

    let service = Arc::new(build_service(&args)?);
    let prefix = args.alias_prefix.clone();

    match &args.command {
        Command::Ensure => {
            let report = service.ensure_identity(&prefix).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Sign { payload } => {
            let payload = read_payload(payload).await?;
            let signature = service.authenticate_and_sign(&prefix, payload).await?;
            tokio::fs::write(args.store_dir.join(LAST_SIGNATURE_FILE), &signature)
                .await
                .context("saving last signature")?;
            println!("{}", signature);
        }
        Command::Verify { signature, payload } => {
            let payload = read_payload(payload).await?;
            let valid = service.verify(&prefix, payload, signature).await?;
            println!("{}", valid);
            if !valid {
                std::process::exit(1);
            }
        }
        Command::Export => {
            // A previous `sign` run leaves its signature in the store directory
            let saved = tokio::fs::read_to_string(args.store_dir.join(LAST_SIGNATURE_FILE))
                .await
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let signature = match saved {
                Some(signature) => Some(signature),
                None => service.export_last_signature().await,
            };
            match signature {
                Some(signature) => println!("{}", signature),
                None => std::process::exit(1),
            }
        }
        Command::Serve => {
            info!(alias_prefix = %prefix, "Serving platform channel on stdio");
            PlatformChannel::new(service).run_stdio().await?;
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries results and channel responses.
fn init_tracing(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("device_identity={},info", args.log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn build_service(args: &Args) -> anyhow::Result<IdentityService> {
    let kdf = args.kdf_params();
    let store: Arc<dyn KeyStore> = match &args.store_secret {
        Some(secret) => Arc::new(
            FileKeyStore::open(&args.store_dir, StoreSecret::from_passphrase(secret), kdf)
                .with_context(|| format!("opening key store {}", args.store_dir.display()))?,
        ),
        None => Arc::new(
            FileKeyStore::open_with_generated_secret(&args.store_dir, kdf)
                .with_context(|| format!("opening key store {}", args.store_dir.display()))?,
        ),
    };

    let device: Arc<dyn DeviceIdSource> = match &args.device_id {
        Some(id) => Arc::new(StaticDeviceId::new(id.clone())),
        None => Arc::new(MachineIdSource::new()),
    };

    let authenticator: Arc<dyn Authenticator> = match args.auth {
        AuthMode::Console => Arc::new(ConsoleAuthenticator::new()),
        AuthMode::Approve => {
            info!("Approve mode: every authentication prompt succeeds");
            Arc::new(ScriptedAuthenticator::approving())
        }
    };

    info!(
        store = %store.id(),
        store_dir = %args.store_dir.display(),
        authenticator = %authenticator.id(),
        "Identity service ready"
    );

    Ok(IdentityService::new(
        store,
        device,
        authenticator,
        args.identity_config(),
    ))
}

async fn read_payload(args: &PayloadArgs) -> anyhow::Result<Vec<u8>> {
    match (&args.file, &args.text, &args.base64) {
        (Some(path), _, _) => tokio::fs::read(path)
            .await
            .with_context(|| format!("reading payload {}", path.display())),
        (None, Some(text), _) => Ok(text.as_bytes().to_vec()),
        (None, None, Some(encoded)) => BASE64
            .decode(encoded)
            .map_err(|e| anyhow!("invalid base64 payload: {}", e)),
        (None, None, None) => bail!("one of --file, --text or --base64 is required"),
    }
}
