//! Watch resources and print every change.
//!
//! Usage:
//!   skein-watch --config skein.toml /redfish/v1/Systems/1 /redfish/v1/Chassis
//!
//! Credentials come from `SKEIN_USER` / `SKEIN_PASSWORD`. Without them a
//! session persisted in `SKEIN_SESSION_FILE` is restored and verified.

use skein_client::{init_tracing, Client, ClientError, ClientResult, FileStorage, MemoryStorage, PollMode};
use skein_core::{ClientConfig, KeyValueStorage};
use std::sync::Arc;

#[tokio::main]
async fn main() -> ClientResult<()> {
    let config = ClientConfig::load().map_err(|e| ClientError::Config(e.to_string()))?;
    init_tracing(&config.log)?;

    let uris = resource_args();
    if uris.is_empty() {
        return Err(ClientError::Config("no resource URIs given".to_string()));
    }

    let storage: Arc<dyn KeyValueStorage> = match std::env::var("SKEIN_SESSION_FILE") {
        Ok(path) => Arc::new(FileStorage::open(path).map_err(|e| ClientError::Config(e.to_string()))?),
        Err(_) => Arc::new(MemoryStorage::new()),
    };
    let client = Client::builder(config).session_storage(storage).build()?;
    client.set_on_session_expired(|| tracing::warn!("Session expired, restart to log in again"));

    match (std::env::var("SKEIN_USER"), std::env::var("SKEIN_PASSWORD")) {
        (Ok(user), Ok(password)) => {
            let outcome = client.login(&user, &password).await?;
            if !outcome.is_success() {
                return Err(ClientError::Http {
                    status: outcome.status,
                });
            }
        }
        _ => {
            if !client.restore_session() || !client.test_restored_session().await {
                return Err(ClientError::AuthExpired);
            }
        }
    }

    let monitor = client.create_monitor(
        uris,
        |bundle| match serde_json::to_string_pretty(&bundle.to_value()) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize bundle: {}", e),
        },
        PollMode::Never,
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");

    client.rm_monitor(&monitor);
    client.shutdown().await;
    Ok(())
}

/// Positional arguments, skipping `--config <path>`.
fn resource_args() -> Vec<String> {
    let mut uris = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            args.next();
        } else {
            uris.push(arg);
        }
    }
    uris
}
