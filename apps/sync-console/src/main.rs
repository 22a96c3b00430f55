mod bridge;
mod config;
mod logging;

use std::{process::ExitCode, sync::Arc};

use config::ConsoleConfig;
use sync_platform::{CredentialError, CredentialSource, StaticCredential};
use sync_socket::{HttpChatApi, spawn_runtime};
use tracing::{error, info};

#[cfg(feature = "os-keyring")]
const KEYRING_SERVICE: &str = "sync-console";

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting sync-console");

    let config = match ConsoleConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let credentials = match credential_source(&config) {
        Ok(credentials) => credentials,
        Err(err) => {
            error!(error = %err, "credential setup failed");
            return ExitCode::FAILURE;
        }
    };

    let api = match HttpChatApi::new(config.api_url.clone(), Arc::clone(&credentials)) {
        Ok(api) => api,
        Err(err) => {
            error!(code = %err.code, error = %err, "cannot build API client");
            return ExitCode::FAILURE;
        }
    };

    info!(
        api_url = %config.api_url,
        socket_url = %config.socket_url,
        live_sync = config.token.is_some() || config.keyring_account.is_some(),
        "spawning sync runtime"
    );
    let handle = spawn_runtime(
        config.sync.clone(),
        config.socket_url.clone(),
        Arc::new(api),
        credentials,
    );

    match bridge::run(handle).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "stdin bridge failed");
            ExitCode::FAILURE
        }
    }
}

/// Token from the environment, or from the OS keyring when built with `os-keyring`.
///
/// A token given in the environment is also saved under the keyring account.
fn credential_source(config: &ConsoleConfig) -> Result<Arc<dyn CredentialSource>, CredentialError> {
    #[cfg(feature = "os-keyring")]
    if let Some(account) = &config.keyring_account {
        let stored = sync_platform::StoredCredential::new(
            sync_platform::OsKeyringCredentialStore,
            KEYRING_SERVICE,
            account.as_str(),
        );
        if let Some(token) = &config.token {
            stored.store(token)?;
        }
        return Ok(Arc::new(stored));
    }

    #[cfg(not(feature = "os-keyring"))]
    if config.keyring_account.is_some() {
        tracing::warn!("SYNC_KEYRING_ACCOUNT ignored; built without os-keyring support");
    }

    let credential = match &config.token {
        Some(token) => StaticCredential::new(token.as_str()),
        None => StaticCredential::none(),
    };
    Ok(Arc::new(credential))
}
