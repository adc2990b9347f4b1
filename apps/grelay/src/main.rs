use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use grelay_accounts::{store, AccountPool, HttpTokenRefresher};
use grelay_core::config::RelayConfig;
use grelay_core::upstream::{UpstreamClient, WreqUpstreamClient};
use grelay_core::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env()?;
    if config.uses_default_password() {
        warn!(
            "GEMINI_AUTH_PASSWORD is still the default; set a real secret for anything \
             beyond local experiments"
        );
    }

    let mut accounts = store::load_dir(&config.accounts_dir);
    if accounts.is_empty() {
        if let Some(raw) = config.inline_credentials.as_deref() {
            match store::load_env_json(raw) {
                Ok(account) => accounts.push(account),
                Err(err) => warn!(error = %err, "GEMINI_CREDENTIALS did not parse"),
            }
        }
    }
    if accounts.is_empty() && config.legacy_credential_file.exists() {
        match store::load_file(&config.legacy_credential_file) {
            Ok(account) => {
                info!(file = %config.legacy_credential_file.display(), "loaded legacy credentials");
                accounts.push(account);
            }
            Err(err) => warn!(error = %err, "legacy credential file did not parse"),
        }
    }
    if accounts.is_empty() {
        warn!(
            dir = %config.accounts_dir.display(),
            oauth_callback_port = config.oauth_callback_port,
            "no accounts loaded; enrol accounts before sending traffic"
        );
    } else {
        info!(accounts = accounts.len(), "credential pool loaded");
    }

    let refresher = Arc::new(HttpTokenRefresher::new()?);
    let pool = Arc::new(AccountPool::with_accounts(refresher, accounts));
    let client: Arc<dyn UpstreamClient> = Arc::new(WreqUpstreamClient::new()?);
    let pipeline = Arc::new(Pipeline::new(
        pool,
        client,
        config.google_cloud_project.clone(),
    ));

    let app = grelay_router::router(grelay_router::AppState {
        pipeline,
        auth_password: config.auth_password.clone(),
    });

    let bind = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
