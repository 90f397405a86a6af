//! Identity service entry point: loads settings, composes storage and
//! the token service, then waits for shutdown.

use std::time::Duration;

use anyhow::Context;
use identity_common::{init_tracing, TracingConfig};
use identity_service::storage::StorageCategory;
use identity_service::{Composition, DatabaseComposer, PartialComposer, ServerSettings};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&TracingConfig::default().with_json_output());

    info!("Starting Identity Service");

    let settings = ServerSettings::from_env().context("invalid configuration")?;
    let composition = compose(&settings).await.context("startup failed")?;

    info!(
        issuer = %composition.token_service().issuer(),
        algorithm = ?composition.token_service().public_key().algorithm(),
        "Identity Service ready"
    );

    let mut cleanup = tokio::time::interval(settings.cleanup_interval.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = cleanup.tick() => purge(&composition).await,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Identity Service stopped");
    Ok(())
}

/// One backend for everything unless categories were configured apart.
async fn compose(settings: &ServerSettings) -> identity_service::IdentityResult<Composition> {
    let uniform = StorageCategory::ALL
        .iter()
        .all(|&category| settings.storage.get(category).db_type == settings.database.db_type);

    if uniform {
        DatabaseComposer::new(settings.clone()).compose().await
    } else {
        PartialComposer::new(&settings.storage)
            .with_configured_backends(&settings.storage, settings.storage_timeout)
            .compose(settings)
            .await
    }
}

async fn purge(composition: &Composition) {
    let now = chrono::Utc::now().timestamp();
    match composition.token_storage().purge_expired(now).await {
        Ok(0) => {}
        Ok(purged) => info!(purged, "Purged expired refresh tokens"),
        Err(err) => error!(error = %err, "Refresh token purge failed"),
    }
}
