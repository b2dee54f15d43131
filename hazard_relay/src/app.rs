use crate::caption::{BackendRoutes, CaptionService};
use crate::config::{Config, ConfigurationError};
use crate::prompt::PromptStore;
use crate::server::RelayServer;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

/// Loads prompts and constructs the configured providers. Runs once before
/// the listener is bound so a bad configuration never reaches a serving state.
pub fn initialize(config: &Config) -> Result<Arc<CaptionService>, ConfigurationError> {
    let prompts = PromptStore::load(&config.prompts)?;
    let routes = BackendRoutes::from_config(config)?;
    tracing::info!(
        describe_backend = routes.describe.name(),
        hazard_backend = routes.hazard.name(),
        "Inference routes ready"
    );

    Ok(Arc::new(CaptionService::new(Arc::new(prompts), routes)))
}

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let caption_service = match initialize(&config) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to initialize relay: {}", e);
            return Err(Box::new(e));
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let server = RelayServer::new(caption_service, &config.server, shutdown_tx.clone()).await?;
    let connections = server.connections();

    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    if !connections
        .wait_idle(config.server.get_shutdown_grace())
        .await
    {
        tracing::warn!(
            "Abandoning {} connection(s) still open after the grace period",
            connections.active()
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
