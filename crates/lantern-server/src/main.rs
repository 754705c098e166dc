mod broadcaster;
mod config;
mod error;
mod instance;
mod orchestrator;
mod provider;
mod provider_clients;
mod routes;

use std::sync::Arc;

use tracing::{error, info};

use crate::broadcaster::StatusBroadcaster;
use crate::config::ServerConfig;
use crate::instance::InstanceRegistry;
use crate::orchestrator::LifecycleOrchestrator;
use crate::routes::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let provider = provider::adapter_from_env(&config.lifecycle)?;

    let broadcaster = Arc::new(StatusBroadcaster::new(config.subscriber_queue_capacity));
    let registry = Arc::new(InstanceRegistry::new(broadcaster.clone()));
    let orchestrator = LifecycleOrchestrator::new(registry, provider, config.lifecycle.clone());

    info!(
        idle_after_min = config.idle_after_min(),
        provision_timeout_secs = config.lifecycle.provision_timeout.as_secs(),
        teardown_max_attempts = config.lifecycle.teardown_max_attempts,
        "lifecycle configured"
    );

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let shutdown_grace = config.shutdown_grace;
    let state = AppState::new(config, orchestrator.clone());

    let server = axum::Server::bind(&addr).serve(router(state).into_make_service());

    info!("Webserver running on http://{addr}");

    let graceful = server.with_graceful_shutdown(async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to create Ctrl+C shutdown signal");
        info!("shutdown signal received; draining connections");
    });

    if let Err(e) = graceful.await {
        error!("Shutdown error: {e}");
    }

    let still_held = orchestrator.shutdown(shutdown_grace).await;
    if still_held > 0 {
        error!(still_held, "exiting with instances that may still be billed");
    }
    info!(
        dropped_status_events = broadcaster.total_dropped(),
        "lantern-server stopped"
    );

    Ok(())
}
