//! Guardian daemon - self-healing control plane supervisor.
//!
//! Watches the health, diagnostic coherence, and decision stability of the
//! cooperating services and intervenes, up to forcing an emergency
//! scale-down, when a safety threshold is violated.

use anyhow::{Context, Result};
use guardiand::bus::EventBus;
use guardiand::cluster::ClusterClient;
use guardiand::collaborators::CollaboratorClient;
use guardiand::config::GuardianConfig;
use guardiand::escalator::EmergencyEscalator;
use guardiand::guardian::GuardianMonitor;
use guardiand::orchestrator::Orchestrator;
use guardiand::server::{self, AppState};
use guardiand::store::persist::{CacheMirror, FileMirror};
use guardiand::store::StateStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Guardian daemon v{} starting", env!("CARGO_PKG_VERSION"));

    // Configuration errors are fatal: never run with undefined thresholds.
    let config = GuardianConfig::load().context("invalid configuration")?;

    let mirror: Arc<dyn CacheMirror> = Arc::new(FileMirror::new(config.state_dir.join("cache")));
    let store = Arc::new(
        StateStore::open(&config, Some(mirror))
            .await
            .context("opening state store")?,
    );

    let bus = Arc::new(EventBus::new());
    let collaborators = Arc::new(CollaboratorClient::new(&config)?);

    let cluster = match &config.cluster_api_url {
        Some(url) => Some(Arc::new(ClusterClient::new(
            url.clone(),
            config.cluster_api_token.clone(),
            config.http_timeout(),
        )?)),
        None => None,
    };

    let escalator = Arc::new(EmergencyEscalator::new(
        &config,
        Arc::clone(&store),
        cluster.clone(),
    )?);
    let guardian = Arc::new(GuardianMonitor::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&collaborators),
        escalator,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&collaborators),
    ));

    orchestrator.attach_bus(&bus).await;
    bus.start();
    guardian.start();
    orchestrator.start();

    let state = Arc::new(AppState::new(
        config,
        store,
        Arc::clone(&bus),
        Arc::clone(&guardian),
        cluster,
    ));

    tokio::select! {
        result = server::run(state) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    guardian.stop().await;
    orchestrator.stop().await;
    bus.stop().await;
    info!("Shutting down gracefully");

    Ok(())
}
