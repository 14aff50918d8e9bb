//! HTTP server for guardiand.

use crate::bus::EventBus;
use crate::cluster::ClusterClient;
use crate::config::GuardianConfig;
use crate::guardian::GuardianMonitor;
use crate::routes;
use crate::store::StateStore;
use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub config: GuardianConfig,
    pub store: Arc<StateStore>,
    pub bus: Arc<EventBus>,
    pub guardian: Arc<GuardianMonitor>,
    pub cluster: Option<Arc<ClusterClient>>,
}

impl AppState {
    pub fn new(
        config: GuardianConfig,
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        guardian: Arc<GuardianMonitor>,
        cluster: Option<Arc<ClusterClient>>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            guardian,
            cluster,
        }
    }
}

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::guardian_routes())
        .merge(routes::event_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until it fails or the process is told to stop.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.bind_addr.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
