//! API routes for guardiand.

use crate::server::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use guardian_common::message::{TOPIC_NEW_ACTION_PLAN, TOPIC_NEW_DIAGNOSIS};
use guardian_common::{ActionPlanRecord, DiagnosticRecord, GuardianError, Message, Priority};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

type AppStateArc = Arc<AppState>;

// ============================================================================
// Health Routes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub guardian_running: bool,
    pub monitoring_thread_active: bool,
    pub cluster_api_available: bool,
}

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    let guardian_running = state.guardian.is_running();
    let monitoring_thread_active = state.guardian.thread_active();
    let cluster_api_available = match &state.cluster {
        Some(cluster) => cluster.is_available().await,
        None => false,
    };

    // Liveness is reported from the actual task state, never cached: a
    // running flag with a dead loop is unhealthy.
    let status = if guardian_running && !monitoring_thread_active {
        "unhealthy"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        guardian_running,
        monitoring_thread_active,
        cluster_api_available,
    })
}

// ============================================================================
// Guardian Lifecycle Routes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardianStatusResponse {
    pub running: bool,
    pub diagnostics_history_size: usize,
    pub action_plans_history_size: usize,
    pub config: crate::config::GuardianConfig,
}

pub fn guardian_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/guardian/start", post(start_guardian))
        .route("/api/guardian/stop", post(stop_guardian))
        .route("/api/guardian/status", get(guardian_status))
}

async fn start_guardian(State(state): State<AppStateArc>) -> Json<MessageResponse> {
    let already = state.guardian.is_running();
    state.guardian.start();
    let message = if already {
        "guardian already running".to_string()
    } else {
        info!("Guardian started via API");
        "guardian started".to_string()
    };
    Json(MessageResponse { message })
}

async fn stop_guardian(State(state): State<AppStateArc>) -> Json<MessageResponse> {
    let was_running = state.guardian.is_running();
    state.guardian.stop().await;
    let message = if was_running {
        info!("Guardian stopped via API");
        "guardian stopped".to_string()
    } else {
        "guardian already stopped".to_string()
    };
    Json(MessageResponse { message })
}

async fn guardian_status(State(state): State<AppStateArc>) -> Json<GuardianStatusResponse> {
    let (diagnostics_history_size, action_plans_history_size) = state.store.history_sizes().await;
    Json(GuardianStatusResponse {
        running: state.guardian.is_running(),
        diagnostics_history_size,
        action_plans_history_size,
        config: state.config.clone(),
    })
}

// ============================================================================
// Event Ingestion Routes
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CreatedResponse {
    pub id: uuid::Uuid,
}

pub fn event_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/event/new_diagnosis", post(new_diagnosis))
        .route("/event/new_action_plan", post(new_action_plan))
}

async fn new_diagnosis(
    State(state): State<AppStateArc>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<CreatedResponse>), (StatusCode, String)> {
    let record: DiagnosticRecord = serde_json::from_value(body.clone())
        .map_err(|e| bad_request(format!("invalid diagnostic: {}", e)))?;
    record
        .validate()
        .map_err(|e| bad_request(e.to_string()))?;

    let id = state
        .store
        .append_diagnostic(record)
        .await
        .map_err(storage_failure)?;

    publish_event(&state, TOPIC_NEW_DIAGNOSIS, body);
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

async fn new_action_plan(
    State(state): State<AppStateArc>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<CreatedResponse>), (StatusCode, String)> {
    let record: ActionPlanRecord = serde_json::from_value(body.clone())
        .map_err(|e| bad_request(format!("invalid action plan: {}", e)))?;

    let id = state
        .store
        .append_action_plan(record)
        .await
        .map_err(storage_failure)?;

    publish_event(&state, TOPIC_NEW_ACTION_PLAN, body);
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

/// Publish an ingested event on the bus. The record is already stored, so
/// a publish failure is logged rather than failing the request.
fn publish_event(state: &AppState, topic: &str, payload: serde_json::Value) {
    let message = Message::new(topic, payload, Priority::Normal, "http");
    if let Err(e) = state.bus.publish(&message) {
        error!("Failed to publish {} event: {}", topic, e);
    }
}

fn bad_request(message: String) -> (StatusCode, String) {
    info!("Rejected event payload: {}", message);
    (StatusCode::BAD_REQUEST, message)
}

fn storage_failure(e: GuardianError) -> (StatusCode, String) {
    error!("Event ingestion failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
