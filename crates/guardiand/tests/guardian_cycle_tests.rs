//! Guardian cycle tests against local history fallback.
//!
//! The collaborators point at closed ports, so every cycle falls back to
//! the state store. Escalations land on an in-process capture server.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::Router;
use guardian_common::{
    ActionPlanPatch, ActionPlanRecord, DiagnosticRecord, ExecutionStatus,
};
use guardiand::cluster::ClusterClient;
use guardiand::collaborators::CollaboratorClient;
use guardiand::config::GuardianConfig;
use guardiand::escalator::EmergencyEscalator;
use guardiand::guardian::{
    GuardianMonitor, CONDITION_DECISION_INSTABILITY, CONDITION_DIAGNOSTIC_INCOHERENCE,
};
use guardiand::store::StateStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
struct Capture {
    hits: Arc<Mutex<Vec<String>>>,
}

async fn capture_handler(State(capture): State<Capture>, request: Request<Body>) -> StatusCode {
    capture
        .hits
        .lock()
        .unwrap()
        .push(format!("{} {}", request.method(), request.uri().path()));
    StatusCode::OK
}

async fn spawn_capture_server() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let hits = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .fallback(capture_handler)
        .with_state(Capture {
            hits: Arc::clone(&hits),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

async fn fixture(addr: SocketAddr) -> (Arc<GuardianMonitor>, Arc<StateStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GuardianConfig::default();
    config.state_dir = dir.path().to_path_buf();
    config.check_interval_seconds = 1;
    config.collaborator_retries = 1;
    config.diagnostico_url = "http://127.0.0.1:1".to_string();
    config.acao_url = "http://127.0.0.1:1".to_string();
    config.monitoramento_url = "http://127.0.0.1:1".to_string();
    config.alert_webhook_url = Some(format!("http://{}/hook", addr));
    config.cluster_api_url = Some(format!("http://{}", addr));
    config.emergency_target_workloads = vec!["monitoramento".to_string()];
    config.http_timeout_seconds = 2;

    let store = Arc::new(StateStore::open(&config, None).await.unwrap());
    let collaborators = Arc::new(CollaboratorClient::new(&config).unwrap());
    let cluster = Arc::new(
        ClusterClient::new(
            config.cluster_api_url.clone().unwrap(),
            None,
            Duration::from_secs(2),
        )
        .unwrap(),
    );
    let escalator = Arc::new(
        EmergencyEscalator::new(&config, Arc::clone(&store), Some(cluster)).unwrap(),
    );
    let guardian = Arc::new(GuardianMonitor::new(
        config,
        Arc::clone(&store),
        collaborators,
        escalator,
    ));
    (guardian, store, dir)
}

async fn seed_incoherent_diagnostics(store: &StateStore) {
    // 8 low-confidence out of 10: ratio 0.8 against the default 0.7.
    for _ in 0..8 {
        store
            .append_diagnostic(DiagnosticRecord::new(vec![], 0.1))
            .await
            .unwrap();
    }
    for _ in 0..2 {
        store
            .append_diagnostic(DiagnosticRecord::new(vec![], 0.9))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_incoherent_local_history_triggers_escalation() {
    let (addr, hits) = spawn_capture_server().await;
    let (guardian, store, _dir) = fixture(addr).await;
    seed_incoherent_diagnostics(&store).await;

    let conditions = guardian.run_cycle().await;
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].name, CONDITION_DIAGNOSTIC_INCOHERENCE);

    let hits = hits.lock().unwrap().clone();
    assert_eq!(hits.iter().filter(|h| h.as_str() == "POST /hook").count(), 1);
    assert!(hits
        .iter()
        .any(|h| h.contains("/deployments/monitoramento/scale")));
}

#[tokio::test]
async fn test_empty_history_raises_nothing() {
    let (addr, hits) = spawn_capture_server().await;
    let (guardian, _store, _dir) = fixture(addr).await;

    // Collaborators down, local history empty: every check skips, and
    // absence of data never escalates.
    let conditions = guardian.run_cycle().await;
    assert!(conditions.is_empty());
    assert!(hits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_plan_storm_raises_instability() {
    let (addr, _hits) = spawn_capture_server().await;
    let (guardian, store, _dir) = fixture(addr).await;

    // One more cancelled plan than the default window tolerates.
    for _ in 0..4 {
        let plan = ActionPlanRecord::new(Uuid::new_v4(), vec!["acao".into()]);
        let id = store.append_action_plan(plan).await.unwrap();
        store
            .update_action_plan(
                id,
                ActionPlanPatch {
                    execution_status: Some(ExecutionStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let conditions = guardian.run_cycle().await;
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].name, CONDITION_DECISION_INSTABILITY);
    assert_eq!(conditions[0].details["cancelled_count"], 4);
}

#[tokio::test]
async fn test_one_cycle_can_raise_multiple_conditions() {
    let (addr, hits) = spawn_capture_server().await;
    let (guardian, store, _dir) = fixture(addr).await;

    seed_incoherent_diagnostics(&store).await;
    for _ in 0..4 {
        let plan = ActionPlanRecord::new(Uuid::new_v4(), vec!["acao".into()]);
        let id = store.append_action_plan(plan).await.unwrap();
        store
            .update_action_plan(
                id,
                ActionPlanPatch {
                    execution_status: Some(ExecutionStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
    // Concluded plans with low efficacy trip the third invariant too.
    for _ in 0..3 {
        let plan = ActionPlanRecord::new(Uuid::new_v4(), vec!["acao".into()]);
        let id = store.append_action_plan(plan).await.unwrap();
        let mut efficacy = HashMap::new();
        efficacy.insert("acao".to_string(), 0.05);
        store
            .update_action_plan(
                id,
                ActionPlanPatch {
                    execution_status: Some(ExecutionStatus::Concluded),
                    efficacy_by_action: Some(efficacy),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let conditions = guardian.run_cycle().await;
    assert_eq!(conditions.len(), 3);

    // Each condition escalated independently: one webhook call apiece.
    let hits = hits.lock().unwrap().clone();
    assert_eq!(hits.iter().filter(|h| h.as_str() == "POST /hook").count(), 3);
}

#[tokio::test]
async fn test_lifecycle_start_stop_start() {
    let (addr, _hits) = spawn_capture_server().await;
    let (guardian, _store, _dir) = fixture(addr).await;

    assert!(!guardian.is_running());
    guardian.start();
    assert!(guardian.is_running());
    assert!(guardian.thread_active());

    // Second start is a no-op, not a second loop.
    guardian.start();
    assert!(guardian.thread_active());

    guardian.stop().await;
    assert!(!guardian.is_running());
    assert!(!guardian.thread_active());

    guardian.start();
    assert!(guardian.is_running());
    guardian.stop().await;
}
