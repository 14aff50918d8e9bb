//! Orchestrator cycle tests.

use guardian_common::message::TOPIC_NEW_DIAGNOSIS;
use guardian_common::{
    DiagnosticRecord, EthicsValidation, Incident, Message, Priority, Severity, SubjectType,
    SystemStatus, ValidationResult, AUTONOMY_MIN,
};
use guardiand::bus::EventBus;
use guardiand::collaborators::CollaboratorClient;
use guardiand::config::GuardianConfig;
use guardiand::orchestrator::Orchestrator;
use guardiand::store::StateStore;
use std::sync::Arc;

async fn fixture() -> (Arc<Orchestrator>, Arc<StateStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GuardianConfig::default();
    config.state_dir = dir.path().to_path_buf();
    config.orchestrator_interval_seconds = 1;
    config.collaborator_retries = 1;
    config.acao_url = "http://127.0.0.1:1".to_string();
    config.diagnostico_url = "http://127.0.0.1:1".to_string();
    config.monitoramento_url = "http://127.0.0.1:1".to_string();

    let store = Arc::new(StateStore::open(&config, None).await.unwrap());
    let collaborators = Arc::new(CollaboratorClient::new(&config).unwrap());
    let orchestrator = Arc::new(Orchestrator::new(config, Arc::clone(&store), collaborators));
    (orchestrator, store, dir)
}

#[tokio::test]
async fn test_severe_alert_forces_autonomy_to_minimum() {
    let (orchestrator, store, _dir) = fixture().await;
    store.set_autonomy_level(4, "learning").await.unwrap();

    // A critica incident synchronously produces the alert the next cycle
    // reacts to.
    store
        .append_incident(Incident::new(Severity::Critica, "diagnostico", "crashed"))
        .await
        .unwrap();

    orchestrator.run_cycle().await.unwrap();
    assert_eq!(store.autonomy_level().await, AUTONOMY_MIN);
    // Incident alerts do not suspend the whole system.
    assert_eq!(store.system_status().await, SystemStatus::Normal);
}

#[tokio::test]
async fn test_emergency_alert_suspends_system() {
    let (orchestrator, store, _dir) = fixture().await;
    store
        .append_alert(guardian_common::Alert::new(
            "emergency",
            Severity::Critica,
            "EMERGENCY: diagnostic_incoherence".to_string(),
        ))
        .await
        .unwrap();

    orchestrator.run_cycle().await.unwrap();
    assert_eq!(store.system_status().await, SystemStatus::Suspended);
    assert_eq!(store.autonomy_level().await, AUTONOMY_MIN);
}

#[tokio::test]
async fn test_ethics_violation_takes_safeguard_path() {
    let (orchestrator, store, _dir) = fixture().await;
    store.set_autonomy_level(3, "learning").await.unwrap();

    let mut rejected =
        EthicsValidation::new(SubjectType::Action, ValidationResult::Rejeitado, 0.9);
    rejected.severity = Some(Severity::Alta);
    store.append_ethics_validation(rejected).await.unwrap();

    orchestrator.run_cycle().await.unwrap();
    assert_eq!(store.autonomy_level().await, AUTONOMY_MIN);
}

#[tokio::test]
async fn test_clean_cycle_leaves_state_alone() {
    let (orchestrator, store, _dir) = fixture().await;
    store.set_autonomy_level(2, "learning").await.unwrap();

    orchestrator.run_cycle().await.unwrap();
    assert_eq!(store.autonomy_level().await, 2);
    assert_eq!(store.system_status().await, SystemStatus::Normal);
}

#[tokio::test]
async fn test_pending_increase_is_surfaced_not_applied() {
    let (orchestrator, store, _dir) = fixture().await;
    store.set_pending_autonomy_level(Some(3)).await.unwrap();

    orchestrator.run_cycle().await.unwrap();
    // Surfaced only: the level does not move without a learning trigger.
    assert_eq!(store.autonomy_level().await, AUTONOMY_MIN);
    assert_eq!(store.pending_autonomy_level().await, Some(3));
}

#[tokio::test]
async fn test_bus_events_become_learning_records() {
    let (orchestrator, store, _dir) = fixture().await;
    let bus = Arc::new(EventBus::new());
    orchestrator.attach_bus(&bus).await;

    for _ in 0..3 {
        bus.publish(&Message::new(
            TOPIC_NEW_DIAGNOSIS,
            serde_json::json!({}),
            Priority::Normal,
            "test",
        ))
        .unwrap();
    }
    while bus.dispatch_once().await > 0 {}

    orchestrator.run_cycle().await.unwrap();

    drop(store);
    let state_json = std::fs::read_to_string(_dir.path().join("state.json"))
        .expect("state document exists");
    let state: serde_json::Value = serde_json::from_str(&state_json).unwrap();
    let records = state["learning_records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["pattern"], TOPIC_NEW_DIAGNOSIS);
    assert_eq!(records[0]["occurrences"], 3);
}

#[tokio::test]
async fn test_suspended_system_withholds_action_generation() {
    // The action URL points at a closed port; a cycle in suspended state
    // must not even attempt the call, so the cycle stays clean and fast.
    let (orchestrator, store, _dir) = fixture().await;
    store.set_autonomy_level(3, "learning").await.unwrap();
    store
        .set_system_status(SystemStatus::Suspended)
        .await
        .unwrap();

    orchestrator.run_cycle().await.unwrap();
    assert_eq!(store.system_status().await, SystemStatus::Suspended);
}

#[tokio::test]
async fn test_diagnostic_history_feeds_nothing_without_alerts() {
    let (orchestrator, store, _dir) = fixture().await;
    store
        .append_diagnostic(DiagnosticRecord::new(vec![], 0.2))
        .await
        .unwrap();

    orchestrator.run_cycle().await.unwrap();
    assert_eq!(store.system_status().await, SystemStatus::Normal);
}
