//! Emergency escalation protocol.
//!
//! When a safety invariant is violated the protocol alerts, then scales
//! every configured workload to zero replicas. Nothing here scales
//! anything back up; restoring service is an operator action.

use crate::cluster::ClusterClient;
use crate::config::GuardianConfig;
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use guardian_common::{Alert, EmergencyCondition, GuardianError, Severity, SystemStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

const ESCALATION_LOG_FILE: &str = "escalations.jsonl";

/// Audit record appended for every triggered escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationLogEntry {
    pub ts: DateTime<Utc>,
    pub condition: String,
    pub details: serde_json::Value,
    pub alert_delivered: bool,
    pub workloads_scaled: Vec<String>,
    pub workloads_failed: Vec<String>,
}

pub struct EmergencyEscalator {
    namespace: String,
    target_workloads: Vec<String>,
    webhook_url: Option<String>,
    cluster: Option<Arc<ClusterClient>>,
    store: Arc<StateStore>,
    http: reqwest::Client,
    log_path: PathBuf,
}

impl EmergencyEscalator {
    pub fn new(
        config: &GuardianConfig,
        store: Arc<StateStore>,
        cluster: Option<Arc<ClusterClient>>,
    ) -> Result<Self, GuardianError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| GuardianError::Configuration(format!("webhook client: {}", e)))?;
        Ok(Self {
            namespace: config.emergency_namespace.clone(),
            target_workloads: config.emergency_target_workloads.clone(),
            webhook_url: config.alert_webhook_url.clone(),
            cluster,
            store,
            http,
            log_path: config.state_dir.join(ESCALATION_LOG_FILE),
        })
    }

    /// Execute the emergency protocol for one condition. Every step is
    /// attempted regardless of earlier failures; the call itself never
    /// fails the caller.
    pub async fn trigger(&self, condition: &EmergencyCondition) {
        error!(
            "EMERGENCY PROTOCOL TRIGGERED: {} {}",
            condition.name, condition.details
        );

        // Record the condition in shared state so the orchestrator and the
        // HTTP surface see it immediately.
        let mut alert = Alert::new("emergency", Severity::Critica, condition.summary());
        alert
            .detail
            .insert("condition".into(), serde_json::json!(condition.name));
        alert.detail.insert("details".into(), condition.details.clone());
        if let Err(e) = self.store.append_alert(alert).await {
            error!("Failed to record emergency alert: {}", e);
        }
        if let Err(e) = self.store.set_system_status(SystemStatus::Emergency).await {
            error!("Failed to mark system status emergency: {}", e);
        }

        let alert_delivered = self.send_webhook_alert(condition).await;

        let mut scaled = Vec::new();
        let mut failed = Vec::new();
        match &self.cluster {
            Some(cluster) => {
                for workload in &self.target_workloads {
                    match cluster.scale_to_zero(&self.namespace, workload).await {
                        Ok(()) => scaled.push(workload.clone()),
                        Err(e) => {
                            error!("Failed to scale down {}: {}", workload, e);
                            failed.push(workload.clone());
                        }
                    }
                }
            }
            None => warn!("No cluster API configured, skipping workload scale-down"),
        }

        let entry = EscalationLogEntry {
            ts: Utc::now(),
            condition: condition.name.clone(),
            details: condition.details.clone(),
            alert_delivered,
            workloads_scaled: scaled,
            workloads_failed: failed,
        };
        if let Err(e) = self.write_log_entry(&entry).await {
            error!("Failed to write escalation log entry: {}", e);
        }
    }

    /// Best-effort webhook delivery. Returns whether the alert went out.
    async fn send_webhook_alert(&self, condition: &EmergencyCondition) -> bool {
        let Some(url) = &self.webhook_url else {
            warn!("No alert webhook configured, emergency alert not sent");
            return false;
        };
        let body = serde_json::json!({ "text": condition.summary() });
        match self.http.post(url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Emergency alert delivered to webhook");
                true
            }
            Ok(response) => {
                error!("Alert webhook returned {}", response.status());
                false
            }
            Err(e) => {
                error!("Alert webhook unreachable: {}", e);
                false
            }
        }
    }

    async fn write_log_entry(&self, entry: &EscalationLogEntry) -> Result<(), GuardianError> {
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let line = serde_json::to_string(entry)? + "\n";
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}
