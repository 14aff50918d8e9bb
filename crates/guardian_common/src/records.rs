//! Record types held by the state store.
//!
//! Every entity the control plane coordinates on is a typed, serde-friendly
//! struct with explicit required fields. Invalid records are rejected at the
//! deserialization boundary, not discovered later through missing keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Incident and alert severity. Wire values follow the collaborator services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Baixa,
    Media,
    Alta,
    Critica,
}

impl Severity {
    /// Severities that deterministically generate an alert.
    pub fn requires_alert(&self) -> bool {
        matches!(self, Severity::Alta | Severity::Critica)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Baixa => "baixa",
            Severity::Media => "media",
            Severity::Alta => "alta",
            Severity::Critica => "critica",
        }
    }
}

/// A single anomaly surfaced by the diagnosis collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub label: String,
    pub score: f64,
}

/// Diagnostic output from the diagnosis collaborator. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detected_anomalies: Vec<Anomaly>,
    #[serde(default)]
    pub root_cause: Option<String>,
    /// Confidence in the diagnosis as a whole, in [0, 1].
    pub overall_confidence: f64,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl DiagnosticRecord {
    pub fn new(detected_anomalies: Vec<Anomaly>, overall_confidence: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            detected_anomalies,
            root_cause: None,
            overall_confidence,
            context: serde_json::Map::new(),
        }
    }

    /// Boundary validation beyond what serde enforces structurally.
    pub fn validate(&self) -> Result<(), crate::GuardianError> {
        if !(0.0..=1.0).contains(&self.overall_confidence) {
            return Err(crate::GuardianError::Data(format!(
                "overall_confidence {} outside [0, 1]",
                self.overall_confidence
            )));
        }
        Ok(())
    }
}

/// Lifecycle of an action plan. Transitions are monotonic: nothing leaves
/// `Concluded` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    Executing,
    Concluded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Concluded | ExecutionStatus::Failed)
    }
}

/// Corrective action plan generated for a diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPlanRecord {
    pub id: Uuid,
    pub diagnostic_id: Uuid,
    #[serde(default)]
    pub action_ids: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub concluded_at: Option<DateTime<Utc>>,
    /// Measured improvement per executed action, recorded after conclusion.
    #[serde(default)]
    pub efficacy_by_action: Option<HashMap<String, f64>>,
}

impl ActionPlanRecord {
    pub fn new(diagnostic_id: Uuid, action_ids: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            diagnostic_id,
            action_ids,
            generated_at: Utc::now(),
            execution_status: ExecutionStatus::Created,
            concluded_at: None,
            efficacy_by_action: None,
        }
    }

    /// Mean efficacy across this plan's actions, when recorded.
    pub fn mean_efficacy(&self) -> Option<f64> {
        let efficacy = self.efficacy_by_action.as_ref()?;
        if efficacy.is_empty() {
            return None;
        }
        Some(efficacy.values().sum::<f64>() / efficacy.len() as f64)
    }
}

/// Partial update applied to an action plan in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionPlanPatch {
    #[serde(default)]
    pub execution_status: Option<ExecutionStatus>,
    #[serde(default)]
    pub concluded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub efficacy_by_action: Option<HashMap<String, f64>>,
}

/// Append-only alert record. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub detail: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: &str, severity: Severity, message: String) -> Self {
        Self {
            kind: kind.to_string(),
            severity,
            message,
            detail: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Alert derived from a high-severity incident.
    pub fn from_incident(incident: &Incident) -> Self {
        let mut detail = serde_json::Map::new();
        detail.insert("incident_id".into(), serde_json::json!(incident.id));
        detail.insert("component".into(), serde_json::json!(incident.component));
        Self {
            kind: "incident".to_string(),
            severity: incident.severity,
            message: format!("[{}] {}", incident.component, incident.description),
            detail,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only incident record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub severity: Severity,
    pub component: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl Incident {
    pub fn new(severity: Severity, component: &str, description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            component: component.to_string(),
            description: description.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// What an ethics validation judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Decision,
    Action,
}

/// Verdict of an ethics validation. Wire values follow the ethics service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationResult {
    Aprovado,
    Rejeitado,
}

/// Append-only ethics validation record. Rejections carry the severity of
/// the violation so the aggregate can report a severity mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthicsValidation {
    pub id: Uuid,
    pub subject_type: SubjectType,
    pub result: ValidationResult,
    pub confidence: f64,
    #[serde(default)]
    pub severity: Option<Severity>,
    pub timestamp: DateTime<Utc>,
}

impl EthicsValidation {
    pub fn new(subject_type: SubjectType, result: ValidationResult, confidence: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_type,
            result,
            confidence,
            severity: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_violation(&self) -> bool {
        self.result == ValidationResult::Rejeitado
    }
}

/// Aggregate statistics recomputed on demand from the ethics history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EthicsAggregate {
    pub total: usize,
    pub approved: usize,
    pub approval_rate: f64,
    pub severity_histogram: HashMap<String, usize>,
}

impl EthicsAggregate {
    pub fn violations(&self) -> usize {
        self.total - self.approved
    }
}

/// Recorded change of the autonomy level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyTransition {
    pub from: u8,
    pub to: u8,
    /// What caused the transition. Decreases are safeguard-driven and
    /// applied synchronously; increases are learning-driven.
    pub trigger: String,
    pub timestamp: DateTime<Utc>,
}

/// Minimum and maximum autonomy levels the gate can hold.
pub const AUTONOMY_MIN: u8 = 1;
pub const AUTONOMY_MAX: u8 = 5;

/// Informational learning-pattern counter, consumed by external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    pub id: Uuid,
    pub pattern: String,
    pub occurrences: u32,
    pub timestamp: DateTime<Utc>,
}

/// Overall operational status gate for the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Normal,
    Emergency,
    Suspended,
}

impl SystemStatus {
    /// Whether autonomous action generation is permitted in this status.
    pub fn permits_action_generation(&self) -> bool {
        matches!(self, SystemStatus::Normal)
    }
}

/// A safety invariant violation raised by the guardian. A control signal,
/// not a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyCondition {
    pub name: String,
    pub details: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl EmergencyCondition {
    pub fn new(name: &str, details: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            details,
            raised_at: Utc::now(),
        }
    }

    /// Human-readable one-line summary used for the alert webhook.
    pub fn summary(&self) -> String {
        format!("EMERGENCY: {} {}", self.name, self.details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_alert_rule() {
        assert!(!Severity::Baixa.requires_alert());
        assert!(!Severity::Media.requires_alert());
        assert!(Severity::Alta.requires_alert());
        assert!(Severity::Critica.requires_alert());
    }

    #[test]
    fn test_severity_wire_format() {
        assert_eq!(serde_json::to_string(&Severity::Critica).unwrap(), "\"critica\"");
        let parsed: Severity = serde_json::from_str("\"alta\"").unwrap();
        assert_eq!(parsed, Severity::Alta);
    }

    #[test]
    fn test_execution_status_terminal() {
        assert!(ExecutionStatus::Concluded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Executing.is_terminal());
    }

    #[test]
    fn test_plan_mean_efficacy() {
        let mut plan = ActionPlanRecord::new(Uuid::new_v4(), vec!["a1".into(), "a2".into()]);
        assert_eq!(plan.mean_efficacy(), None);

        let mut efficacy = HashMap::new();
        efficacy.insert("a1".to_string(), 0.2);
        efficacy.insert("a2".to_string(), 0.4);
        plan.efficacy_by_action = Some(efficacy);

        approx::assert_relative_eq!(plan.mean_efficacy().unwrap(), 0.3, epsilon = 1e-9);
    }

    #[test]
    fn test_diagnostic_confidence_bounds() {
        let mut diag = DiagnosticRecord::new(vec![], 0.5);
        assert!(diag.validate().is_ok());

        diag.overall_confidence = 1.3;
        assert!(diag.validate().is_err());
    }

    #[test]
    fn test_diagnostic_missing_id_rejected() {
        let body = serde_json::json!({
            "timestamp": Utc::now(),
            "overall_confidence": 0.9
        });
        let parsed: Result<DiagnosticRecord, _> = serde_json::from_value(body);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_alert_from_incident() {
        let incident = Incident::new(Severity::Critica, "diagnostico", "service degraded");
        let alert = Alert::from_incident(&incident);
        assert_eq!(alert.kind, "incident");
        assert_eq!(alert.severity, Severity::Critica);
        assert!(alert.message.contains("diagnostico"));
        assert_eq!(
            alert.detail.get("incident_id").unwrap(),
            &serde_json::json!(incident.id)
        );
    }
}
