//! Shared operational state store (the "memory" layer).
//!
//! Single source of truth read and written by every component: diagnostics,
//! action plans, alerts, incidents, ethics validations, autonomy state, and
//! learning counters. Every mutation persists the whole document before the
//! call returns; a failed write rolls the in-memory change back so memory
//! and disk never silently diverge.

pub mod persist;

use crate::config::GuardianConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use guardian_common::{
    ActionPlanPatch, ActionPlanRecord, Alert, AutonomyTransition, DiagnosticRecord,
    EthicsAggregate, EthicsValidation, ExecutionStatus, GuardianError, Incident, LearningRecord,
    SystemStatus, AUTONOMY_MAX, AUTONOMY_MIN,
};
use persist::{CacheMirror, STATE_MIRROR_KEY};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const STATE_FILE: &str = "state.json";

/// Record collections addressable by retention and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Diagnostics,
    ActionPlans,
    Alerts,
    Incidents,
    EthicsValidations,
    LearningRecords,
}

/// Time-range and limit filter, applied most-recent-first.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    fn matches(&self, timestamp: DateTime<Utc>) -> bool {
        if let Some(since) = self.since {
            if timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if timestamp > until {
                return false;
            }
        }
        true
    }
}

/// The persisted state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreState {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub system_status: SystemStatus,
    pub autonomy_level: u8,
    /// Learning-proposed level increase awaiting an explicit trigger.
    #[serde(default)]
    pub pending_autonomy_level: Option<u8>,
    #[serde(default)]
    pub diagnostics: VecDeque<DiagnosticRecord>,
    #[serde(default)]
    pub action_plans: VecDeque<ActionPlanRecord>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub incidents: Vec<Incident>,
    #[serde(default)]
    pub ethics_validations: Vec<EthicsValidation>,
    #[serde(default)]
    pub autonomy_transitions: Vec<AutonomyTransition>,
    #[serde(default)]
    pub learning_records: Vec<LearningRecord>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: Utc::now(),
            system_status: SystemStatus::Normal,
            autonomy_level: AUTONOMY_MIN,
            pending_autonomy_level: None,
            diagnostics: VecDeque::new(),
            action_plans: VecDeque::new(),
            alerts: Vec::new(),
            incidents: Vec::new(),
            ethics_validations: Vec::new(),
            autonomy_transitions: Vec::new(),
            learning_records: Vec::new(),
        }
    }
}

/// Mutex-guarded store. The lock is held across the read-modify-write and
/// persist sequence, which makes per-key updates linearizable; there is no
/// cross-collection transactional atomicity beyond the single document.
pub struct StateStore {
    inner: Mutex<StoreState>,
    path: PathBuf,
    mirror: Option<Arc<dyn CacheMirror>>,
    diagnostics_max: usize,
    action_plans_max: usize,
    persist_retries: u32,
    persist_backoff: Duration,
}

impl StateStore {
    /// Open the store, loading an existing state document when present.
    pub async fn open(
        config: &GuardianConfig,
        mirror: Option<Arc<dyn CacheMirror>>,
    ) -> Result<Self, GuardianError> {
        let path = config.state_dir.join(STATE_FILE);
        let state = persist::load_state(&path).await?.unwrap_or_default();
        Ok(Self {
            inner: Mutex::new(state),
            path,
            mirror,
            diagnostics_max: config.diagnostics_history_max,
            action_plans_max: config.action_plans_history_max,
            persist_retries: config.persist_retries.max(1),
            persist_backoff: config.persist_backoff(),
        })
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Append a diagnostic to the bounded history. Re-delivery of an id
    /// already stored is a no-op returning the existing id.
    pub async fn append_diagnostic(&self, record: DiagnosticRecord) -> Result<Uuid, GuardianError> {
        let id = record.id;
        let max = self.diagnostics_max;
        let appended = self
            .mutate(move |state| {
                if state.diagnostics.iter().any(|d| d.id == record.id) {
                    return None;
                }
                state.diagnostics.push_back(record);
                while state.diagnostics.len() > max {
                    state.diagnostics.pop_front();
                }
                Some(())
            })
            .await?;
        if appended.is_none() {
            tracing::debug!("Diagnostic {} already stored, ignoring re-delivery", id);
        }
        Ok(id)
    }

    /// Append an action plan to the bounded history. Same re-delivery rule
    /// as diagnostics.
    pub async fn append_action_plan(&self, record: ActionPlanRecord) -> Result<Uuid, GuardianError> {
        let id = record.id;
        let max = self.action_plans_max;
        self.mutate(move |state| {
            if state.action_plans.iter().any(|p| p.id == record.id) {
                return None;
            }
            state.action_plans.push_back(record);
            while state.action_plans.len() > max {
                state.action_plans.pop_front();
            }
            Some(())
        })
        .await?;
        Ok(id)
    }

    /// Apply a partial update to an action plan. Returns false when the id
    /// is unknown. Status transitions are monotonic: a plan already in a
    /// terminal state is left untouched.
    pub async fn update_action_plan(
        &self,
        id: Uuid,
        patch: ActionPlanPatch,
    ) -> Result<bool, GuardianError> {
        let updated = self
            .mutate(move |state| {
                let plan = state.action_plans.iter_mut().find(|p| p.id == id)?;
                if plan.execution_status.is_terminal() {
                    tracing::warn!(
                        "Ignoring status patch for plan {} already in {:?}",
                        id,
                        plan.execution_status
                    );
                    return Some(());
                }
                if let Some(status) = patch.execution_status {
                    plan.execution_status = status;
                    if status == ExecutionStatus::Concluded && patch.concluded_at.is_none() {
                        plan.concluded_at = Some(Utc::now());
                    }
                }
                if let Some(concluded_at) = patch.concluded_at {
                    plan.concluded_at = Some(concluded_at);
                }
                if let Some(efficacy) = patch.efficacy_by_action {
                    plan.efficacy_by_action = Some(efficacy);
                }
                Some(())
            })
            .await?;
        Ok(updated.is_some())
    }

    /// Append an alert. Alerts are never mutated afterwards.
    pub async fn append_alert(&self, alert: Alert) -> Result<(), GuardianError> {
        self.mutate(move |state| {
            state.alerts.push(alert);
            Some(())
        })
        .await?;
        Ok(())
    }

    /// Append an incident. Alta and critica incidents deterministically
    /// generate an alert in the same critical section and persist.
    pub async fn append_incident(&self, incident: Incident) -> Result<Uuid, GuardianError> {
        let id = incident.id;
        self.mutate(move |state| {
            if incident.severity.requires_alert() {
                state.alerts.push(Alert::from_incident(&incident));
            }
            state.incidents.push(incident);
            Some(())
        })
        .await?;
        Ok(id)
    }

    pub async fn append_ethics_validation(
        &self,
        validation: EthicsValidation,
    ) -> Result<Uuid, GuardianError> {
        let id = validation.id;
        self.mutate(move |state| {
            state.ethics_validations.push(validation);
            Some(())
        })
        .await?;
        Ok(id)
    }

    /// Update the counter for a learning pattern, creating the record on
    /// first sight.
    pub async fn record_learning_pattern(
        &self,
        pattern: &str,
        occurrences: u32,
    ) -> Result<(), GuardianError> {
        let pattern = pattern.to_string();
        self.mutate(move |state| {
            match state
                .learning_records
                .iter_mut()
                .find(|r| r.pattern == pattern)
            {
                Some(record) => {
                    if record.occurrences == occurrences {
                        return None;
                    }
                    record.occurrences = occurrences;
                    record.timestamp = Utc::now();
                }
                None => state.learning_records.push(LearningRecord {
                    id: Uuid::new_v4(),
                    pattern,
                    occurrences,
                    timestamp: Utc::now(),
                }),
            }
            Some(())
        })
        .await?;
        Ok(())
    }

    /// Move the autonomy gate, recording the transition. Values clamp to
    /// the valid range; setting the current level again is a no-op.
    pub async fn set_autonomy_level(&self, to: u8, trigger: &str) -> Result<(), GuardianError> {
        let to = to.clamp(AUTONOMY_MIN, AUTONOMY_MAX);
        let trigger = trigger.to_string();
        self.mutate(move |state| {
            if state.autonomy_level == to {
                return None;
            }
            state.autonomy_transitions.push(AutonomyTransition {
                from: state.autonomy_level,
                to,
                trigger,
                timestamp: Utc::now(),
            });
            state.autonomy_level = to;
            Some(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_pending_autonomy_level(
        &self,
        level: Option<u8>,
    ) -> Result<(), GuardianError> {
        self.mutate(move |state| {
            if state.pending_autonomy_level == level {
                return None;
            }
            state.pending_autonomy_level = level;
            Some(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_system_status(&self, status: SystemStatus) -> Result<(), GuardianError> {
        self.mutate(move |state| {
            if state.system_status == status {
                return None;
            }
            state.system_status = status;
            Some(())
        })
        .await?;
        Ok(())
    }

    /// Drop records of one kind older than `older_than`. Returns how many
    /// were removed.
    pub async fn evict_older_than(
        &self,
        kind: RecordKind,
        older_than: Duration,
    ) -> Result<usize, GuardianError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than)
                .map_err(|e| GuardianError::Storage(format!("retention window: {}", e)))?;
        let removed = self
            .mutate(move |state| {
                let removed = match kind {
                    RecordKind::Diagnostics => {
                        let before = state.diagnostics.len();
                        state.diagnostics.retain(|r| r.timestamp >= cutoff);
                        before - state.diagnostics.len()
                    }
                    RecordKind::ActionPlans => {
                        let before = state.action_plans.len();
                        state.action_plans.retain(|r| r.generated_at >= cutoff);
                        before - state.action_plans.len()
                    }
                    RecordKind::Alerts => {
                        let before = state.alerts.len();
                        state.alerts.retain(|r| r.timestamp >= cutoff);
                        before - state.alerts.len()
                    }
                    RecordKind::Incidents => {
                        let before = state.incidents.len();
                        state.incidents.retain(|r| r.timestamp >= cutoff);
                        before - state.incidents.len()
                    }
                    RecordKind::EthicsValidations => {
                        let before = state.ethics_validations.len();
                        state.ethics_validations.retain(|r| r.timestamp >= cutoff);
                        before - state.ethics_validations.len()
                    }
                    RecordKind::LearningRecords => {
                        let before = state.learning_records.len();
                        state.learning_records.retain(|r| r.timestamp >= cutoff);
                        before - state.learning_records.len()
                    }
                };
                if removed == 0 {
                    None
                } else {
                    Some(removed)
                }
            })
            .await?;
        Ok(removed.unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn query_diagnostics(&self, filter: &RecordFilter) -> Vec<DiagnosticRecord> {
        let state = self.inner.lock().await;
        state
            .diagnostics
            .iter()
            .rev()
            .filter(|d| filter.matches(d.timestamp))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub async fn query_action_plans(
        &self,
        filter: &RecordFilter,
        status: Option<ExecutionStatus>,
    ) -> Vec<ActionPlanRecord> {
        let state = self.inner.lock().await;
        state
            .action_plans
            .iter()
            .rev()
            .filter(|p| filter.matches(p.generated_at))
            .filter(|p| status.map_or(true, |s| p.execution_status == s))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Most recent diagnostics, newest first.
    pub async fn recent_diagnostics(&self, limit: usize) -> Vec<DiagnosticRecord> {
        self.query_diagnostics(&RecordFilter::recent(limit)).await
    }

    /// Most recent concluded plans carrying recorded efficacy, newest first.
    pub async fn recent_concluded_plans(&self, limit: usize) -> Vec<ActionPlanRecord> {
        let state = self.inner.lock().await;
        state
            .action_plans
            .iter()
            .rev()
            .filter(|p| {
                p.execution_status == ExecutionStatus::Concluded && p.efficacy_by_action.is_some()
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Plans cancelled within the trailing window.
    pub async fn cancelled_plans_within(&self, window: Duration) -> usize {
        let cutoff = Utc::now() - ChronoDuration::from_std(window).unwrap_or(ChronoDuration::zero());
        let state = self.inner.lock().await;
        state
            .action_plans
            .iter()
            .filter(|p| p.execution_status == ExecutionStatus::Cancelled)
            .filter(|p| p.concluded_at.unwrap_or(p.generated_at) >= cutoff)
            .count()
    }

    /// Alerts raised within the trailing window, newest first.
    pub async fn recent_alerts(&self, window: Duration) -> Vec<Alert> {
        let cutoff = Utc::now() - ChronoDuration::from_std(window).unwrap_or(ChronoDuration::zero());
        let state = self.inner.lock().await;
        state
            .alerts
            .iter()
            .rev()
            .filter(|a| a.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Aggregate ethics statistics, recomputed from the append-only history.
    pub async fn aggregate_ethics(&self) -> EthicsAggregate {
        let state = self.inner.lock().await;
        let total = state.ethics_validations.len();
        let approved = state
            .ethics_validations
            .iter()
            .filter(|v| !v.is_violation())
            .count();
        let mut severity_histogram = std::collections::HashMap::new();
        for validation in state.ethics_validations.iter().filter(|v| v.is_violation()) {
            if let Some(severity) = validation.severity {
                *severity_histogram
                    .entry(severity.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }
        EthicsAggregate {
            total,
            approved,
            approval_rate: if total == 0 {
                1.0
            } else {
                approved as f64 / total as f64
            },
            severity_histogram,
        }
    }

    pub async fn system_status(&self) -> SystemStatus {
        self.inner.lock().await.system_status
    }

    pub async fn autonomy_level(&self) -> u8 {
        self.inner.lock().await.autonomy_level
    }

    pub async fn pending_autonomy_level(&self) -> Option<u8> {
        self.inner.lock().await.pending_autonomy_level
    }

    /// (diagnostics, action plans) history sizes for the status endpoint.
    pub async fn history_sizes(&self) -> (usize, usize) {
        let state = self.inner.lock().await;
        (state.diagnostics.len(), state.action_plans.len())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Run a mutation under the lock and persist before returning. `f`
    /// returning None means nothing changed: no persist, no version bump.
    /// A failed persist restores the pre-mutation state and surfaces the
    /// storage error.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Option<T>,
    ) -> Result<Option<T>, GuardianError> {
        let mut state = self.inner.lock().await;
        let previous = state.clone();
        let out = match f(&mut state) {
            Some(out) => out,
            None => return Ok(None),
        };
        state.version += 1;
        state.updated_at = Utc::now();
        if let Err(e) = self.persist_with_retry(&state).await {
            *state = previous;
            return Err(e);
        }
        Ok(Some(out))
    }

    async fn persist_with_retry(&self, state: &StoreState) -> Result<(), GuardianError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| GuardianError::Storage(format!("serialize state: {}", e)))?;
        let mut last_err = GuardianError::Storage("persist never attempted".to_string());
        for attempt in 1..=self.persist_retries {
            match self.persist_once(&json).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "State persist failed (attempt {}/{}): {}",
                        attempt,
                        self.persist_retries,
                        e
                    );
                    last_err = e;
                    if attempt < self.persist_retries {
                        tokio::time::sleep(self.persist_backoff).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn persist_once(&self, json: &str) -> Result<(), GuardianError> {
        persist::write_atomic(&self.path, json).await?;
        if let Some(mirror) = &self.mirror {
            mirror.store_snapshot(STATE_MIRROR_KEY, json)?;
        }
        Ok(())
    }
}
