//! Guardian supervisory monitor.
//!
//! Background loop that evaluates three safety invariants each cycle:
//! diagnostic coherence, corrective-action efficacy, and decision
//! stability. A violated invariant becomes an emergency condition handed
//! to the escalator. Samples come from the remote collaborators, falling
//! back to the locally cached history when a collaborator is unreachable;
//! when even the fallback is too small the check is skipped. Absence of
//! data is never treated as evidence of a problem.

use crate::collaborators::CollaboratorClient;
use crate::config::GuardianConfig;
use crate::escalator::EmergencyEscalator;
use crate::store::StateStore;
use guardian_common::{ActionPlanRecord, DiagnosticRecord, EmergencyCondition};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Diagnostics below this confidence count as low-confidence for the
/// coherence check.
const LOW_CONFIDENCE_CUTOFF: f64 = 0.5;

pub const CONDITION_DIAGNOSTIC_INCOHERENCE: &str = "diagnostic_incoherence";
pub const CONDITION_LOW_ACTION_EFFICACY: &str = "low_action_efficacy";
pub const CONDITION_DECISION_INSTABILITY: &str = "decision_instability";

pub struct GuardianMonitor {
    config: GuardianConfig,
    store: Arc<StateStore>,
    collaborators: Arc<CollaboratorClient>,
    escalator: Arc<EmergencyEscalator>,
    running: Arc<AtomicBool>,
    /// Set once the loop has ever been started; together with `running`
    /// this distinguishes "stop requested" from "never started".
    started: AtomicBool,
    /// Wakes the loop out of its inter-cycle sleep on stop.
    stop_notify: Notify,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl GuardianMonitor {
    pub fn new(
        config: GuardianConfig,
        store: Arc<StateStore>,
        collaborators: Arc<CollaboratorClient>,
        escalator: Arc<EmergencyEscalator>,
    ) -> Self {
        Self {
            config,
            store,
            collaborators,
            escalator,
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            stop_notify: Notify::new(),
            handle: StdMutex::new(None),
        }
    }

    /// Spawn the monitoring loop. No-op when already running: there is
    /// never more than one loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Guardian monitor already running");
            return;
        }
        self.started.store(true, Ordering::SeqCst);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(
                "Guardian monitor started (interval {}s)",
                monitor.config.check_interval_seconds
            );
            while monitor.running.load(Ordering::SeqCst) {
                monitor.run_cycle().await;
                tokio::select! {
                    _ = tokio::time::sleep(monitor.config.check_interval()) => {}
                    _ = monitor.stop_notify.notified() => {}
                }
            }
            info!("Guardian monitor stopped");
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Flag the loop to stop and join it, bounded by one cycle interval
    /// plus grace. In-flight remote calls finish but their results are
    /// discarded.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let grace = self.config.check_interval() + Duration::from_secs(1);
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Guardian monitor did not stop within {:?}", grace);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the background task is actually alive, not just flagged.
    pub fn thread_active(&self) -> bool {
        let handle = self.handle.lock().unwrap();
        match handle.as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    /// One evaluation cycle. The three checks are independent; all of them
    /// run (or are skipped) before the cycle is done, and each raised
    /// condition goes to the escalator exactly once.
    pub async fn run_cycle(&self) -> Vec<EmergencyCondition> {
        let mut conditions = Vec::new();

        if let Some(condition) = self.check_coherence().await {
            conditions.push(condition);
        }
        if let Some(condition) = self.check_efficacy().await {
            conditions.push(condition);
        }
        if let Some(condition) = self.check_stability().await {
            conditions.push(condition);
        }

        let stop_requested =
            self.started.load(Ordering::SeqCst) && !self.running.load(Ordering::SeqCst);
        if stop_requested && !conditions.is_empty() {
            info!("Stop requested, discarding {} raised conditions", conditions.len());
            return conditions;
        }
        for condition in &conditions {
            self.escalator.trigger(condition).await;
        }
        conditions
    }

    async fn check_coherence(&self) -> Option<EmergencyCondition> {
        let limit = self.config.diagnostics_history_max;
        let diagnostics = match self.collaborators.recent_diagnostics(limit).await {
            Ok(diagnostics) => diagnostics,
            Err(e) => {
                warn!("Diagnosis service unavailable, using local history: {}", e);
                self.store.recent_diagnostics(limit).await
            }
        };
        evaluate_coherence(
            &diagnostics,
            self.config.min_sample_size,
            self.config.incoherence_threshold,
        )
    }

    async fn check_efficacy(&self) -> Option<EmergencyCondition> {
        let limit = self.config.action_plans_history_max;
        let plans = match self.collaborators.recent_concluded_plans(limit).await {
            Ok(plans) => plans,
            Err(e) => {
                warn!("Action service unavailable, using local history: {}", e);
                self.store.recent_concluded_plans(limit).await
            }
        };
        evaluate_efficacy(
            &plans,
            self.config.min_sample_size,
            self.config.low_efficacy_threshold,
        )
    }

    async fn check_stability(&self) -> Option<EmergencyCondition> {
        let window = self.config.stability_window();
        let cancelled = self.store.cancelled_plans_within(window).await;
        evaluate_stability(cancelled, window, self.config.max_cancelled_plans)
    }
}

/// Coherence invariant: the ratio of low-confidence diagnostics must not
/// exceed the configured threshold.
pub fn evaluate_coherence(
    diagnostics: &[DiagnosticRecord],
    min_sample_size: usize,
    threshold: f64,
) -> Option<EmergencyCondition> {
    let sample_size = diagnostics.len();
    if sample_size < min_sample_size {
        debug!(
            "Coherence check skipped: {} diagnostics below minimum {}",
            sample_size, min_sample_size
        );
        return None;
    }
    let low_confidence_count = diagnostics
        .iter()
        .filter(|d| d.overall_confidence < LOW_CONFIDENCE_CUTOFF)
        .count();
    let low_confidence_ratio = low_confidence_count as f64 / sample_size as f64;
    if low_confidence_ratio > threshold {
        Some(EmergencyCondition::new(
            CONDITION_DIAGNOSTIC_INCOHERENCE,
            serde_json::json!({
                "sample_size": sample_size,
                "low_confidence_count": low_confidence_count,
                "low_confidence_ratio": low_confidence_ratio,
                "threshold": threshold,
            }),
        ))
    } else {
        None
    }
}

/// Efficacy invariant: the mean of per-plan mean efficacies must not fall
/// below the configured threshold. Only concluded plans with recorded
/// efficacy participate.
pub fn evaluate_efficacy(
    plans: &[ActionPlanRecord],
    min_sample_size: usize,
    threshold: f64,
) -> Option<EmergencyCondition> {
    let means: Vec<f64> = plans.iter().filter_map(|p| p.mean_efficacy()).collect();
    let sample_size = means.len();
    if sample_size < min_sample_size {
        debug!(
            "Efficacy check skipped: {} measured plans below minimum {}",
            sample_size, min_sample_size
        );
        return None;
    }
    let mean_efficacy = means.iter().sum::<f64>() / sample_size as f64;
    if mean_efficacy < threshold {
        Some(EmergencyCondition::new(
            CONDITION_LOW_ACTION_EFFICACY,
            serde_json::json!({
                "mean_efficacy": mean_efficacy,
                "sample_size": sample_size,
                "threshold": threshold,
            }),
        ))
    } else {
        None
    }
}

/// Stability invariant: cancelled plans within the trailing window must
/// not strictly exceed the configured maximum.
pub fn evaluate_stability(
    cancelled_count: usize,
    window: Duration,
    max_cancelled: usize,
) -> Option<EmergencyCondition> {
    if cancelled_count > max_cancelled {
        Some(EmergencyCondition::new(
            CONDITION_DECISION_INSTABILITY,
            serde_json::json!({
                "cancelled_count": cancelled_count,
                "window_seconds": window.as_secs(),
                "max_cancelled_plans": max_cancelled,
            }),
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_common::ExecutionStatus;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn diagnostic(confidence: f64) -> DiagnosticRecord {
        DiagnosticRecord::new(vec![], confidence)
    }

    fn concluded_plan(efficacy: f64) -> ActionPlanRecord {
        let mut plan = ActionPlanRecord::new(Uuid::new_v4(), vec!["a1".into()]);
        plan.execution_status = ExecutionStatus::Concluded;
        let mut map = HashMap::new();
        map.insert("a1".to_string(), efficacy);
        plan.efficacy_by_action = Some(map);
        plan
    }

    #[test]
    fn test_coherence_triggers_above_threshold() {
        // 8 low-confidence out of 10: ratio 0.8 against threshold 0.7.
        let mut diagnostics: Vec<_> = (0..8).map(|_| diagnostic(0.1)).collect();
        diagnostics.extend((0..2).map(|_| diagnostic(0.9)));

        let condition = evaluate_coherence(&diagnostics, 3, 0.7).expect("should trigger");
        assert_eq!(condition.name, CONDITION_DIAGNOSTIC_INCOHERENCE);
        assert_eq!(condition.details["sample_size"], 10);
        assert_eq!(condition.details["low_confidence_count"], 8);
        let ratio = condition.details["low_confidence_ratio"].as_f64().unwrap();
        approx::assert_relative_eq!(ratio, 0.8, epsilon = 1e-9);
    }

    #[test]
    fn test_coherence_does_not_trigger_at_threshold() {
        // Exactly at the threshold is not a violation: strict comparison.
        let mut diagnostics: Vec<_> = (0..7).map(|_| diagnostic(0.1)).collect();
        diagnostics.extend((0..3).map(|_| diagnostic(0.9)));
        assert!(evaluate_coherence(&diagnostics, 3, 0.7).is_none());
    }

    #[test]
    fn test_coherence_skips_small_samples() {
        let diagnostics: Vec<_> = (0..2).map(|_| diagnostic(0.0)).collect();
        assert!(evaluate_coherence(&diagnostics, 3, 0.1).is_none());
    }

    #[test]
    fn test_efficacy_triggers_below_threshold() {
        let plans: Vec<_> = [0.1, 0.2, 0.1, 0.15, 0.05]
            .iter()
            .map(|e| concluded_plan(*e))
            .collect();

        let condition = evaluate_efficacy(&plans, 3, 0.3).expect("should trigger");
        assert_eq!(condition.name, CONDITION_LOW_ACTION_EFFICACY);
        let mean = condition.details["mean_efficacy"].as_f64().unwrap();
        approx::assert_relative_eq!(mean, 0.12, epsilon = 1e-9);
        assert_eq!(condition.details["sample_size"], 5);
    }

    #[test]
    fn test_efficacy_not_triggered_at_threshold() {
        // Strict comparison: a mean exactly at the threshold passes.
        let plans: Vec<_> = (0..5).map(|_| concluded_plan(0.5)).collect();
        assert!(evaluate_efficacy(&plans, 3, 0.5).is_none());
    }

    #[test]
    fn test_efficacy_ignores_unmeasured_plans() {
        // Plans without recorded efficacy do not count toward the sample.
        let mut plans: Vec<_> = (0..2).map(|_| concluded_plan(0.0)).collect();
        plans.push(ActionPlanRecord::new(Uuid::new_v4(), vec!["a1".into()]));
        assert!(evaluate_efficacy(&plans, 3, 0.5).is_none());
    }

    #[test]
    fn test_stability_strictly_exceeds() {
        let window = Duration::from_secs(3600);
        assert!(evaluate_stability(3, window, 3).is_none());
        let condition = evaluate_stability(4, window, 3).expect("should trigger");
        assert_eq!(condition.name, CONDITION_DECISION_INSTABILITY);
        assert_eq!(condition.details["cancelled_count"], 4);
        assert_eq!(condition.details["window_seconds"], 3600);
    }
}
