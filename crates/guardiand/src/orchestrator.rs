//! Outer orchestration cycle.
//!
//! Sequences health check, ethics check, autonomy check, learning check,
//! and action generation against the shared state store. Safeguards are
//! applied synchronously the moment they are decided: autonomy drops to
//! the minimum and, for emergency alerts, the system is suspended.

use crate::bus::EventBus;
use crate::collaborators::CollaboratorClient;
use crate::config::GuardianConfig;
use crate::store::StateStore;
use guardian_common::message::{TOPIC_NEW_ACTION_PLAN, TOPIC_NEW_DIAGNOSIS};
use guardian_common::{SystemStatus, AUTONOMY_MIN};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Orchestrator {
    config: GuardianConfig,
    store: Arc<StateStore>,
    collaborators: Arc<CollaboratorClient>,
    /// Event pattern counters fed by the bus, drained into learning records.
    pattern_counters: Arc<StdMutex<HashMap<String, u32>>>,
    running: Arc<AtomicBool>,
    /// Wakes the loop out of its inter-cycle sleep on stop.
    stop_notify: Notify,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: GuardianConfig,
        store: Arc<StateStore>,
        collaborators: Arc<CollaboratorClient>,
    ) -> Self {
        Self {
            config,
            store,
            collaborators,
            pattern_counters: Arc::new(StdMutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            stop_notify: Notify::new(),
            handle: StdMutex::new(None),
        }
    }

    /// Subscribe to the diagnostic/action topics so cycle step 4 sees how
    /// often each event pattern occurs.
    pub async fn attach_bus(&self, bus: &EventBus) {
        for topic in [TOPIC_NEW_DIAGNOSIS, TOPIC_NEW_ACTION_PLAN] {
            let counters = Arc::clone(&self.pattern_counters);
            let pattern = topic.to_string();
            bus.subscribe(topic, move |_msg| {
                let counters = Arc::clone(&counters);
                let pattern = pattern.clone();
                async move {
                    *counters.lock().unwrap().entry(pattern).or_insert(0) += 1;
                    Ok(())
                }
            })
            .await;
        }
    }

    /// Spawn the cycle loop. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Orchestrator already running");
            return;
        }
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(
                "Orchestrator started (interval {}s)",
                orchestrator.config.orchestrator_interval_seconds
            );
            let base = orchestrator.config.orchestrator_interval();
            let mut wait = base;
            while orchestrator.running.load(Ordering::SeqCst) {
                match orchestrator.run_cycle().await {
                    Ok(()) => wait = base,
                    Err(e) => {
                        // One doubled wait after a failed cycle, back to
                        // normal cadence after the next clean one.
                        error!("Orchestrator cycle failed: {:#}", e);
                        wait = base * 2;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = orchestrator.stop_notify.notified() => {}
                }
            }
            info!("Orchestrator stopped");
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let grace = self.config.orchestrator_interval() * 2 + Duration::from_secs(1);
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Orchestrator did not stop within {:?}", grace);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One orchestration cycle.
    pub async fn run_cycle(&self) -> anyhow::Result<()> {
        // 1. Health snapshot: severe alerts invoke the safeguard. The
        // monitoring collaborator being down is informational here; the
        // guardian's own checks decide whether it is an emergency.
        if !self.collaborators.monitoring_reachable().await {
            warn!("Monitoring collaborator unreachable");
        }
        let window = self.config.stability_window();
        let severe: Vec<_> = self
            .store
            .recent_alerts(window)
            .await
            .into_iter()
            .filter(|a| a.severity.requires_alert())
            .collect();
        if !severe.is_empty() {
            let emergency = severe.iter().any(|a| a.kind == "emergency");
            self.apply_safeguard(emergency, &format!("{} severe alerts active", severe.len()))
                .await?;
        }

        // 2. Ethics aggregate: any violation takes the same safeguard path.
        let ethics = self.store.aggregate_ethics().await;
        if ethics.violations() > 0 {
            self.apply_safeguard(
                false,
                &format!("{} ethics violations recorded", ethics.violations()),
            )
            .await?;
        }

        // 3. Pending autonomy increases are surfaced, never auto-applied.
        if let Some(pending) = self.store.pending_autonomy_level().await {
            let current = self.store.autonomy_level().await;
            if pending > current {
                info!(
                    "Autonomy increase {} -> {} pending a learning-driven trigger",
                    current, pending
                );
            }
        }

        // 4. Learning counters, informational only.
        let counters: Vec<(String, u32)> = {
            let counters = self.pattern_counters.lock().unwrap();
            counters.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        for (pattern, occurrences) in counters {
            debug!("Learning pattern {}: {} occurrences", pattern, occurrences);
            self.store
                .record_learning_pattern(&pattern, occurrences)
                .await?;
        }

        // 5. Action generation, gated on status and autonomy.
        let status = self.store.system_status().await;
        let autonomy = self.store.autonomy_level().await;
        if status.permits_action_generation() && autonomy > AUTONOMY_MIN {
            match self.collaborators.request_action_generation().await {
                Ok(()) => debug!("Action generation requested"),
                Err(e) => warn!("Action generation request failed: {}", e),
            }
        } else {
            debug!(
                "Action generation withheld (status {:?}, autonomy {})",
                status, autonomy
            );
        }

        Ok(())
    }

    /// Safeguard path: drop autonomy to the minimum immediately; suspend
    /// the system for emergency-kind alerts.
    async fn apply_safeguard(&self, suspend: bool, reason: &str) -> anyhow::Result<()> {
        warn!("Applying safeguard: {}", reason);
        self.store
            .set_autonomy_level(AUTONOMY_MIN, &format!("safeguard: {}", reason))
            .await?;
        if suspend && self.store.system_status().await != SystemStatus::Emergency {
            self.store.set_system_status(SystemStatus::Suspended).await?;
        }
        Ok(())
    }
}
