//! Configuration management for guardiand.
//!
//! Loads settings from /etc/guardian/config.toml (falling back to
//! /var/lib/guardian/config.toml), then applies GUARDIAN_* environment
//! overrides. Invalid values are fatal at startup: the daemon never runs
//! with undefined thresholds.

use guardian_common::GuardianError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/guardian/config.toml";

/// Default config file path for fallback
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/guardian/config.toml";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    /// Diagnosis collaborator base URL
    #[serde(default = "default_diagnostico_url")]
    pub diagnostico_url: String,

    /// Action collaborator base URL
    #[serde(default = "default_acao_url")]
    pub acao_url: String,

    /// Monitoring collaborator base URL
    #[serde(default = "default_monitoramento_url")]
    pub monitoramento_url: String,

    /// Guardian cycle interval in seconds
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,

    /// Bounded history capacity for diagnostics
    #[serde(default = "default_history_max")]
    pub diagnostics_history_max: usize,

    /// Bounded history capacity for action plans
    #[serde(default = "default_history_max")]
    pub action_plans_history_max: usize,

    /// Coherence check trips when the low-confidence ratio exceeds this (0-1)
    #[serde(default = "default_incoherence_threshold")]
    pub incoherence_threshold: f64,

    /// Efficacy check trips when mean efficacy falls below this (0-1)
    #[serde(default = "default_low_efficacy_threshold")]
    pub low_efficacy_threshold: f64,

    /// Time window for the decision stability check, in seconds
    #[serde(default = "default_stability_window")]
    pub stability_window_seconds: u64,

    /// Cancelled plans tolerated within the stability window
    #[serde(default = "default_max_cancelled_plans")]
    pub max_cancelled_plans: usize,

    /// Minimum sample size below which a check is skipped
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: usize,

    /// Namespace holding the emergency target workloads
    #[serde(default = "default_emergency_namespace")]
    pub emergency_namespace: String,

    /// Workloads scaled to zero by the emergency protocol
    #[serde(default = "default_emergency_targets")]
    pub emergency_target_workloads: Vec<String>,

    /// Webhook receiving emergency alerts. Alerting is skipped when unset.
    #[serde(default)]
    pub alert_webhook_url: Option<String>,

    /// Cluster API server base URL. Scale-down is skipped when unset.
    #[serde(default)]
    pub cluster_api_url: Option<String>,

    /// Bearer token for the cluster API
    #[serde(default, skip_serializing)]
    pub cluster_api_token: Option<String>,

    /// HTTP listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory holding the persisted state document and audit logs
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Orchestrator cycle interval in seconds
    #[serde(default = "default_orchestrator_interval")]
    pub orchestrator_interval_seconds: u64,

    /// Attempts for a persistence write before surfacing a storage error
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,

    /// Fixed backoff between persistence attempts, in milliseconds
    #[serde(default = "default_persist_backoff_ms")]
    pub persist_backoff_ms: u64,

    /// Bounded timeout for all outbound HTTP calls, in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,

    /// Attempts for a collaborator call before falling back to local history
    #[serde(default = "default_collaborator_retries")]
    pub collaborator_retries: u32,
}

fn default_diagnostico_url() -> String {
    "http://localhost:5001".to_string()
}

fn default_acao_url() -> String {
    "http://localhost:5002".to_string()
}

fn default_monitoramento_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_check_interval() -> u64 {
    60
}

fn default_history_max() -> usize {
    100
}

fn default_incoherence_threshold() -> f64 {
    0.7
}

fn default_low_efficacy_threshold() -> f64 {
    0.3
}

fn default_stability_window() -> u64 {
    3600
}

fn default_max_cancelled_plans() -> usize {
    3
}

fn default_min_sample_size() -> usize {
    3
}

fn default_emergency_namespace() -> String {
    "default".to_string()
}

fn default_emergency_targets() -> Vec<String> {
    vec![
        "monitoramento".to_string(),
        "diagnostico".to_string(),
        "acoes".to_string(),
    ]
}

fn default_bind_addr() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/guardian")
}

fn default_orchestrator_interval() -> u64 {
    30
}

fn default_persist_retries() -> u32 {
    3
}

fn default_persist_backoff_ms() -> u64 {
    200
}

fn default_http_timeout() -> u64 {
    5
}

fn default_collaborator_retries() -> u32 {
    3
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            diagnostico_url: default_diagnostico_url(),
            acao_url: default_acao_url(),
            monitoramento_url: default_monitoramento_url(),
            check_interval_seconds: default_check_interval(),
            diagnostics_history_max: default_history_max(),
            action_plans_history_max: default_history_max(),
            incoherence_threshold: default_incoherence_threshold(),
            low_efficacy_threshold: default_low_efficacy_threshold(),
            stability_window_seconds: default_stability_window(),
            max_cancelled_plans: default_max_cancelled_plans(),
            min_sample_size: default_min_sample_size(),
            emergency_namespace: default_emergency_namespace(),
            emergency_target_workloads: default_emergency_targets(),
            alert_webhook_url: None,
            cluster_api_url: None,
            cluster_api_token: None,
            bind_addr: default_bind_addr(),
            state_dir: default_state_dir(),
            orchestrator_interval_seconds: default_orchestrator_interval(),
            persist_retries: default_persist_retries(),
            persist_backoff_ms: default_persist_backoff_ms(),
            http_timeout_seconds: default_http_timeout(),
            collaborator_retries: default_collaborator_retries(),
        }
    }
}

impl GuardianConfig {
    /// Load config from file and environment, validating before use.
    pub fn load() -> Result<Self, GuardianError> {
        let mut config = Self::load_from_file(CONFIG_PATH)
            .or_else(|| Self::load_from_file(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|| {
                warn!("Config file not found, using defaults");
                GuardianConfig::default()
            });

        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &str) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => {
                info!("Loaded config from {}", path);
                Some(config)
            }
            Err(e) => {
                warn!("Ignoring unreadable config {}: {}", path, e);
                None
            }
        }
    }

    /// Apply GUARDIAN_* environment overrides, one variable per key.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), GuardianError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env: HashMap<String, String> = vars
            .into_iter()
            .filter(|(k, _)| k.starts_with("GUARDIAN_"))
            .collect();

        let get = |key: &str| env.get(&format!("GUARDIAN_{}", key.to_uppercase())).cloned();

        if let Some(v) = get("diagnostico_url") {
            self.diagnostico_url = v;
        }
        if let Some(v) = get("acao_url") {
            self.acao_url = v;
        }
        if let Some(v) = get("monitoramento_url") {
            self.monitoramento_url = v;
        }
        if let Some(v) = get("check_interval_seconds") {
            self.check_interval_seconds = parse_num(&v, "check_interval_seconds")?;
        }
        if let Some(v) = get("diagnostics_history_max") {
            self.diagnostics_history_max = parse_num(&v, "diagnostics_history_max")?;
        }
        if let Some(v) = get("action_plans_history_max") {
            self.action_plans_history_max = parse_num(&v, "action_plans_history_max")?;
        }
        if let Some(v) = get("incoherence_threshold") {
            self.incoherence_threshold = parse_num(&v, "incoherence_threshold")?;
        }
        if let Some(v) = get("low_efficacy_threshold") {
            self.low_efficacy_threshold = parse_num(&v, "low_efficacy_threshold")?;
        }
        if let Some(v) = get("stability_window_seconds") {
            self.stability_window_seconds = parse_num(&v, "stability_window_seconds")?;
        }
        if let Some(v) = get("max_cancelled_plans") {
            self.max_cancelled_plans = parse_num(&v, "max_cancelled_plans")?;
        }
        if let Some(v) = get("min_sample_size") {
            self.min_sample_size = parse_num(&v, "min_sample_size")?;
        }
        if let Some(v) = get("emergency_namespace") {
            self.emergency_namespace = v;
        }
        if let Some(v) = get("emergency_target_workloads") {
            self.emergency_target_workloads = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = get("alert_webhook_url") {
            self.alert_webhook_url = Some(v);
        }
        if let Some(v) = get("cluster_api_url") {
            self.cluster_api_url = Some(v);
        }
        if let Some(v) = get("cluster_api_token") {
            self.cluster_api_token = Some(v);
        }
        if let Some(v) = get("bind_addr") {
            self.bind_addr = v;
        }
        if let Some(v) = get("state_dir") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = get("orchestrator_interval_seconds") {
            self.orchestrator_interval_seconds = parse_num(&v, "orchestrator_interval_seconds")?;
        }
        if let Some(v) = get("persist_retries") {
            self.persist_retries = parse_num(&v, "persist_retries")?;
        }
        if let Some(v) = get("persist_backoff_ms") {
            self.persist_backoff_ms = parse_num(&v, "persist_backoff_ms")?;
        }
        if let Some(v) = get("http_timeout_seconds") {
            self.http_timeout_seconds = parse_num(&v, "http_timeout_seconds")?;
        }
        if let Some(v) = get("collaborator_retries") {
            self.collaborator_retries = parse_num(&v, "collaborator_retries")?;
        }

        Ok(())
    }

    /// Reject configurations the guardian cannot safely run with.
    pub fn validate(&self) -> Result<(), GuardianError> {
        for (name, url) in [
            ("diagnostico_url", &self.diagnostico_url),
            ("acao_url", &self.acao_url),
            ("monitoramento_url", &self.monitoramento_url),
        ] {
            reqwest::Url::parse(url).map_err(|e| {
                GuardianError::Configuration(format!("{} is not a valid URL ({}): {}", name, url, e))
            })?;
        }
        for (name, url) in [
            ("alert_webhook_url", &self.alert_webhook_url),
            ("cluster_api_url", &self.cluster_api_url),
        ] {
            if let Some(url) = url {
                reqwest::Url::parse(url).map_err(|e| {
                    GuardianError::Configuration(format!(
                        "{} is not a valid URL ({}): {}",
                        name, url, e
                    ))
                })?;
            }
        }
        for (name, value) in [
            ("incoherence_threshold", self.incoherence_threshold),
            ("low_efficacy_threshold", self.low_efficacy_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                return Err(GuardianError::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.check_interval_seconds == 0 {
            return Err(GuardianError::Configuration(
                "check_interval_seconds must be at least 1".to_string(),
            ));
        }
        if self.diagnostics_history_max == 0 || self.action_plans_history_max == 0 {
            return Err(GuardianError::Configuration(
                "history capacities must be at least 1".to_string(),
            ));
        }
        if self.min_sample_size == 0 {
            return Err(GuardianError::Configuration(
                "min_sample_size must be at least 1".to_string(),
            ));
        }
        if self.emergency_namespace.trim().is_empty() {
            return Err(GuardianError::Configuration(
                "emergency_namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_secs(self.stability_window_seconds)
    }

    pub fn orchestrator_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator_interval_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn persist_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_backoff_ms)
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, GuardianError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        GuardianError::Configuration(format!("GUARDIAN_{}: {}", key.to_uppercase(), e))
    })
}
