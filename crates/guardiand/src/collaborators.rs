//! HTTP clients for the remote collaborator services.
//!
//! The guardian consumes the diagnosis and action services read-only; the
//! orchestrator additionally asks the action service to generate new plans.
//! Every call goes through the shared retry policy with a bounded timeout,
//! and any surviving failure is a connectivity error the caller answers by
//! falling back to local history.

use crate::config::GuardianConfig;
use guardian_common::{ActionPlanRecord, DiagnosticRecord, GuardianError, RetryPolicy};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

pub struct CollaboratorClient {
    diagnostico_url: String,
    acao_url: String,
    monitoramento_url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl CollaboratorClient {
    pub fn new(config: &GuardianConfig) -> Result<Self, GuardianError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| GuardianError::Configuration(format!("http client: {}", e)))?;
        Ok(Self {
            diagnostico_url: config.diagnostico_url.trim_end_matches('/').to_string(),
            acao_url: config.acao_url.trim_end_matches('/').to_string(),
            monitoramento_url: config.monitoramento_url.trim_end_matches('/').to_string(),
            http,
            retry: RetryPolicy::new(
                config.collaborator_retries,
                Duration::from_millis(250),
                config.http_timeout(),
            ),
        })
    }

    /// Most recent diagnostics from the diagnosis service.
    pub async fn recent_diagnostics(
        &self,
        limit: usize,
    ) -> Result<Vec<DiagnosticRecord>, GuardianError> {
        let url = format!("{}/diagnosticos/recentes?limite={}", self.diagnostico_url, limit);
        let diagnostics: Vec<DiagnosticRecord> = self
            .retry
            .run("recent_diagnostics", || self.fetch_json(&url))
            .await?;
        debug!("Fetched {} diagnostics from collaborator", diagnostics.len());
        Ok(diagnostics)
    }

    /// Most recent concluded plans from the action service.
    pub async fn recent_concluded_plans(
        &self,
        limit: usize,
    ) -> Result<Vec<ActionPlanRecord>, GuardianError> {
        let url = format!("{}/planos/concluidos/recentes?limite={}", self.acao_url, limit);
        let plans: Vec<ActionPlanRecord> = self
            .retry
            .run("recent_concluded_plans", || self.fetch_json(&url))
            .await?;
        debug!("Fetched {} concluded plans from collaborator", plans.len());
        Ok(plans)
    }

    /// Ask the action service to generate a new plan.
    pub async fn request_action_generation(&self) -> Result<(), GuardianError> {
        let url = format!("{}/planos/gerar", self.acao_url);
        self.retry
            .run("request_action_generation", || async {
                let response = self
                    .http
                    .post(&url)
                    .json(&serde_json::json!({ "origem": "guardian" }))
                    .send()
                    .await
                    .map_err(connectivity)?;
                if !response.status().is_success() {
                    return Err(GuardianError::Connectivity(format!(
                        "{} returned {}",
                        url,
                        response.status()
                    )));
                }
                Ok(())
            })
            .await?;
        info!("Requested action generation from {}", self.acao_url);
        Ok(())
    }

    /// Whether the monitoring collaborator answers its health endpoint.
    pub async fn monitoring_reachable(&self) -> bool {
        let url = format!("{}/health", self.monitoramento_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GuardianError> {
        let response = self.http.get(url).send().await.map_err(connectivity)?;
        if !response.status().is_success() {
            return Err(GuardianError::Connectivity(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| GuardianError::Data(format!("{}: undecodable body: {}", url, e)))
    }
}

fn connectivity(e: reqwest::Error) -> GuardianError {
    if e.is_timeout() {
        GuardianError::Connectivity(format!("timed out: {}", e))
    } else {
        GuardianError::Connectivity(e.to_string())
    }
}
