//! Cluster orchestration API client.
//!
//! Only the operations the emergency protocol needs: patching a deployment
//! scale subresource to zero replicas, and a liveness probe for /health.
//! The client is stateless per call; there is no shared mutable state
//! beyond reqwest's connection pool.

use guardian_common::GuardianError;
use std::time::Duration;
use tracing::info;

pub struct ClusterClient {
    base: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ClusterClient {
    pub fn new(
        base: String,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GuardianError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(false)
            .build()
            .map_err(|e| GuardianError::Configuration(format!("cluster client: {}", e)))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    /// Patch a deployment's scale subresource to zero replicas. Not
    /// reversible here: restoring the workload is an operator action.
    pub async fn scale_to_zero(&self, namespace: &str, name: &str) -> Result<(), GuardianError> {
        let url = format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}/scale",
            self.base, namespace, name
        );
        let body = serde_json::json!({ "spec": { "replicas": 0 } });

        let mut request = self
            .http
            .patch(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GuardianError::Connectivity(format!("scale {}: {}", name, e)))?;
        if !response.status().is_success() {
            return Err(GuardianError::Connectivity(format!(
                "scale {} returned {}",
                name,
                response.status()
            )));
        }
        info!("Scaled {}/{} to zero replicas", namespace, name);
        Ok(())
    }

    /// Quick reachability probe against the API server version endpoint.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/version", self.base);
        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
