//! Error types for the guardian control plane.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardianError {
    /// Remote collaborator unreachable or timed out. Retried with backoff,
    /// then the affected check is skipped for the current cycle.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Persistence write failure. The in-memory state is rolled back to the
    /// last known good snapshot before this is surfaced.
    #[error("storage error: {0}")]
    Storage(String),

    /// Missing or invalid required configuration at startup. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed payload at an ingestion boundary. Maps to HTTP 400.
    #[error("malformed data: {0}")]
    Data(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GuardianError {
    /// Whether this error came from a remote boundary rather than local state.
    pub fn is_remote(&self) -> bool {
        matches!(self, GuardianError::Connectivity(_))
    }
}
