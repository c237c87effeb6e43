use crate::record::SessionStatus;
use thiserror::Error;

/// Error types surfaced by the fleet to its collaborators
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Engine failed to start: {0}")]
    SpawnFailure(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Command timed out after {0}ms")]
    CommandTimeout(u128),

    #[error("Command execution failed: {0}")]
    CommandExecutionError(String),

    #[error("Rendering unavailable: {0}")]
    RenderingUnavailable(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl FleetError {
    pub fn not_found(session_id: impl Into<String>) -> Self {
        FleetError::NotFound(session_id.into())
    }

    /// Check if the caller may reasonably retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::ResourceExhausted(_) | FleetError::CommandTimeout(_)
        )
    }

    /// Check if this error means the session never came up
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, FleetError::SpawnFailure(_))
    }
}
