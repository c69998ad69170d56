use cbf_model::{CommandStatus, ModelError, ObsState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CbfError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid frequency range: {0}")]
    InvalidRange(String),

    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    #[error("Command {command} not allowed in obsState {state}")]
    InvalidState { command: String, state: ObsState },

    #[error("Remote command {command} on {resource} failed: {reason}")]
    RemoteCommand {
        resource: String,
        command: String,
        reason: String,
        transient: bool,
    },

    #[error("Operation aborted: {0}")]
    AbortRequested(String),

    #[error("Command queue full ({capacity} commands)")]
    QueueFull { capacity: usize },

    #[error("Illegal command status transition {from} -> {to}")]
    StatusTransition {
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CbfError {
    /// Timeouts and transport failures may be retried; explicit remote
    /// rejections and caller errors may not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CbfError::RemoteCommand { transient: true, .. })
    }

    pub fn invalid_state(command: impl Into<String>, state: ObsState) -> Self {
        CbfError::InvalidState {
            command: command.into(),
            state,
        }
    }
}

impl From<ModelError> for CbfError {
    fn from(err: ModelError) -> Self {
        CbfError::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CbfError>;
