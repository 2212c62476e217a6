use crate::error::EngineError;
use thiserror::Error;

/// Error types for execution node state machine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: Option<String>, to: String },

    #[error("Concurrent modification detected for execution {execution_id}")]
    ConcurrentModification { execution_id: String },

    #[error("Persistence operation failed: {reason}")]
    PersistenceFailed { reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

impl From<EngineError> for StateMachineError {
    fn from(err: EngineError) -> Self {
        Self::PersistenceFailed {
            reason: err.to_string(),
        }
    }
}

impl From<StateMachineError> for EngineError {
    fn from(err: StateMachineError) -> Self {
        EngineError::StateTransitionError(format!("{err}"))
    }
}
