//! Error types for the step runner core.
//!
//! Every fallible operation in the crate returns [`EngineResult`]. Errors are
//! classified into the three categories the orchestrator cares about when it
//! decides what to do next: retry the call, fail the step permanently, or
//! report an expected business outcome.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a caller should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Contention or lost races. Safe to retry, never shown to end users.
    Transient,
    /// Configuration or data inconsistencies. Never retried.
    Fatal,
    /// Expected outcomes such as insufficient data, reported with a reason.
    Business,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("State transition error: {0}")]
    StateTransitionError(String),

    #[error("Execution {execution_id} not found")]
    ExecutionNotFound { execution_id: String },

    #[error("No executable registered for step type {step_type}")]
    HandlerNotFound { step_type: String },

    #[error("Cannot register callbacks for execution {execution_id}: status {status} is already terminal")]
    NoOpOnTerminalStatus { execution_id: String, status: String },

    #[error("Callback {callback_id} is already bound to execution {execution_id}")]
    DuplicateCallback {
        callback_id: String,
        execution_id: String,
    },

    #[error("Step handler failed: {0}")]
    HandlerError(String),

    #[error("Resource unit {resource_unit} is contended after {attempts} attempts")]
    Contended {
        resource_unit: String,
        attempts: u32,
    },

    #[error("Lease on resource unit {resource_unit} lapsed before the write")]
    LeaseLost { resource_unit: String },

    #[error("Order {order} already taken on resource unit {resource_unit}")]
    DuplicateOrder { resource_unit: String, order: i64 },

    #[error("Invalid permits {permits} for resource unit {resource_unit} with capacity {capacity}")]
    InvalidPermits {
        resource_unit: String,
        permits: i32,
        capacity: i32,
    },

    #[error("Consumer {consumer_id} rejected on resource unit {resource_unit}: {reason}")]
    ConsumerRejected {
        consumer_id: String,
        resource_unit: String,
        reason: String,
    },

    #[error("Notification error: {0}")]
    NotificationError(String),
}

impl EngineError {
    /// Classify the error for retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Contended { .. }
            | Self::LeaseLost { .. }
            | Self::DuplicateOrder { .. }
            | Self::DatabaseError(_) => ErrorCategory::Transient,
            Self::ConsumerRejected { .. } => ErrorCategory::Business,
            Self::SerializationError(_)
            | Self::ConfigurationError(_)
            | Self::ValidationError(_)
            | Self::StateTransitionError(_)
            | Self::ExecutionNotFound { .. }
            | Self::HandlerNotFound { .. }
            | Self::NoOpOnTerminalStatus { .. }
            | Self::DuplicateCallback { .. }
            | Self::HandlerError(_)
            | Self::InvalidPermits { .. }
            | Self::NotificationError(_) => ErrorCategory::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::SerializationError(error.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::DatabaseError(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigurationError(err.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
