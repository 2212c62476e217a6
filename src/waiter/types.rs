use crate::execution::types::ResponseMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// What to invoke once a waiter is satisfied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyCallback {
    /// Aggregate waiter: resume the execution with all responses
    Resume { execution_id: String },
    /// Per-id waiter: early delivery of a single callback
    SingleCallback {
        execution_id: String,
        callback_id: String,
    },
}

impl NotifyCallback {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Resume { execution_id } | Self::SingleCallback { execution_id, .. } => {
                execution_id
            }
        }
    }
}

/// Receives partial progress posted against a correlation id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCallback {
    pub execution_id: String,
}

/// Inbound event produced by the wait-notify engine
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Fired {
        wait_instance_id: String,
        callback: NotifyCallback,
        responses: ResponseMap,
        /// Correlation ids that never reported; non-empty only on timeout
        pending: Vec<String>,
        timed_out: bool,
    },
    Progress {
        execution_id: String,
        correlation_id: String,
        data: Value,
    },
}

/// One registration of interest in a set of correlation ids
#[derive(Debug, Clone, PartialEq)]
pub struct WaitInstance {
    pub id: String,
    pub callback: NotifyCallback,
    pub progress: Option<ProgressCallback>,
    pub correlation_ids: Vec<String>,
    /// `None` when registered with a zero timeout
    pub timeout: Option<Duration>,
    pub registered_at: DateTime<Utc>,
}

impl WaitInstance {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.timeout.and_then(|timeout| {
            chrono::Duration::from_std(timeout)
                .ok()
                .map(|d| self.registered_at + d)
        })
    }
}

/// A waiter that has no timeout and has been outstanding too long
#[derive(Debug, Clone, PartialEq)]
pub struct StaleWaiter {
    pub wait_instance_id: String,
    pub execution_id: String,
    pub missing_correlation_ids: Vec<String>,
    pub registered_at: DateTime<Utc>,
}
