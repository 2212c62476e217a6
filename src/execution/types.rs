//! # Execution Data Model
//!
//! Value types threaded through the strategy engine: the execution node, the
//! opaque ambiance carrier, executable responses, chain continuation state and
//! the persisted continuation record that lets any worker resume a node.

use crate::error::{EngineError, ErrorCategory};
use crate::state_machine::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Responses keyed by callback id
pub type ResponseMap = HashMap<String, ResponseData>;

/// Opaque execution context carrier, passed through unmodified
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ambiance {
    pub execution_id: String,
    pub plan_execution_id: String,
    /// Execution ids of enclosing nodes, outermost first
    pub parent_chain: Vec<String>,
    pub account_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub stage_execution_id: Option<String>,
}

impl Ambiance {
    pub fn new(
        execution_id: impl Into<String>,
        plan_execution_id: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            plan_execution_id: plan_execution_id.into(),
            account_id: account_id.into(),
            ..Default::default()
        }
    }

    pub fn with_stage(mut self, stage_execution_id: impl Into<String>) -> Self {
        self.stage_execution_id = Some(stage_execution_id.into());
        self
    }
}

/// How an executable completes its work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sync,
    Async,
    AsyncChain,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
            Self::AsyncChain => write!(f, "async_chain"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "async_chain" => Ok(Self::AsyncChain),
            _ => Err(EngineError::SerializationError(format!(
                "Unknown execution mode: {s}"
            ))),
        }
    }
}

/// A workflow node currently executing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub execution_id: String,
    pub step_type: String,
    pub step_parameters: Value,
    pub inputs: Value,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub ambiance: Ambiance,
    /// Terminal response, recorded once the node concludes
    pub response: Option<StepResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionNode {
    pub fn new(
        ambiance: Ambiance,
        step_type: impl Into<String>,
        step_parameters: Value,
        inputs: Value,
        mode: ExecutionMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: ambiance.execution_id.clone(),
            step_type: step_type.into(),
            step_parameters,
            inputs,
            mode,
            status: ExecutionStatus::Queued,
            ambiance,
            response: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the context handed to executables
    pub fn context(&self) -> StepContext {
        StepContext {
            ambiance: self.ambiance.clone(),
            step_type: self.step_type.clone(),
            step_parameters: self.step_parameters.clone(),
            inputs: self.inputs.clone(),
        }
    }
}

/// Everything an executable sees about the node it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    pub ambiance: Ambiance,
    pub step_type: String,
    pub step_parameters: Value,
    pub inputs: Value,
}

impl StepContext {
    pub fn execution_id(&self) -> &str {
        &self.ambiance.execution_id
    }
}

/// Payload an external system posts against a callback id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseData {
    Success { data: Value },
    Error { message: String },
    /// Marker delivered in place of a response when the waiter expired
    Timeout,
    RestraintUnblocked { resource_unit: String },
}

impl ResponseData {
    pub fn success(data: Value) -> Self {
        Self::Success { data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Structured failure reason attached to failed responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    pub category: ErrorCategory,
}

/// Terminal result of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: ExecutionStatus,
    pub outcome: Option<Value>,
    pub failure: Option<FailureInfo>,
}

impl StepResponse {
    pub fn succeeded(outcome: Option<Value>) -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            outcome,
            failure: None,
        }
    }

    pub fn failed(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            outcome: None,
            failure: Some(FailureInfo {
                message: message.into(),
                category,
            }),
        }
    }

    pub fn expired(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Expired,
            outcome: None,
            failure: Some(FailureInfo {
                message: message.into(),
                category: ErrorCategory::Fatal,
            }),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Skipped,
            outcome: None,
            failure: Some(FailureInfo {
                message: reason.into(),
                category: ErrorCategory::Business,
            }),
        }
    }

    pub fn with_status(status: ExecutionStatus) -> Self {
        Self {
            status,
            outcome: None,
            failure: None,
        }
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.message.as_str())
    }
}

/// What an async executable returns from start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsyncExecutableResponse {
    pub callback_ids: Vec<String>,
    pub timeout: Option<Duration>,
    /// Set when the step short-circuited to a terminal status
    pub status: Option<ExecutionStatus>,
    pub log_keys: Vec<String>,
}

impl AsyncExecutableResponse {
    pub fn waiting_on(callback_ids: Vec<String>) -> Self {
        Self {
            callback_ids,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn short_circuit(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Opaque state carried between chain links
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassThroughData(pub serde_json::Map<String, Value>);

impl PassThroughData {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }
}

/// What one link of an async-chain executable returns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainLinkResponse {
    pub callback_id: Option<String>,
    pub chain_end: bool,
    pub pass_through: PassThroughData,
    pub timeout: Option<Duration>,
    pub status: Option<ExecutionStatus>,
}

impl ChainLinkResponse {
    pub fn link(callback_id: impl Into<String>, chain_end: bool, pass_through: PassThroughData) -> Self {
        Self {
            callback_id: Some(callback_id.into()),
            chain_end,
            pass_through,
            ..Default::default()
        }
    }
}

/// Continuation state between chain links, replaced wholesale by every link
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainDetails {
    pub should_end: bool,
    pub pass_through: PassThroughData,
}

/// Persisted record of a suspended node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContinuation {
    pub execution_id: String,
    pub mode: ExecutionMode,
    pub callback_ids: Vec<String>,
    pub chain_details: Option<ChainDetails>,
    pub timeout_ms: u64,
    pub registered_at: DateTime<Utc>,
}

/// One outstanding external completion ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncCallback {
    pub callback_id: String,
    pub execution_id: String,
    pub registered_at: DateTime<Utc>,
    pub timeout_ms: u64,
    pub step_parameters: Value,
    pub ambiance: Ambiance,
}

/// Result of starting a node
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Suspended { callback_ids: Vec<String> },
    Completed(StepResponse),
}

/// Result of resuming a node
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    Completed(StepResponse),
    /// The chain registered its next link
    NextLink { callback_ids: Vec<String> },
    /// Nothing to resume: node missing, terminal, or already resumed
    Ignored { reason: String },
}
