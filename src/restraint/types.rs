use crate::execution::types::Ambiance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of one claim against a resource unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerState {
    Active,
    Blocked,
    Finished,
    /// Turned away at registration by the queue-length gate; never persisted
    Rejected,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Blocked => "BLOCKED",
            Self::Finished => "FINISHED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Instances that still hold or wait for capacity
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Blocked)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsumerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "BLOCKED" => Ok(Self::Blocked),
            "FINISHED" => Ok(Self::Finished),
            "REJECTED" => Ok(Self::Rejected),
            _ => Err(format!("Invalid consumer state: {s}")),
        }
    }
}

/// Kind of entity whose termination releases the claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldingScope {
    Plan,
    Pipeline,
    Stage,
}

impl HoldingScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "PLAN",
            Self::Pipeline => "PIPELINE",
            Self::Stage => "STAGE",
        }
    }

    /// Release entity id for this scope, taken from the ambiance
    pub fn release_entity_id(&self, ambiance: &Ambiance) -> Option<String> {
        match self {
            Self::Plan | Self::Pipeline => Some(ambiance.plan_execution_id.clone())
                .filter(|id| !id.is_empty()),
            Self::Stage => ambiance.stage_execution_id.clone(),
        }
    }
}

impl fmt::Display for HoldingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HoldingScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLAN" => Ok(Self::Plan),
            "PIPELINE" => Ok(Self::Pipeline),
            "STAGE" => Ok(Self::Stage),
            _ => Err(format!("Invalid holding scope: {s}")),
        }
    }
}

/// How requested permits combine with permits the releasing entity already holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquireMode {
    /// Request the permits on top of anything already held
    #[default]
    Accumulate,
    /// Request only what is missing to reach the permit count
    Ensure,
}

/// One consumer in the persisted ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestraintInstance {
    /// Consumer id; also the callback id a blocked step waits on
    pub id: String,
    pub resource_unit: String,
    pub release_entity_type: HoldingScope,
    pub release_entity_id: String,
    pub permits: i32,
    pub order: i64,
    pub state: ConsumerState,
    pub acquired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A request for admission to a resource unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub resource_unit: String,
    pub consumer_id: String,
    pub permits: i32,
    pub holding_scope: HoldingScope,
    pub release_entity_id: String,
    /// Account used for feature flag lookups
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationOutcome {
    pub consumer_id: String,
    /// `None` when the consumer was rejected and never persisted
    pub order: Option<i64>,
    pub state: ConsumerState,
}

/// Liveness of the entity that holds a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseEntityStatus {
    Running,
    Finished,
    /// No record of the entity; its claims are orphaned
    Missing,
}

/// Counts from one cleanup sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub examined: usize,
    pub finished: usize,
    pub promoted: usize,
    pub failures: usize,
}

/// Outcome reported by a resource restraint step once it holds its permits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRestraintOutcome {
    pub resource_unit: String,
    pub capacity: i32,
    pub usage: i32,
    pub already_acquired_permits: i32,
}
