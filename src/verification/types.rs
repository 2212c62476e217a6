use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub type HostSet = BTreeSet<String>;

/// Declared deployment topology of the verified service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentTopology {
    Canary,
    Rolling,
    BlueGreen,
    Auto,
}

impl FromStr for DeploymentTopology {
    type Err = EngineError;

    /// Unknown values are a fatal configuration error
    fn from_str(s: &str) -> EngineResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CANARY" => Ok(Self::Canary),
            "ROLLING" => Ok(Self::Rolling),
            "BLUE_GREEN" => Ok(Self::BlueGreen),
            "AUTO" => Ok(Self::Auto),
            _ => Err(EngineError::ConfigurationError(format!(
                "Unrecognized deployment topology: {s}"
            ))),
        }
    }
}

impl fmt::Display for DeploymentTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canary => write!(f, "CANARY"),
            Self::Rolling => write!(f, "ROLLING"),
            Self::BlueGreen => write!(f, "BLUE_GREEN"),
            Self::Auto => write!(f, "AUTO"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    #[default]
    Created,
    Running,
    Transition,
    Success,
    Failed,
    Retry,
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Transition => write!(f, "transition"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// Which comparison the analysis runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// New hosts against the hosts that were not replaced
    Canary,
    /// Whole fleet before deployment against whole fleet after
    ImprovisedCanary,
}

/// Downstream analysis task scheduled by an analysis state
pub type AnalysisTaskKind = AnalysisMode;

/// What a verification job is asked to verify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationInput {
    pub verification_task_id: String,
    /// Raw declared topology; parsed when sampling runs
    pub topology: String,
    pub pre_deployment_start: DateTime<Utc>,
    pub deployment_start: DateTime<Utc>,
    pub post_deployment_end: DateTime<Utc>,
}

/// State of a scheduled analysis task as reported by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisTaskStatus {
    Running,
    Success,
    Failed { reason: String },
}

/// Terminal result of a verification job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Succeeded {
        mode: AnalysisMode,
        control_hosts: HostSet,
        test_hosts: HostSet,
    },
    /// Expected business outcome, e.g. not enough host data to compare
    Skipped { reason: String },
    /// Gave up after exhausting retries
    Failed { reason: String, retry_count: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_parsing() {
        assert_eq!(
            "blue_green".parse::<DeploymentTopology>().unwrap(),
            DeploymentTopology::BlueGreen
        );
        assert_eq!(
            "CANARY".parse::<DeploymentTopology>().unwrap(),
            DeploymentTopology::Canary
        );

        let err = "SHADOW".parse::<DeploymentTopology>().unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Fatal);
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = VerificationOutcome::Failed {
            reason: "analysis failed".to_string(),
            retry_count: 3,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["retry_count"], 3);
    }
}
