use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an execution node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created by the orchestrator, not yet started
    Queued,
    /// Start has been invoked on the executable
    Running,
    /// Waiting on one or more external callbacks
    SuspendedAsync,
    /// A callback fired and the executable is handling the responses
    Resumed,
    Succeeded,
    Failed,
    Aborted,
    Expired,
    /// Expected business outcome where the step had nothing to do
    Skipped,
}

/// Persisted tag table for [`ExecutionStatus`].
///
/// Rows are append-only: never renumber or delete a tag, only add new ones.
pub const EXECUTION_STATUS_TAGS: &[(i16, ExecutionStatus)] = &[
    (0, ExecutionStatus::Queued),
    (1, ExecutionStatus::Running),
    (2, ExecutionStatus::SuspendedAsync),
    (3, ExecutionStatus::Resumed),
    (4, ExecutionStatus::Succeeded),
    (5, ExecutionStatus::Failed),
    (6, ExecutionStatus::Aborted),
    (7, ExecutionStatus::Expired),
    (8, ExecutionStatus::Skipped),
];

impl ExecutionStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Aborted | Self::Expired | Self::Skipped
        )
    }

    /// Check if the node is waiting on external work
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::SuspendedAsync)
    }

    /// Check if the node is being actively processed
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Resumed)
    }

    /// Persisted tag for this status
    pub fn tag(&self) -> i16 {
        EXECUTION_STATUS_TAGS
            .iter()
            .find(|(_, status)| status == self)
            .map(|(tag, _)| *tag)
            .unwrap_or(-1)
    }

    /// Resolve a persisted tag
    pub fn from_tag(tag: i16) -> Option<Self> {
        EXECUTION_STATUS_TAGS
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, status)| *status)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::SuspendedAsync => write!(f, "suspended_async"),
            Self::Resumed => write!(f, "resumed"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Expired => write!(f, "expired"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "suspended_async" => Ok(Self::SuspendedAsync),
            "resumed" => Ok(Self::Resumed),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            "expired" => Ok(Self::Expired),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_check() {
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Aborted.is_terminal());
        assert!(ExecutionStatus::Expired.is_terminal());
        assert!(ExecutionStatus::Skipped.is_terminal());
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::SuspendedAsync.is_terminal());
        assert!(!ExecutionStatus::Resumed.is_terminal());
    }

    /// Tags are persisted; this table must only ever grow.
    #[test]
    fn test_status_tags_are_frozen() {
        let expected = [
            (0, "queued"),
            (1, "running"),
            (2, "suspended_async"),
            (3, "resumed"),
            (4, "succeeded"),
            (5, "failed"),
            (6, "aborted"),
            (7, "expired"),
            (8, "skipped"),
        ];
        assert!(EXECUTION_STATUS_TAGS.len() >= expected.len());
        for (tag, name) in expected {
            let status = ExecutionStatus::from_tag(tag).unwrap();
            assert_eq!(status.to_string(), name);
            assert_eq!(status.tag(), tag);
        }

        let mut tags: Vec<i16> = EXECUTION_STATUS_TAGS.iter().map(|(t, _)| *t).collect();
        tags.dedup();
        assert_eq!(tags.len(), EXECUTION_STATUS_TAGS.len());
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(ExecutionStatus::SuspendedAsync.to_string(), "suspended_async");
        assert_eq!(
            "expired".parse::<ExecutionStatus>().unwrap(),
            ExecutionStatus::Expired
        );
        assert!("unknown".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&ExecutionStatus::SuspendedAsync).unwrap();
        assert_eq!(json, "\"SUSPENDED_ASYNC\"");

        let parsed: ExecutionStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ExecutionStatus::SuspendedAsync);
    }
}
