use super::states::ExecutionStatus;
use serde::{Deserialize, Serialize};

/// Events that can trigger execution node transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExecutionEvent {
    /// Start invoked on the executable
    Start,
    /// Executable returned pending callback ids
    Suspend,
    /// A registered waiter fired
    Resume,
    Succeed,
    /// Mark node as failed with error message
    Fail(String),
    Abort,
    Expire,
    Skip,
}

impl ExecutionEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Succeed => "succeed",
            Self::Fail(_) => "fail",
            Self::Abort => "abort",
            Self::Expire => "expire",
            Self::Skip => "skip",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeed | Self::Fail(_) | Self::Abort | Self::Expire | Self::Skip
        )
    }

    /// Build the concluding event for a terminal step status
    pub fn conclude_with(status: ExecutionStatus, message: Option<&str>) -> Option<Self> {
        match status {
            ExecutionStatus::Succeeded => Some(Self::Succeed),
            ExecutionStatus::Failed => Some(Self::Fail(message.unwrap_or_default().to_string())),
            ExecutionStatus::Aborted => Some(Self::Abort),
            ExecutionStatus::Expired => Some(Self::Expire),
            ExecutionStatus::Skipped => Some(Self::Skip),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conclude_with_terminal_statuses() {
        assert_eq!(
            ExecutionEvent::conclude_with(ExecutionStatus::Succeeded, None),
            Some(ExecutionEvent::Succeed)
        );
        assert_eq!(
            ExecutionEvent::conclude_with(ExecutionStatus::Failed, Some("boom")),
            Some(ExecutionEvent::Fail("boom".to_string()))
        );
        assert_eq!(
            ExecutionEvent::conclude_with(ExecutionStatus::Running, None),
            None
        );
    }

    #[test]
    fn test_event_serde() {
        let json = serde_json::to_value(ExecutionEvent::Fail("x".to_string())).unwrap();
        assert_eq!(json["type"], "Fail");
        assert_eq!(json["data"], "x");
    }
}
