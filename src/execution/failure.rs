//! Converts handler errors into terminal step responses.
//!
//! Nothing raised by an executable escapes the engine: every error becomes a
//! `FAILED` response carrying the message and its category.

use super::types::StepResponse;
use crate::error::{EngineError, ErrorCategory};

pub fn translate_failure(error: anyhow::Error) -> StepResponse {
    let category = error
        .downcast_ref::<EngineError>()
        .map(EngineError::category)
        .unwrap_or(ErrorCategory::Fatal);

    // Alternate formatting keeps the context chain: "outer: inner: root"
    StepResponse::failed(format!("{error:#}"), category)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ExecutionStatus;
    use anyhow::Context;

    #[test]
    fn test_plain_error_is_fatal() {
        let response = translate_failure(anyhow::anyhow!("manifest not found"));
        assert_eq!(response.status, ExecutionStatus::Failed);
        assert_eq!(response.failure_message(), Some("manifest not found"));
        assert_eq!(response.failure.unwrap().category, ErrorCategory::Fatal);
    }

    #[test]
    fn test_engine_error_keeps_category() {
        let err = anyhow::Error::new(EngineError::Contended {
            resource_unit: "repo".to_string(),
            attempts: 3,
        });
        let response = translate_failure(err);
        assert_eq!(response.failure.unwrap().category, ErrorCategory::Transient);
    }

    #[test]
    fn test_context_chain_in_message() {
        let result: anyhow::Result<()> =
            Err(anyhow::anyhow!("connection refused")).context("calling deploy service");
        let response = translate_failure(result.unwrap_err());
        assert_eq!(
            response.failure_message(),
            Some("calling deploy service: connection refused")
        );
    }
}
