//! Single-callback and fan-out async execution

use super::{ExecutionStrategyEngine, LinkOutcome};
use crate::error::{EngineResult, ErrorCategory};
use crate::execution::executable::AsyncExecutable;
use crate::execution::failure::translate_failure;
use crate::execution::types::{
    AsyncExecutableResponse, ExecutionContinuation, ExecutionMode, ResponseData, ResponseMap,
    StepContext, StepResponse,
};
use std::sync::Arc;
use tracing::warn;

impl ExecutionStrategyEngine {
    /// Act on what `execute_async` returned: conclude, complete inline or suspend
    pub(super) async fn apply_async_response(
        &self,
        ctx: &StepContext,
        exec: &Arc<dyn AsyncExecutable>,
        response: AsyncExecutableResponse,
    ) -> EngineResult<LinkOutcome> {
        let execution_id = ctx.execution_id();

        if let Some(status) = response.status.filter(|s| s.is_terminal()) {
            if !response.callback_ids.is_empty() {
                warn!(
                    execution_id = %execution_id,
                    status = %status,
                    callbacks = response.callback_ids.len(),
                    "Terminal status returned with callback ids; callbacks not registered"
                );
            }
            let concluded = self
                .conclude(execution_id, StepResponse::with_status(status))
                .await?;
            return Ok(LinkOutcome::Completed(concluded));
        }

        if response.callback_ids.is_empty() {
            warn!(
                execution_id = %execution_id,
                step_type = %ctx.step_type,
                "Async executable returned zero callback ids; completing inline"
            );
            let result = exec
                .handle_async_response(ctx, &ResponseMap::new())
                .await
                .unwrap_or_else(translate_failure);
            return Ok(LinkOutcome::Completed(
                self.conclude(execution_id, result).await?,
            ));
        }

        self.suspend_or_fail(
            execution_id,
            ExecutionMode::Async,
            response.callback_ids,
            None,
            response.timeout,
        )
        .await
    }

    /// Aggregate resume: first failure wins unless the executable aggregates
    pub(super) async fn resume_async(
        &self,
        ctx: &StepContext,
        exec: &Arc<dyn AsyncExecutable>,
        continuation: &ExecutionContinuation,
        responses: &ResponseMap,
    ) -> EngineResult<StepResponse> {
        let execution_id = ctx.execution_id();

        if !exec.aggregates_failures() {
            let first_failure = continuation.callback_ids.iter().find_map(|id| {
                match responses.get(id) {
                    Some(ResponseData::Error { message }) => Some((id, message)),
                    _ => None,
                }
            });
            if let Some((callback_id, message)) = first_failure {
                let response = StepResponse::failed(
                    format!("Callback {callback_id} failed: {message}"),
                    ErrorCategory::Fatal,
                );
                return self.conclude(execution_id, response).await;
            }
        }

        let response = exec
            .handle_async_response(ctx, responses)
            .await
            .unwrap_or_else(translate_failure);
        self.conclude(execution_id, response).await
    }
}
