//! Async-chain execution: one callback per link, pass-through state between links

use super::{ExecutionStrategyEngine, LinkOutcome};
use crate::error::{EngineResult, ErrorCategory};
use crate::execution::executable::AsyncChainExecutable;
use crate::execution::failure::translate_failure;
use crate::execution::types::{
    ChainDetails, ChainLinkResponse, ExecutionMode, ResponseMap, StepContext, StepResponse,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Links a chain may complete inline, without a callback, before it is failed
const MAX_INLINE_LINKS: usize = 100;

impl ExecutionStrategyEngine {
    /// Act on a link response: conclude, suspend on its callback, or run the
    /// next link inline when the link carried no callback id
    pub(super) async fn apply_chain_link(
        &self,
        ctx: &StepContext,
        exec: &Arc<dyn AsyncChainExecutable>,
        mut link: ChainLinkResponse,
    ) -> EngineResult<LinkOutcome> {
        let execution_id = ctx.execution_id();

        for _ in 0..MAX_INLINE_LINKS {
            if let Some(status) = link.status.filter(|s| s.is_terminal()) {
                let concluded = self
                    .conclude(execution_id, StepResponse::with_status(status))
                    .await?;
                return Ok(LinkOutcome::Completed(concluded));
            }

            // Each link replaces the chain details wholesale
            let details = ChainDetails {
                should_end: link.chain_end,
                pass_through: link.pass_through,
            };

            if let Some(callback_id) = link.callback_id {
                return self
                    .suspend_or_fail(
                        execution_id,
                        ExecutionMode::AsyncChain,
                        vec![callback_id],
                        Some(details),
                        link.timeout,
                    )
                    .await;
            }

            warn!(
                execution_id = %execution_id,
                step_type = %ctx.step_type,
                "Chain link returned no callback id; continuing inline"
            );
            match self
                .advance_chain(ctx, exec, details, &ResponseMap::new())
                .await
            {
                ChainStep::Finished(response) => {
                    return Ok(LinkOutcome::Completed(
                        self.conclude(execution_id, response).await?,
                    ));
                }
                ChainStep::Next(next) => link = next,
            }
        }

        let response = StepResponse::failed(
            format!("Chain exceeded {MAX_INLINE_LINKS} links without a callback"),
            ErrorCategory::Fatal,
        );
        Ok(LinkOutcome::Completed(
            self.conclude(execution_id, response).await?,
        ))
    }

    pub(super) async fn resume_chain(
        &self,
        ctx: &StepContext,
        exec: &Arc<dyn AsyncChainExecutable>,
        details: ChainDetails,
        responses: &ResponseMap,
    ) -> EngineResult<LinkOutcome> {
        match self.advance_chain(ctx, exec, details, responses).await {
            ChainStep::Finished(response) => Ok(LinkOutcome::Completed(
                self.conclude(ctx.execution_id(), response).await?,
            )),
            ChainStep::Next(link) => self.apply_chain_link(ctx, exec, link).await,
        }
    }

    /// Finalize when the chain said so, otherwise compute the next link
    async fn advance_chain(
        &self,
        ctx: &StepContext,
        exec: &Arc<dyn AsyncChainExecutable>,
        details: ChainDetails,
        responses: &ResponseMap,
    ) -> ChainStep {
        if details.should_end {
            debug!(execution_id = %ctx.execution_id(), "Finalizing chain");
            let response = exec
                .finalize_execution(ctx, &details.pass_through, responses)
                .await
                .unwrap_or_else(translate_failure);
            return ChainStep::Finished(response);
        }

        match exec
            .execute_next_link(ctx, &details.pass_through, responses)
            .await
        {
            Ok(link) => ChainStep::Next(link),
            Err(e) => ChainStep::Finished(translate_failure(e)),
        }
    }
}

enum ChainStep {
    Finished(StepResponse),
    Next(ChainLinkResponse),
}
