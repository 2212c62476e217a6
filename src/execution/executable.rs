//! # Executable Capabilities
//!
//! Step implementations plug into the engine through one of three traits,
//! chosen by how they complete: [`SyncExecutable`] returns a terminal response
//! straight away, [`AsyncExecutable`] hands back callback ids and is resumed
//! once they report, and [`AsyncChainExecutable`] hops through a sequence of
//! single-callback links carrying [`PassThroughData`] forward.
//!
//! All three share the signalling hooks on [`Executable`]. Handlers return
//! `anyhow::Result`; the engine converts any error into a terminal failure.

use super::types::{
    AsyncExecutableResponse, ChainLinkResponse, PassThroughData, ResponseData, ResponseMap,
    StepContext, StepResponse,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Signalling hooks shared by every executable
#[async_trait]
pub trait Executable: Send + Sync {
    /// User or system abort. Must tolerate arriving after the step already resumed.
    async fn handle_abort(&self, _ctx: &StepContext, _callback_ids: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_expire(&self, _ctx: &StepContext, _callback_ids: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_failure(&self, _ctx: &StepContext, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_progress(&self, _ctx: &StepContext, _progress: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Decide what a waiter timeout means for this step
    async fn handle_timeout(
        &self,
        ctx: &StepContext,
        pending_callback_ids: &[String],
    ) -> anyhow::Result<StepResponse> {
        Ok(StepResponse::expired(format!(
            "Execution {} timed out waiting on callbacks [{}]",
            ctx.execution_id(),
            pending_callback_ids.join(", ")
        )))
    }
}

#[async_trait]
pub trait SyncExecutable: Executable {
    async fn execute_sync(&self, ctx: &StepContext) -> anyhow::Result<StepResponse>;
}

#[async_trait]
pub trait AsyncExecutable: Executable {
    async fn execute_async(&self, ctx: &StepContext) -> anyhow::Result<AsyncExecutableResponse>;

    /// Runs once every outstanding callback has reported
    async fn handle_async_response(
        &self,
        ctx: &StepContext,
        responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse>;

    /// Early delivery of one callback when several are outstanding
    async fn handle_single_callback(
        &self,
        _ctx: &StepContext,
        _callback_id: &str,
        _response: &ResponseData,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// When true, error responses reach `handle_async_response` instead of
    /// failing the step on the first one
    fn aggregates_failures(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait AsyncChainExecutable: Executable {
    async fn start_chain_link(&self, ctx: &StepContext) -> anyhow::Result<ChainLinkResponse>;

    async fn execute_next_link(
        &self,
        ctx: &StepContext,
        pass_through: &PassThroughData,
        responses: &ResponseMap,
    ) -> anyhow::Result<ChainLinkResponse>;

    async fn finalize_execution(
        &self,
        ctx: &StepContext,
        pass_through: &PassThroughData,
        responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse>;
}

/// Capability set resolved for a step type
#[derive(Clone)]
pub enum StepExecutable {
    Sync(Arc<dyn SyncExecutable>),
    Async(Arc<dyn AsyncExecutable>),
    AsyncChain(Arc<dyn AsyncChainExecutable>),
}

impl StepExecutable {
    pub fn mode(&self) -> super::types::ExecutionMode {
        use super::types::ExecutionMode;
        match self {
            Self::Sync(_) => ExecutionMode::Sync,
            Self::Async(_) => ExecutionMode::Async,
            Self::AsyncChain(_) => ExecutionMode::AsyncChain,
        }
    }

    pub async fn handle_abort(&self, ctx: &StepContext, callback_ids: &[String]) -> anyhow::Result<()> {
        match self {
            Self::Sync(e) => e.handle_abort(ctx, callback_ids).await,
            Self::Async(e) => e.handle_abort(ctx, callback_ids).await,
            Self::AsyncChain(e) => e.handle_abort(ctx, callback_ids).await,
        }
    }

    pub async fn handle_expire(&self, ctx: &StepContext, callback_ids: &[String]) -> anyhow::Result<()> {
        match self {
            Self::Sync(e) => e.handle_expire(ctx, callback_ids).await,
            Self::Async(e) => e.handle_expire(ctx, callback_ids).await,
            Self::AsyncChain(e) => e.handle_expire(ctx, callback_ids).await,
        }
    }

    pub async fn handle_failure(&self, ctx: &StepContext, reason: &str) -> anyhow::Result<()> {
        match self {
            Self::Sync(e) => e.handle_failure(ctx, reason).await,
            Self::Async(e) => e.handle_failure(ctx, reason).await,
            Self::AsyncChain(e) => e.handle_failure(ctx, reason).await,
        }
    }

    pub async fn handle_progress(&self, ctx: &StepContext, progress: &Value) -> anyhow::Result<()> {
        match self {
            Self::Sync(e) => e.handle_progress(ctx, progress).await,
            Self::Async(e) => e.handle_progress(ctx, progress).await,
            Self::AsyncChain(e) => e.handle_progress(ctx, progress).await,
        }
    }

    pub async fn handle_timeout(
        &self,
        ctx: &StepContext,
        pending_callback_ids: &[String],
    ) -> anyhow::Result<StepResponse> {
        match self {
            Self::Sync(e) => e.handle_timeout(ctx, pending_callback_ids).await,
            Self::Async(e) => e.handle_timeout(ctx, pending_callback_ids).await,
            Self::AsyncChain(e) => e.handle_timeout(ctx, pending_callback_ids).await,
        }
    }
}

impl std::fmt::Debug for StepExecutable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StepExecutable::{}", self.mode())
    }
}
