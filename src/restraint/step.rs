//! Async step that holds a workflow node until it is admitted to a resource unit

use super::service::RestraintService;
use super::types::{
    AcquireMode, ConsumerState, HoldingScope, RegistrationRequest, ResourceRestraintOutcome,
};
use crate::error::EngineError;
use crate::execution::executable::{AsyncExecutable, Executable};
use crate::execution::types::{AsyncExecutableResponse, ResponseMap, StepContext, StepResponse};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub const RESOURCE_RESTRAINT_STEP_TYPE: &str = "ResourceConstraint";

/// Step parameters of a resource restraint step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRestraintSpec {
    pub resource_unit: String,
    #[serde(default = "default_permits")]
    pub permits: i32,
    #[serde(default = "default_scope")]
    pub holding_scope: HoldingScope,
    #[serde(default)]
    pub acquire_mode: AcquireMode,
    /// How long a queued consumer waits before the step expires
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_permits() -> i32 {
    1
}

fn default_scope() -> HoldingScope {
    HoldingScope::Pipeline
}

impl ResourceRestraintSpec {
    fn from_context(ctx: &StepContext) -> anyhow::Result<Self> {
        serde_json::from_value(ctx.step_parameters.clone())
            .context("invalid resource restraint parameters")
    }

    fn release_entity_id(&self, ctx: &StepContext) -> anyhow::Result<String> {
        self.holding_scope
            .release_entity_id(&ctx.ambiance)
            .with_context(|| {
                format!(
                    "no release entity for holding scope {} on execution {}",
                    self.holding_scope,
                    ctx.execution_id()
                )
            })
    }
}

pub struct ResourceRestraintStep {
    service: Arc<RestraintService>,
}

impl ResourceRestraintStep {
    pub fn new(service: Arc<RestraintService>) -> Self {
        Self { service }
    }

    /// Release queued consumers so they stop holding a place in line
    async fn release(&self, callback_ids: &[String]) -> anyhow::Result<()> {
        for consumer_id in callback_ids {
            self.service.finish_and_promote(consumer_id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Executable for ResourceRestraintStep {
    async fn handle_abort(&self, ctx: &StepContext, callback_ids: &[String]) -> anyhow::Result<()> {
        info!(execution_id = %ctx.execution_id(), "Resource restraint step aborted");
        self.release(callback_ids).await
    }

    async fn handle_timeout(
        &self,
        ctx: &StepContext,
        pending_callback_ids: &[String],
    ) -> anyhow::Result<StepResponse> {
        self.release(pending_callback_ids).await?;
        Ok(StepResponse::expired(format!(
            "Execution {} timed out waiting for resource admission",
            ctx.execution_id()
        )))
    }
}

#[async_trait]
impl AsyncExecutable for ResourceRestraintStep {
    async fn execute_async(&self, ctx: &StepContext) -> anyhow::Result<AsyncExecutableResponse> {
        let spec = ResourceRestraintSpec::from_context(ctx)?;
        let release_entity_id = spec.release_entity_id(ctx)?;

        let mut permits = spec.permits;
        if spec.acquire_mode == AcquireMode::Ensure {
            permits -= self
                .service
                .acquired_permits(spec.holding_scope, &release_entity_id, &spec.resource_unit)
                .await?;
        }
        // Already holds enough: nothing to wait on
        if permits <= 0 {
            return Ok(AsyncExecutableResponse::default());
        }

        let consumer_id = Uuid::new_v4().to_string();
        let outcome = self
            .service
            .register(&RegistrationRequest {
                resource_unit: spec.resource_unit.clone(),
                consumer_id: consumer_id.clone(),
                permits,
                holding_scope: spec.holding_scope,
                release_entity_id,
                account_id: ctx.ambiance.account_id.clone(),
            })
            .await?;

        match outcome.state {
            ConsumerState::Active => Ok(AsyncExecutableResponse::default()),
            ConsumerState::Rejected => Err(EngineError::ConsumerRejected {
                consumer_id,
                resource_unit: spec.resource_unit,
                reason: "found already running resource constraints".to_string(),
            }
            .into()),
            _ => {
                info!(
                    execution_id = %ctx.execution_id(),
                    resource_unit = %spec.resource_unit,
                    consumer_id = %consumer_id,
                    "Execution queued behind another holder of the resource unit"
                );
                let response = AsyncExecutableResponse::waiting_on(vec![consumer_id]);
                Ok(match spec.timeout_ms {
                    Some(ms) => response.with_timeout(Duration::from_millis(ms)),
                    None => response,
                })
            }
        }
    }

    async fn handle_async_response(
        &self,
        ctx: &StepContext,
        _responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse> {
        let spec = ResourceRestraintSpec::from_context(ctx)?;
        let release_entity_id = spec.release_entity_id(ctx)?;

        let outcome = ResourceRestraintOutcome {
            capacity: self.service.capacity(&spec.resource_unit).await?,
            usage: spec.permits,
            already_acquired_permits: self
                .service
                .acquired_permits(spec.holding_scope, &release_entity_id, &spec.resource_unit)
                .await?,
            resource_unit: spec.resource_unit,
        };
        Ok(StepResponse::succeeded(Some(serde_json::to_value(outcome)?)))
    }
}
