//! Step implementations that record how the engine drives them

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use steprunner_core::error::EngineError;
use steprunner_core::execution::{
    AsyncChainExecutable, AsyncExecutable, AsyncExecutableResponse, ChainLinkResponse,
    Executable, PassThroughData, ResponseData, ResponseMap, StepContext, StepResponse,
    SyncExecutable,
};
use steprunner_core::state_machine::ExecutionStatus;

/// Echoes its inputs back as the outcome
pub struct EchoStep;

#[async_trait]
impl Executable for EchoStep {}

#[async_trait]
impl SyncExecutable for EchoStep {
    async fn execute_sync(&self, ctx: &StepContext) -> anyhow::Result<StepResponse> {
        Ok(StepResponse::succeeded(Some(ctx.inputs.clone())))
    }
}

pub struct FailingStep {
    pub error: fn() -> anyhow::Error,
}

#[async_trait]
impl Executable for FailingStep {}

#[async_trait]
impl SyncExecutable for FailingStep {
    async fn execute_sync(&self, _ctx: &StepContext) -> anyhow::Result<StepResponse> {
        Err((self.error)())
    }
}

/// Waits on a fixed set of callbacks and counts every hook invocation
#[derive(Default)]
pub struct RecordingAsyncStep {
    pub callback_ids: Vec<String>,
    pub timeout: Option<Duration>,
    pub short_circuit: Option<ExecutionStatus>,
    pub aggregate_failures: bool,
    pub responses_handled: AtomicUsize,
    pub single_callbacks: Mutex<Vec<String>>,
    pub aborts: Mutex<Vec<Vec<String>>>,
    pub progress: Mutex<Vec<Value>>,
}

impl RecordingAsyncStep {
    pub fn waiting_on(ids: &[&str]) -> Self {
        Self {
            callback_ids: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn handled(&self) -> usize {
        self.responses_handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executable for RecordingAsyncStep {
    async fn handle_abort(&self, _ctx: &StepContext, callback_ids: &[String]) -> anyhow::Result<()> {
        self.aborts.lock().push(callback_ids.to_vec());
        Ok(())
    }

    async fn handle_progress(&self, _ctx: &StepContext, progress: &Value) -> anyhow::Result<()> {
        self.progress.lock().push(progress.clone());
        Ok(())
    }
}

#[async_trait]
impl AsyncExecutable for RecordingAsyncStep {
    async fn execute_async(&self, _ctx: &StepContext) -> anyhow::Result<AsyncExecutableResponse> {
        if let Some(status) = self.short_circuit {
            return Ok(AsyncExecutableResponse::short_circuit(status));
        }
        let response = AsyncExecutableResponse::waiting_on(self.callback_ids.clone());
        Ok(match self.timeout {
            Some(timeout) => response.with_timeout(timeout),
            None => response,
        })
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse> {
        self.responses_handled.fetch_add(1, Ordering::SeqCst);
        let mut received: Vec<&String> = responses.keys().collect();
        received.sort();
        let errors = responses.values().filter(|r| r.is_error()).count();
        Ok(StepResponse::succeeded(Some(
            json!({"received": received, "errors": errors}),
        )))
    }

    async fn handle_single_callback(
        &self,
        _ctx: &StepContext,
        callback_id: &str,
        _response: &ResponseData,
    ) -> anyhow::Result<()> {
        self.single_callbacks.lock().push(callback_id.to_string());
        Ok(())
    }

    fn aggregates_failures(&self) -> bool {
        self.aggregate_failures
    }
}

/// Two links, then finalize with the accumulated pass-through data
#[derive(Default)]
pub struct TwoLinkChain {
    pub finalized: AtomicUsize,
    pub links_started: AtomicUsize,
}

impl TwoLinkChain {
    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executable for TwoLinkChain {}

#[async_trait]
impl AsyncChainExecutable for TwoLinkChain {
    async fn start_chain_link(&self, ctx: &StepContext) -> anyhow::Result<ChainLinkResponse> {
        self.links_started.fetch_add(1, Ordering::SeqCst);
        Ok(ChainLinkResponse::link(
            format!("{}-link-1", ctx.execution_id()),
            false,
            PassThroughData::default().insert("visited", json!(["link-1"])),
        ))
    }

    async fn execute_next_link(
        &self,
        ctx: &StepContext,
        pass_through: &PassThroughData,
        responses: &ResponseMap,
    ) -> anyhow::Result<ChainLinkResponse> {
        if responses.values().any(ResponseData::is_error) {
            return Err(EngineError::HandlerError("link-1 reported an error".to_string()).into());
        }
        self.links_started.fetch_add(1, Ordering::SeqCst);
        let mut visited = pass_through
            .get("visited")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        visited.push(json!("link-2"));
        Ok(ChainLinkResponse::link(
            format!("{}-link-2", ctx.execution_id()),
            true,
            pass_through.clone().insert("visited", Value::Array(visited)),
        ))
    }

    async fn finalize_execution(
        &self,
        _ctx: &StepContext,
        pass_through: &PassThroughData,
        _responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(StepResponse::succeeded(pass_through.get("visited").cloned()))
    }
}
