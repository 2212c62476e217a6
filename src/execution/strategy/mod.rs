//! # Execution Strategy Engine
//!
//! Drives one node through start, zero or more resumptions and a terminal
//! response. Nothing is held in memory between the two entry points: a node
//! suspended by [`ExecutionStrategyEngine::start`] is described entirely by its
//! persisted status and continuation record, so whichever worker receives the
//! callback notification can call [`ExecutionStrategyEngine::resume`].
//!
//! Mode-specific handling lives in [`async_strategy`] and [`chain_strategy`].

mod async_strategy;
mod chain_strategy;

use super::executable::StepExecutable;
use super::failure::translate_failure;
use super::registry::StepRegistry;
use super::store::ExecutionStore;
use super::types::{
    Ambiance, AsyncCallback, ChainDetails, ExecutionContinuation, ExecutionMode, ExecutionNode, ResponseData,
    ResponseMap, ResumeOutcome, StartOutcome, StepContext, StepResponse,
};
use crate::config::ExecutionConfig;
use crate::constants::events;
use crate::error::{EngineError, EngineResult, ErrorCategory};
use crate::events::EventPublisher;
use crate::logging::log_execution_operation;
use crate::state_machine::{ExecutionEvent, ExecutionStatus, NodeStateMachine, StateMachineError};
use crate::waiter::{NotifyCallback, ProgressCallback, WaitNotifyEngine};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where a node stands after a suspend-or-complete decision
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LinkOutcome {
    Suspended(Vec<String>),
    Completed(StepResponse),
}

impl From<LinkOutcome> for StartOutcome {
    fn from(outcome: LinkOutcome) -> Self {
        match outcome {
            LinkOutcome::Suspended(callback_ids) => StartOutcome::Suspended { callback_ids },
            LinkOutcome::Completed(response) => StartOutcome::Completed(response),
        }
    }
}

impl From<LinkOutcome> for ResumeOutcome {
    fn from(outcome: LinkOutcome) -> Self {
        match outcome {
            LinkOutcome::Suspended(callback_ids) => ResumeOutcome::NextLink { callback_ids },
            LinkOutcome::Completed(response) => ResumeOutcome::Completed(response),
        }
    }
}

pub struct ExecutionStrategyEngine {
    registry: Arc<StepRegistry>,
    store: Arc<dyn ExecutionStore>,
    waiter: Arc<dyn WaitNotifyEngine>,
    publisher: EventPublisher,
    config: ExecutionConfig,
}

impl ExecutionStrategyEngine {
    pub fn new(
        registry: Arc<StepRegistry>,
        store: Arc<dyn ExecutionStore>,
        waiter: Arc<dyn WaitNotifyEngine>,
        publisher: EventPublisher,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            registry,
            store,
            waiter,
            publisher,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    fn state_machine(&self, execution_id: &str) -> NodeStateMachine {
        NodeStateMachine::new(execution_id, self.store.clone())
    }

    /// Create the node and run the executable's first step.
    ///
    /// Unknown step types and store failures are returned as errors; anything
    /// the executable raises concludes the node as `FAILED`.
    pub async fn start(
        &self,
        ambiance: Ambiance,
        step_type: &str,
        step_parameters: Value,
        inputs: Value,
    ) -> EngineResult<StartOutcome> {
        let executable = self.registry.resolve(step_type)?;
        let node = ExecutionNode::new(
            ambiance,
            step_type,
            step_parameters,
            inputs,
            executable.mode(),
        );
        let execution_id = node.execution_id.clone();
        let ctx = node.context();

        self.store.insert_node(node).await?;
        self.state_machine(&execution_id)
            .transition(ExecutionEvent::Start)
            .await?;

        log_execution_operation("start", &execution_id, Some(step_type), "running", None);
        self.publish(
            events::EXECUTION_STARTED,
            json!({
                "execution_id": execution_id,
                "step_type": step_type,
                "mode": executable.mode().to_string(),
            }),
        )
        .await;

        let outcome = match executable {
            StepExecutable::Sync(exec) => {
                let response = exec
                    .execute_sync(&ctx)
                    .await
                    .unwrap_or_else(translate_failure);
                LinkOutcome::Completed(self.conclude(&execution_id, response).await?)
            }
            StepExecutable::Async(exec) => match exec.execute_async(&ctx).await {
                Ok(response) => self.apply_async_response(&ctx, &exec, response).await?,
                Err(e) => LinkOutcome::Completed(
                    self.conclude(&execution_id, translate_failure(e)).await?,
                ),
            },
            StepExecutable::AsyncChain(exec) => match exec.start_chain_link(&ctx).await {
                Ok(link) => self.apply_chain_link(&ctx, &exec, link).await?,
                Err(e) => LinkOutcome::Completed(
                    self.conclude(&execution_id, translate_failure(e)).await?,
                ),
            },
        };

        Ok(outcome.into())
    }

    /// Continue a suspended node with the responses its callbacks produced.
    ///
    /// Duplicate or late deliveries (node missing, terminal, or already
    /// resumed by another worker) come back as [`ResumeOutcome::Ignored`].
    pub async fn resume(
        &self,
        execution_id: &str,
        responses: ResponseMap,
    ) -> EngineResult<ResumeOutcome> {
        let node = match self.store.get_node(execution_id).await? {
            Some(node) => node,
            None => {
                warn!(execution_id = %execution_id, "Resume for unknown execution ignored");
                return Ok(ResumeOutcome::Ignored {
                    reason: "execution not found".to_string(),
                });
            }
        };

        if node.status.is_terminal() {
            debug!(execution_id = %execution_id, status = %node.status, "Resume after terminal status ignored");
            return Ok(ResumeOutcome::Ignored {
                reason: format!("execution already {}", node.status),
            });
        }

        match self
            .state_machine(execution_id)
            .transition(ExecutionEvent::Resume)
            .await
        {
            Ok(_) => {}
            Err(StateMachineError::PersistenceFailed { reason }) => {
                return Err(EngineError::DatabaseError(reason));
            }
            Err(e) => {
                debug!(execution_id = %execution_id, error = %e, "Resume lost the race; ignoring");
                return Ok(ResumeOutcome::Ignored {
                    reason: e.to_string(),
                });
            }
        }

        self.publish(
            events::EXECUTION_RESUMED,
            json!({
                "execution_id": execution_id,
                "callback_ids": responses.keys().collect::<Vec<_>>(),
            }),
        )
        .await;

        let ctx = node.context();
        let executable = match self.registry.resolve(&node.step_type) {
            Ok(executable) => executable,
            Err(e) => {
                let response = StepResponse::failed(e.to_string(), e.category());
                return Ok(ResumeOutcome::Completed(
                    self.conclude(execution_id, response).await?,
                ));
            }
        };

        let continuation = match self.store.get_continuation(execution_id).await? {
            Some(continuation) => continuation,
            None => {
                let response = StepResponse::failed(
                    format!("No continuation recorded for execution {execution_id}"),
                    ErrorCategory::Fatal,
                );
                return Ok(ResumeOutcome::Completed(
                    self.conclude(execution_id, response).await?,
                ));
            }
        };

        let timed_out: Vec<String> = continuation
            .callback_ids
            .iter()
            .filter(|id| responses.get(*id).map_or(true, ResponseData::is_timeout))
            .cloned()
            .collect();
        if responses.values().any(ResponseData::is_timeout) {
            let response = executable
                .handle_timeout(&ctx, &timed_out)
                .await
                .unwrap_or_else(translate_failure);
            return Ok(ResumeOutcome::Completed(
                self.conclude(execution_id, response).await?,
            ));
        }

        let outcome = match executable {
            StepExecutable::Async(exec) => {
                LinkOutcome::Completed(
                    self.resume_async(&ctx, &exec, &continuation, &responses)
                        .await?,
                )
            }
            StepExecutable::AsyncChain(exec) => {
                let details = continuation.chain_details.clone().unwrap_or_default();
                self.resume_chain(&ctx, &exec, details, &responses).await?
            }
            StepExecutable::Sync(_) => LinkOutcome::Completed(
                self.conclude(
                    execution_id,
                    StepResponse::failed(
                        format!("Step type {} is synchronous and cannot be resumed", node.step_type),
                        ErrorCategory::Fatal,
                    ),
                )
                .await?,
            ),
        };

        Ok(outcome.into())
    }

    /// Forward an abort to the executable. Never changes the node status.
    pub async fn abort(&self, execution_id: &str) {
        let Some((ctx, executable, callback_ids)) = self.signal_target(execution_id, "abort").await
        else {
            return;
        };
        if let Err(e) = executable.handle_abort(&ctx, &callback_ids).await {
            warn!(execution_id = %execution_id, error = %format!("{e:#}"), "Abort handler failed");
        }
    }

    /// Forward an expiry to the executable. Never changes the node status.
    pub async fn expire(&self, execution_id: &str) {
        let Some((ctx, executable, callback_ids)) = self.signal_target(execution_id, "expire").await
        else {
            return;
        };
        if let Err(e) = executable.handle_expire(&ctx, &callback_ids).await {
            warn!(execution_id = %execution_id, error = %format!("{e:#}"), "Expire handler failed");
        }
    }

    /// Forward a failure signal to the executable. Never changes the node status.
    pub async fn fail(&self, execution_id: &str, reason: &str) {
        let Some((ctx, executable, _)) = self.signal_target(execution_id, "fail").await else {
            return;
        };
        if let Err(e) = executable.handle_failure(&ctx, reason).await {
            warn!(execution_id = %execution_id, error = %format!("{e:#}"), "Failure handler failed");
        }
    }

    /// Best-effort progress forwarding; every failure is logged and swallowed
    pub async fn progress(&self, execution_id: &str, progress: &Value) {
        let Some((ctx, executable, _)) = self.signal_target(execution_id, "progress").await else {
            return;
        };
        if let Err(e) = executable.handle_progress(&ctx, progress).await {
            debug!(execution_id = %execution_id, error = %format!("{e:#}"), "Progress handler failed");
        }
    }

    /// Resolve the node and executable for a signal; `None` means log and no-op
    async fn signal_target(
        &self,
        execution_id: &str,
        signal: &str,
    ) -> Option<(StepContext, StepExecutable, Vec<String>)> {
        let node = match self.store.get_node(execution_id).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!(execution_id = %execution_id, signal = signal, "Signal for unknown execution ignored");
                return None;
            }
            Err(e) => {
                warn!(execution_id = %execution_id, signal = signal, error = %e, "Signal lookup failed");
                return None;
            }
        };

        if node.status.is_terminal() {
            debug!(execution_id = %execution_id, signal = signal, status = %node.status, "Signal after terminal status ignored");
            return None;
        }

        let executable = match self.registry.resolve(&node.step_type) {
            Ok(executable) => executable,
            Err(e) => {
                warn!(execution_id = %execution_id, signal = signal, error = %e, "Signal for unregistered step type ignored");
                return None;
            }
        };

        let callback_ids = match self.store.get_continuation(execution_id).await {
            Ok(Some(continuation)) => continuation.callback_ids,
            _ => Vec::new(),
        };

        Some((node.context(), executable, callback_ids))
    }

    /// Record the terminal response and move the node to its terminal status.
    ///
    /// If the node already concluded (an abort racing a resume, say) the
    /// response is returned without being recorded.
    pub async fn conclude(
        &self,
        execution_id: &str,
        response: StepResponse,
    ) -> EngineResult<StepResponse> {
        let (response, event) =
            match ExecutionEvent::conclude_with(response.status, response.failure_message()) {
                Some(event) => (response, event),
                None => {
                    let message = format!(
                        "Executable returned non-terminal status {} as its response",
                        response.status
                    );
                    (
                        StepResponse::failed(message.clone(), ErrorCategory::Fatal),
                        ExecutionEvent::Fail(message),
                    )
                }
            };

        match self.state_machine(execution_id).transition(event).await {
            Ok(_) => {}
            Err(StateMachineError::PersistenceFailed { reason }) => {
                return Err(EngineError::DatabaseError(reason));
            }
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Node already concluded; response not recorded");
                return Ok(response);
            }
        }

        self.store.record_response(execution_id, &response).await?;
        if let Err(e) = self.waiter.cancel_waits(execution_id).await {
            warn!(execution_id = %execution_id, error = %e, "Failed to cancel remaining waiters");
        }

        let status = response.status.to_string();
        if response.status == ExecutionStatus::Failed {
            error!(
                execution_id = %execution_id,
                reason = response.failure_message().unwrap_or_default(),
                "Execution failed"
            );
        }
        log_execution_operation(
            "conclude",
            execution_id,
            None,
            &status,
            response.failure_message(),
        );
        self.publish(
            events::EXECUTION_COMPLETED,
            json!({
                "execution_id": execution_id,
                "status": status,
                "failure": response.failure,
            }),
        )
        .await;

        Ok(response)
    }

    /// Persist the continuation, suspend the node and register its waiters.
    ///
    /// With one callback id a single waiter resumes the node. With several,
    /// each id gets its own zero-timeout waiter for early delivery and one
    /// aggregate waiter owns the timeout and the resume.
    pub async fn register_callbacks(
        &self,
        execution_id: &str,
        mode: ExecutionMode,
        callback_ids: Vec<String>,
        chain_details: Option<ChainDetails>,
        timeout: Option<Duration>,
    ) -> EngineResult<()> {
        let current = self.state_machine(execution_id).current_state().await?;
        if current.is_terminal() {
            return Err(EngineError::NoOpOnTerminalStatus {
                execution_id: execution_id.to_string(),
                status: current.to_string(),
            });
        }
        if callback_ids.is_empty() {
            return Err(EngineError::ValidationError(format!(
                "No callback ids to register for execution {execution_id}"
            )));
        }

        let timeout = timeout.unwrap_or_else(|| self.config.default_callback_timeout());
        self.store
            .save_continuation(ExecutionContinuation {
                execution_id: execution_id.to_string(),
                mode,
                callback_ids: callback_ids.clone(),
                chain_details,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                registered_at: Utc::now(),
            })
            .await?;

        self.state_machine(execution_id)
            .transition(ExecutionEvent::Suspend)
            .await?;

        let progress = Some(ProgressCallback {
            execution_id: execution_id.to_string(),
        });
        if callback_ids.len() > 1 {
            for callback_id in &callback_ids {
                self.waiter
                    .wait_for_all_on(
                        NotifyCallback::SingleCallback {
                            execution_id: execution_id.to_string(),
                            callback_id: callback_id.clone(),
                        },
                        None,
                        vec![callback_id.clone()],
                        Duration::ZERO,
                    )
                    .await?;
            }
        }
        self.waiter
            .wait_for_all_on(
                NotifyCallback::Resume {
                    execution_id: execution_id.to_string(),
                },
                progress,
                callback_ids.clone(),
                timeout,
            )
            .await?;

        info!(
            execution_id = %execution_id,
            callbacks = callback_ids.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Execution suspended awaiting callbacks"
        );
        self.publish(
            events::EXECUTION_SUSPENDED,
            json!({
                "execution_id": execution_id,
                "mode": mode.to_string(),
                "callback_ids": callback_ids,
            }),
        )
        .await;

        Ok(())
    }

    /// Register callbacks, concluding the node as failed if registration breaks
    pub(crate) async fn suspend_or_fail(
        &self,
        execution_id: &str,
        mode: ExecutionMode,
        callback_ids: Vec<String>,
        chain_details: Option<ChainDetails>,
        timeout: Option<Duration>,
    ) -> EngineResult<LinkOutcome> {
        match self
            .register_callbacks(execution_id, mode, callback_ids.clone(), chain_details, timeout)
            .await
        {
            Ok(()) => Ok(LinkOutcome::Suspended(callback_ids)),
            Err(e @ EngineError::NoOpOnTerminalStatus { .. }) => Err(e),
            Err(e) => {
                let response = StepResponse::failed(
                    format!("Failed to register callbacks: {e}"),
                    e.category(),
                );
                Ok(LinkOutcome::Completed(
                    self.conclude(execution_id, response).await?,
                ))
            }
        }
    }

    /// Early delivery of one callback of a multi-callback fan-out
    pub async fn deliver_single_callback(
        &self,
        execution_id: &str,
        callback_id: &str,
        response: &ResponseData,
    ) {
        let Some((ctx, executable, _)) = self.signal_target(execution_id, "single_callback").await
        else {
            return;
        };
        if let StepExecutable::Async(exec) = executable {
            if let Err(e) = exec.handle_single_callback(&ctx, callback_id, response).await {
                warn!(
                    execution_id = %execution_id,
                    callback_id = %callback_id,
                    error = %format!("{e:#}"),
                    "Single callback handler failed"
                );
            }
        }
    }

    /// Callback tickets the node is currently suspended on
    pub async fn outstanding_callbacks(&self, execution_id: &str) -> EngineResult<Vec<AsyncCallback>> {
        let node = self
            .store
            .get_node(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;
        if !node.status.is_suspended() {
            return Ok(Vec::new());
        }
        let Some(continuation) = self.store.get_continuation(execution_id).await? else {
            return Ok(Vec::new());
        };

        Ok(continuation
            .callback_ids
            .iter()
            .map(|callback_id| AsyncCallback {
                callback_id: callback_id.clone(),
                execution_id: execution_id.to_string(),
                registered_at: continuation.registered_at,
                timeout_ms: continuation.timeout_ms,
                step_parameters: node.step_parameters.clone(),
                ambiance: node.ambiance.clone(),
            })
            .collect())
    }

    async fn publish(&self, event: &str, context: Value) {
        if let Err(e) = self.publisher.publish(event, context).await {
            debug!(event = event, error = %e, "Event publish failed");
        }
    }
}
