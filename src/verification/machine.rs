//! # Analysis State Machine Driver
//!
//! Advances a verification job one step per [`AnalysisStateMachine::tick`]:
//!
//! - RUNNING: host sampling polls again; analysis polls its task
//! - TRANSITION: host sampling hands over to the analysis state for its mode
//! - RETRY: climbs the retry ladder until `max_retry`
//! - SUCCESS / FAILED: produce the terminal [`VerificationOutcome`]
//!
//! Only an unrecognized topology escapes as an error; every other failure
//! goes through RETRY.

use super::analysis::{AnalysisState, CanaryAnalysisState};
use super::collaborators::{AnalysisTaskScheduler, HostRecordLookup};
use super::host_sampling::HostSamplingState;
use super::types::{AnalysisStatus, AnalysisTaskKind, VerificationInput, VerificationOutcome};
use crate::config::VerificationConfig;
use crate::constants::events;
use crate::error::EngineResult;
use crate::events::EventPublisher;
use crate::logging::log_verification_operation;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of one tick
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Continue(AnalysisState),
    Done(VerificationOutcome),
}

pub struct AnalysisStateMachine {
    hosts: Arc<dyn HostRecordLookup>,
    scheduler: Arc<dyn AnalysisTaskScheduler>,
    publisher: EventPublisher,
    config: VerificationConfig,
}

impl AnalysisStateMachine {
    pub fn new(
        hosts: Arc<dyn HostRecordLookup>,
        scheduler: Arc<dyn AnalysisTaskScheduler>,
        publisher: EventPublisher,
        config: VerificationConfig,
    ) -> Self {
        Self {
            hosts,
            scheduler,
            publisher,
            config,
        }
    }

    /// Create the host sampling state and run its first execution
    pub async fn start(&self, input: VerificationInput) -> EngineResult<AnalysisState> {
        let mut sampling = HostSamplingState::new(input);
        sampling.execute(self.hosts.as_ref()).await?;
        let state = AnalysisState::HostSampling(sampling);
        self.record_transition(None, &state).await;
        Ok(state)
    }

    pub async fn tick(&self, state: AnalysisState) -> EngineResult<Tick> {
        let before = (state.name(), state.status());

        let tick = match state {
            AnalysisState::HostSampling(sampling) => self.tick_sampling(sampling).await?,
            AnalysisState::Canary(analysis) => {
                self.tick_analysis(analysis, AnalysisTaskKind::Canary)
                    .await?
            }
            AnalysisState::ImprovisedCanary(analysis) => {
                self.tick_analysis(analysis, AnalysisTaskKind::ImprovisedCanary)
                    .await?
            }
        };

        if let Tick::Continue(next) = &tick {
            if (next.name(), next.status()) != before {
                self.record_transition(Some(before), next).await;
            }
        }
        Ok(tick)
    }

    /// Tick until a terminal outcome, sleeping `poll_interval` between ticks
    pub async fn run_to_completion(
        &self,
        input: VerificationInput,
        poll_interval: Duration,
    ) -> EngineResult<VerificationOutcome> {
        let mut state = self.start(input).await?;
        loop {
            match self.tick(state).await? {
                Tick::Done(outcome) => return Ok(outcome),
                Tick::Continue(next) => state = next,
            }
            if !poll_interval.is_zero() {
                tokio::time::sleep(poll_interval).await;
            }
        }
    }

    async fn tick_sampling(&self, mut sampling: HostSamplingState) -> EngineResult<Tick> {
        let hosts = self.hosts.as_ref();

        match sampling.status {
            AnalysisStatus::Created => sampling.execute(hosts).await?,
            AnalysisStatus::Running => {
                sampling.polls += 1;
                if sampling.polls >= self.config.max_sampling_polls {
                    return Ok(Tick::Done(VerificationOutcome::Skipped {
                        reason: format!(
                            "Insufficient host data after {} samples: {} control and {} test hosts",
                            sampling.polls,
                            sampling.control_hosts.len(),
                            sampling.test_hosts.len()
                        ),
                    }));
                }
                sampling.execute(hosts).await?;
            }
            AnalysisStatus::Transition | AnalysisStatus::Success => {
                let mut next = sampling.handle_transition();
                match &mut next {
                    AnalysisState::Canary(analysis) => {
                        analysis
                            .execute(self.scheduler.as_ref(), AnalysisTaskKind::Canary)
                            .await?
                    }
                    AnalysisState::ImprovisedCanary(analysis) => {
                        analysis
                            .execute(self.scheduler.as_ref(), AnalysisTaskKind::ImprovisedCanary)
                            .await?
                    }
                    AnalysisState::HostSampling(_) => {}
                }
                return Ok(Tick::Continue(next));
            }
            AnalysisStatus::Retry => {
                sampling
                    .handle_retry(hosts, self.config.max_retry)
                    .await?
            }
            AnalysisStatus::Failed => {
                return Ok(Tick::Done(VerificationOutcome::Failed {
                    reason: sampling
                        .last_error
                        .unwrap_or_else(|| "host sampling failed".to_string()),
                    retry_count: sampling.retry_count,
                }));
            }
        }

        Ok(Tick::Continue(AnalysisState::HostSampling(sampling)))
    }

    async fn tick_analysis(
        &self,
        mut analysis: CanaryAnalysisState,
        kind: AnalysisTaskKind,
    ) -> EngineResult<Tick> {
        let scheduler = self.scheduler.as_ref();

        match analysis.status {
            AnalysisStatus::Created => analysis.execute(scheduler, kind).await?,
            AnalysisStatus::Running | AnalysisStatus::Transition => {
                analysis.get_execution_status(scheduler).await?;
            }
            AnalysisStatus::Retry => {
                analysis
                    .handle_retry(scheduler, kind, self.config.max_retry)
                    .await?
            }
            AnalysisStatus::Success => {}
            AnalysisStatus::Failed => {}
        }

        match analysis.status {
            AnalysisStatus::Success => Ok(Tick::Done(VerificationOutcome::Succeeded {
                mode: kind,
                control_hosts: analysis.control_hosts,
                test_hosts: analysis.test_hosts,
            })),
            AnalysisStatus::Failed => Ok(Tick::Done(VerificationOutcome::Failed {
                reason: analysis
                    .last_error
                    .unwrap_or_else(|| "analysis failed".to_string()),
                retry_count: analysis.retry_count,
            })),
            _ => Ok(Tick::Continue(match kind {
                AnalysisTaskKind::Canary => AnalysisState::Canary(analysis),
                AnalysisTaskKind::ImprovisedCanary => AnalysisState::ImprovisedCanary(analysis),
            })),
        }
    }

    async fn record_transition(
        &self,
        from: Option<(&'static str, AnalysisStatus)>,
        to: &AnalysisState,
    ) {
        let status = to.status().to_string();
        log_verification_operation(
            "transition",
            to.verification_task_id(),
            &format!("{}:{}", to.name(), status),
            to.retry_count(),
            to.last_error(),
        );

        let context = json!({
            "verification_task_id": to.verification_task_id(),
            "from_state": from.map(|(name, _)| name),
            "from_status": from.map(|(_, status)| status.to_string()),
            "to_state": to.name(),
            "to_status": status,
            "retry_count": to.retry_count(),
        });
        if let Err(e) = self
            .publisher
            .publish(events::VERIFICATION_STATE_TRANSITION, context)
            .await
        {
            debug!(error = %e, "Event publish failed");
        }
    }
}
