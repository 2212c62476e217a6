//! Analysis states that follow host sampling.
//!
//! Canary and improvised canary analysis share one payload and one
//! execute/retry contract; the variant only decides which task kind is
//! scheduled downstream.

use super::collaborators::AnalysisTaskScheduler;
use super::host_sampling::HostSamplingState;
use super::types::{
    AnalysisMode, AnalysisStatus, AnalysisTaskKind, AnalysisTaskStatus, HostSet, VerificationInput,
};
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryAnalysisState {
    pub input: VerificationInput,
    pub control_hosts: HostSet,
    pub test_hosts: HostSet,
    pub retry_count: u32,
    pub status: AnalysisStatus,
    pub task_id: Option<String>,
    pub last_error: Option<String>,
}

impl CanaryAnalysisState {
    pub fn new(input: VerificationInput, control_hosts: HostSet, test_hosts: HostSet) -> Self {
        Self {
            input,
            control_hosts,
            test_hosts,
            retry_count: 0,
            status: AnalysisStatus::Created,
            task_id: None,
            last_error: None,
        }
    }

    /// Schedule the analysis task; scheduling failures move to RETRY
    pub async fn execute(
        &mut self,
        scheduler: &dyn AnalysisTaskScheduler,
        kind: AnalysisTaskKind,
    ) -> EngineResult<()> {
        match scheduler.schedule(kind, self).await {
            Ok(task_id) => {
                self.task_id = Some(task_id);
                self.status = AnalysisStatus::Running;
            }
            Err(e @ EngineError::ConfigurationError(_)) => return Err(e),
            Err(e) => {
                warn!(
                    verification_task_id = %self.input.verification_task_id,
                    error = %e,
                    "Scheduling analysis task failed"
                );
                self.last_error = Some(e.to_string());
                self.status = AnalysisStatus::Retry;
            }
        }
        Ok(())
    }

    /// Poll the scheduled task and fold its status into ours
    pub async fn get_execution_status(
        &mut self,
        scheduler: &dyn AnalysisTaskScheduler,
    ) -> EngineResult<AnalysisStatus> {
        let Some(task_id) = self.task_id.clone() else {
            return Ok(self.status);
        };
        self.status = match scheduler.task_status(&task_id).await {
            Ok(AnalysisTaskStatus::Running) => AnalysisStatus::Running,
            Ok(AnalysisTaskStatus::Success) => AnalysisStatus::Success,
            Ok(AnalysisTaskStatus::Failed { reason }) => {
                self.last_error = Some(reason);
                AnalysisStatus::Retry
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                AnalysisStatus::Retry
            }
        };
        Ok(self.status)
    }

    /// Same ladder as host sampling: FAILED on reaching `max_retry`,
    /// otherwise schedule a fresh task
    pub async fn handle_retry(
        &mut self,
        scheduler: &dyn AnalysisTaskScheduler,
        kind: AnalysisTaskKind,
        max_retry: u32,
    ) -> EngineResult<()> {
        self.retry_count += 1;
        if self.retry_count >= max_retry {
            self.status = AnalysisStatus::Failed;
            return Ok(());
        }
        self.task_id = None;
        self.execute(scheduler, kind).await
    }
}

/// Every state a verification job passes through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum AnalysisState {
    HostSampling(HostSamplingState),
    Canary(CanaryAnalysisState),
    ImprovisedCanary(CanaryAnalysisState),
}

impl AnalysisState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HostSampling(_) => "host_sampling",
            Self::Canary(_) => "canary_analysis",
            Self::ImprovisedCanary(_) => "improvised_canary_analysis",
        }
    }

    pub fn status(&self) -> AnalysisStatus {
        match self {
            Self::HostSampling(s) => s.status,
            Self::Canary(s) | Self::ImprovisedCanary(s) => s.status,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Self::HostSampling(s) => s.retry_count,
            Self::Canary(s) | Self::ImprovisedCanary(s) => s.retry_count,
        }
    }

    pub fn verification_task_id(&self) -> &str {
        match self {
            Self::HostSampling(s) => &s.input.verification_task_id,
            Self::Canary(s) | Self::ImprovisedCanary(s) => &s.input.verification_task_id,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            Self::HostSampling(s) => s.last_error.as_deref(),
            Self::Canary(s) | Self::ImprovisedCanary(s) => s.last_error.as_deref(),
        }
    }

    /// Task kind scheduled by analysis variants
    pub fn task_kind(&self) -> Option<AnalysisTaskKind> {
        match self {
            Self::HostSampling(_) => None,
            Self::Canary(_) => Some(AnalysisMode::Canary),
            Self::ImprovisedCanary(_) => Some(AnalysisMode::ImprovisedCanary),
        }
    }
}
