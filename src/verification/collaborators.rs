//! Services the verification state machine consults but does not own

use super::analysis::CanaryAnalysisState;
use super::types::{AnalysisTaskKind, AnalysisTaskStatus, HostSet};
use crate::error::EngineResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Time-series or log record lookup of hosts that reported in a window
#[async_trait]
pub trait HostRecordLookup: Send + Sync {
    async fn hosts_in_range(
        &self,
        verification_task_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<HostSet>;
}

/// Schedules statistical analysis tasks on external workers
#[async_trait]
pub trait AnalysisTaskScheduler: Send + Sync {
    /// Returns the scheduled task id
    async fn schedule(
        &self,
        kind: AnalysisTaskKind,
        state: &CanaryAnalysisState,
    ) -> EngineResult<String>;

    async fn task_status(&self, task_id: &str) -> EngineResult<AnalysisTaskStatus>;
}
