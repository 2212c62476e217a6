//! # Wait-Notify Engine
//!
//! Registers interest in external correlation ids and turns their completion
//! into [`Notification`]s. A registration fires exactly once: either when all
//! of its ids have reported, or with a timeout marker once it expires.
//!
//! The in-process engine publishes notifications on an mpsc channel; whichever
//! worker drains that channel resumes the execution.

pub mod memory;
pub mod types;

pub use memory::InMemoryWaitNotifyEngine;
pub use types::{Notification, NotifyCallback, ProgressCallback, StaleWaiter, WaitInstance};

use crate::error::EngineResult;
use crate::execution::types::ResponseData;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

#[async_trait]
pub trait WaitNotifyEngine: Send + Sync {
    /// Register a waiter on all of `correlation_ids`. A zero timeout means the
    /// waiter never expires on its own. Returns the wait instance id.
    async fn wait_for_all_on(
        &self,
        callback: NotifyCallback,
        progress: Option<ProgressCallback>,
        correlation_ids: Vec<String>,
        timeout: Duration,
    ) -> EngineResult<String>;

    /// Record the response for one correlation id
    async fn done_with(&self, correlation_id: &str, response: ResponseData) -> EngineResult<()>;

    /// Forward partial progress to waiters registered with a progress callback
    async fn progress_on(&self, correlation_id: &str, data: Value) -> EngineResult<()>;

    /// Drop every outstanding waiter of an execution; returns how many were removed
    async fn cancel_waits(&self, execution_id: &str) -> EngineResult<usize>;
}
