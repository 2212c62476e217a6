//! # Execution Store
//!
//! Persistence contract for execution nodes and their continuation records.
//! Status changes go through [`ExecutionStore::compare_and_set_status`] so two
//! workers racing on the same node cannot both win.

use super::types::{ExecutionContinuation, ExecutionNode, StepResponse};
use crate::error::{EngineError, EngineResult};
use crate::state_machine::ExecutionStatus;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert_node(&self, node: ExecutionNode) -> EngineResult<()>;

    async fn get_node(&self, execution_id: &str) -> EngineResult<Option<ExecutionNode>>;

    /// Atomically move `expected -> new`; returns false if the node was not in `expected`
    async fn compare_and_set_status(
        &self,
        execution_id: &str,
        expected: ExecutionStatus,
        new: ExecutionStatus,
    ) -> EngineResult<bool>;

    async fn record_response(&self, execution_id: &str, response: &StepResponse) -> EngineResult<()>;

    async fn save_continuation(&self, continuation: ExecutionContinuation) -> EngineResult<()>;

    async fn get_continuation(&self, execution_id: &str)
        -> EngineResult<Option<ExecutionContinuation>>;
}

/// Store backed by concurrent maps, for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    nodes: DashMap<String, ExecutionNode>,
    continuations: DashMap<String, ExecutionContinuation>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert_node(&self, node: ExecutionNode) -> EngineResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.nodes.entry(node.execution_id.clone()) {
            Entry::Occupied(_) => Err(EngineError::ValidationError(format!(
                "Execution {} already exists",
                node.execution_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(node);
                Ok(())
            }
        }
    }

    async fn get_node(&self, execution_id: &str) -> EngineResult<Option<ExecutionNode>> {
        Ok(self.nodes.get(execution_id).map(|n| n.value().clone()))
    }

    async fn compare_and_set_status(
        &self,
        execution_id: &str,
        expected: ExecutionStatus,
        new: ExecutionStatus,
    ) -> EngineResult<bool> {
        match self.nodes.get_mut(execution_id) {
            Some(mut node) if node.status == expected => {
                node.status = new;
                node.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            }),
        }
    }

    async fn record_response(&self, execution_id: &str, response: &StepResponse) -> EngineResult<()> {
        let mut node =
            self.nodes
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::ExecutionNotFound {
                    execution_id: execution_id.to_string(),
                })?;
        node.response = Some(response.clone());
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn save_continuation(&self, continuation: ExecutionContinuation) -> EngineResult<()> {
        self.continuations
            .insert(continuation.execution_id.clone(), continuation);
        Ok(())
    }

    async fn get_continuation(
        &self,
        execution_id: &str,
    ) -> EngineResult<Option<ExecutionContinuation>> {
        Ok(self
            .continuations
            .get(execution_id)
            .map(|c| c.value().clone()))
    }
}
