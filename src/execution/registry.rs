//! # Step Registry
//!
//! Maps a persisted step-type identifier to the capability set that executes
//! it. Resolution happens once per start or resume, from the step type stored
//! on the node.

use super::executable::{AsyncChainExecutable, AsyncExecutable, StepExecutable, SyncExecutable};
use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct StepRegistry {
    executables: DashMap<String, StepExecutable>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executable under a step type, replacing any previous one
    pub fn register(&self, step_type: impl Into<String>, executable: StepExecutable) {
        let step_type = step_type.into();
        debug!(step_type = %step_type, mode = %executable.mode(), "Registering step executable");
        if self
            .executables
            .insert(step_type.clone(), executable)
            .is_some()
        {
            warn!(step_type = %step_type, "Replaced existing step executable registration");
        }
    }

    pub fn register_sync(&self, step_type: impl Into<String>, executable: Arc<dyn SyncExecutable>) {
        self.register(step_type, StepExecutable::Sync(executable));
    }

    pub fn register_async(&self, step_type: impl Into<String>, executable: Arc<dyn AsyncExecutable>) {
        self.register(step_type, StepExecutable::Async(executable));
    }

    pub fn register_chain(
        &self,
        step_type: impl Into<String>,
        executable: Arc<dyn AsyncChainExecutable>,
    ) {
        self.register(step_type, StepExecutable::AsyncChain(executable));
    }

    pub fn resolve(&self, step_type: &str) -> EngineResult<StepExecutable> {
        self.executables
            .get(step_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::HandlerNotFound {
                step_type: step_type.to_string(),
            })
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executables.contains_key(step_type)
    }

    pub fn step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executables.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::executable::Executable;
    use crate::execution::types::{ExecutionMode, StepContext, StepResponse};
    use async_trait::async_trait;

    struct Noop;

    impl Executable for Noop {}

    #[async_trait]
    impl SyncExecutable for Noop {
        async fn execute_sync(&self, _ctx: &StepContext) -> anyhow::Result<StepResponse> {
            Ok(StepResponse::succeeded(None))
        }
    }

    #[test]
    fn test_resolve_registered_step() {
        let registry = StepRegistry::new();
        registry.register_sync("noop", Arc::new(Noop));

        let executable = registry.resolve("noop").unwrap();
        assert_eq!(executable.mode(), ExecutionMode::Sync);
        assert_eq!(registry.step_types(), vec!["noop".to_string()]);
    }

    #[test]
    fn test_resolve_unknown_step() {
        let registry = StepRegistry::new();
        let err = registry.resolve("missing").unwrap_err();
        assert_eq!(
            err,
            EngineError::HandlerNotFound {
                step_type: "missing".to_string()
            }
        );
    }
}
