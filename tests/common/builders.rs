//! Harness wiring the engine, waiter, worker and restraint service the way a
//! single-process deployment would.

#![allow(dead_code)]

use std::sync::Arc;
use steprunner_core::config::{ExecutionConfig, RestraintConfig, StaticFeatureFlags};
use steprunner_core::events::EventPublisher;
use steprunner_core::execution::{
    Ambiance, ExecutionContinuation, ExecutionNode, ExecutionStore, ExecutionStrategyEngine, ExecutionMode,
    InMemoryExecutionStore, NotificationWorker, ResponseData, StepRegistry,
};
use steprunner_core::restraint::{
    ExecutionStoreLookup, InMemoryRestraintStore, ResourceRestraintStep, RestraintService,
    RESOURCE_RESTRAINT_STEP_TYPE,
};
use steprunner_core::state_machine::ExecutionStatus;
use steprunner_core::waiter::{InMemoryWaitNotifyEngine, WaitNotifyEngine};

pub fn ambiance(execution_id: &str, plan_execution_id: &str) -> Ambiance {
    Ambiance::new(execution_id, plan_execution_id, "acct-1")
}

pub struct TestHarness {
    pub engine: Arc<ExecutionStrategyEngine>,
    pub registry: Arc<StepRegistry>,
    pub store: Arc<InMemoryExecutionStore>,
    pub waiter: Arc<InMemoryWaitNotifyEngine>,
    pub publisher: EventPublisher,
    pub worker: NotificationWorker,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(ExecutionConfig::default())
    }

    pub fn with_config(config: ExecutionConfig) -> Self {
        let registry = Arc::new(StepRegistry::new());
        let store = Arc::new(InMemoryExecutionStore::new());
        let (waiter, notifications) = InMemoryWaitNotifyEngine::new();
        let waiter = Arc::new(waiter);
        let publisher = EventPublisher::new(64);

        let engine = Arc::new(ExecutionStrategyEngine::new(
            registry.clone(),
            store.clone(),
            waiter.clone(),
            publisher.clone(),
            config,
        ));
        let worker = NotificationWorker::new(engine.clone(), notifications);

        Self {
            engine,
            registry,
            store,
            waiter,
            publisher,
            worker,
        }
    }

    /// Post a callback response and process every notification it caused
    pub async fn deliver(&mut self, callback_id: &str, response: ResponseData) -> usize {
        self.waiter.done_with(callback_id, response).await.unwrap();
        self.worker.drain_pending().await
    }

    pub async fn status(&self, execution_id: &str) -> ExecutionStatus {
        self.store
            .get_node(execution_id)
            .await
            .unwrap()
            .expect("node exists")
            .status
    }

    pub async fn store_node(&self, execution_id: &str) -> ExecutionNode {
        self.store
            .get_node(execution_id)
            .await
            .unwrap()
            .expect("node exists")
    }

    pub async fn store_continuation(&self, execution_id: &str) -> ExecutionContinuation {
        self.store
            .get_continuation(execution_id)
            .await
            .unwrap()
            .expect("continuation exists")
    }

    /// Insert a non-terminal node standing in for a running plan or stage
    pub async fn insert_running_entity(&self, execution_id: &str) {
        let node = ExecutionNode::new(
            ambiance(execution_id, execution_id),
            "plan",
            serde_json::json!({}),
            serde_json::json!({}),
            ExecutionMode::Sync,
        );
        self.store.insert_node(node).await.unwrap();
    }
}

pub struct RestraintHarness {
    pub harness: TestHarness,
    pub service: Arc<RestraintService>,
    pub restraint_store: Arc<InMemoryRestraintStore>,
    pub flags: Arc<StaticFeatureFlags>,
}

impl RestraintHarness {
    pub fn new(capacity: i32) -> Self {
        Self::with_config(RestraintConfig {
            default_capacity: capacity,
            ..RestraintConfig::default()
        })
    }

    pub fn with_config(config: RestraintConfig) -> Self {
        let harness = TestHarness::new();
        let restraint_store = Arc::new(InMemoryRestraintStore::new());
        let flags = Arc::new(StaticFeatureFlags::new());

        let service = Arc::new(RestraintService::new(
            restraint_store.clone(),
            harness.waiter.clone(),
            Arc::new(ExecutionStoreLookup::new(harness.store.clone())),
            flags.clone(),
            harness.publisher.clone(),
            config,
        ));
        harness.registry.register_async(
            RESOURCE_RESTRAINT_STEP_TYPE,
            Arc::new(ResourceRestraintStep::new(service.clone())),
        );

        Self {
            harness,
            service,
            restraint_store,
            flags,
        }
    }
}
