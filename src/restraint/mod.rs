//! # Resource Constraint Queue
//!
//! FIFO admission control over named resource units, backed by a persisted
//! consumer ledger. Blocked consumers are woken through the wait-notify engine
//! using their consumer id as the correlation id.
//!
//! ```rust
//! use std::sync::Arc;
//! use steprunner_core::config::{RestraintConfig, StaticFeatureFlags};
//! use steprunner_core::events::EventPublisher;
//! use steprunner_core::execution::InMemoryExecutionStore;
//! use steprunner_core::restraint::{
//!     ConsumerState, ExecutionStoreLookup, HoldingScope, InMemoryRestraintStore,
//!     RegistrationRequest, RestraintService,
//! };
//! use steprunner_core::waiter::InMemoryWaitNotifyEngine;
//!
//! # tokio_test::block_on(async {
//! let (waiter, _notifications) = InMemoryWaitNotifyEngine::new();
//! let service = RestraintService::new(
//!     Arc::new(InMemoryRestraintStore::new()),
//!     Arc::new(waiter),
//!     Arc::new(ExecutionStoreLookup::new(Arc::new(InMemoryExecutionStore::new()))),
//!     Arc::new(StaticFeatureFlags::new()),
//!     EventPublisher::new(16),
//!     RestraintConfig::default(),
//! );
//!
//! let request = |consumer: &str| RegistrationRequest {
//!     resource_unit: "prod-db-migrations".to_string(),
//!     consumer_id: consumer.to_string(),
//!     permits: 1,
//!     holding_scope: HoldingScope::Plan,
//!     release_entity_id: format!("plan-{consumer}"),
//!     account_id: "acct".to_string(),
//! };
//! let first = service.register(&request("a")).await.unwrap();
//! let second = service.register(&request("b")).await.unwrap();
//! assert_eq!(first.state, ConsumerState::Active);
//! assert_eq!(second.state, ConsumerState::Blocked);
//!
//! let promoted = service.finish_and_promote("a").await.unwrap();
//! assert_eq!(promoted[0].id, "b");
//! # });
//! ```

pub mod service;
pub mod step;
pub mod store;
pub mod sweeper;
pub mod types;

pub use service::{ExecutionStoreLookup, ReleaseEntityLookup, RestraintService};
pub use step::{ResourceRestraintSpec, ResourceRestraintStep, RESOURCE_RESTRAINT_STEP_TYPE};
pub use store::{InMemoryRestraintStore, RestraintStore};
pub use sweeper::RestraintSweeper;
pub use types::{
    AcquireMode, CleanupReport, ConsumerState, HoldingScope, RegistrationOutcome,
    RegistrationRequest, ReleaseEntityStatus, ResourceRestraintOutcome, RestraintInstance,
};
