#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Steprunner Core
//!
//! Execution core for pipeline orchestration: drives individual workflow
//! steps to completion, queues steps that contend for a shared resource, and
//! verifies deployments by sampling hosts before and after a rollout.
//!
//! ## Architecture
//!
//! - **Execution strategy engine**: every step is sync, async (waits on
//!   external callbacks) or an async chain (a sequence of linked async
//!   calls). Suspended nodes persist a continuation record, so any worker
//!   can resume them when callbacks arrive.
//! - **Resource constraint queue**: per resource unit, permits are handed
//!   out strictly in registration order; blocked consumers are woken through
//!   the same wait/notify engine that resumes async steps.
//! - **Host sampling analysis**: control and test populations are derived
//!   from the deployment topology before canary or improvised canary analysis
//!   is scheduled.
//!
//! ## Module Organization
//!
//! - [`execution`] - executables, strategy engine, notification worker
//! - [`waiter`] - wait/notify correlation of callback ids
//! - [`restraint`] - resource constraint ledger, service and step
//! - [`verification`] - host sampling and analysis state machine
//! - [`state_machine`] - execution node statuses and transitions
//! - [`database`] - PostgreSQL stores and migrations
//! - [`config`] - layered configuration
//! - [`error`] - structured error handling
//! - [`events`] - lifecycle event broadcasting
//! - [`logging`] - structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use steprunner_core::config::ConfigManager;
//! use steprunner_core::events::EventPublisher;
//! use steprunner_core::execution::{
//!     ExecutionStrategyEngine, InMemoryExecutionStore, NotificationWorker, StepRegistry,
//! };
//! use steprunner_core::waiter::InMemoryWaitNotifyEngine;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! steprunner_core::logging::init_structured_logging();
//! let manager = ConfigManager::load()?;
//!
//! let (waiter, notifications) =
//!     InMemoryWaitNotifyEngine::with_retention(manager.config().execution.response_retention());
//! let engine = Arc::new(ExecutionStrategyEngine::new(
//!     Arc::new(StepRegistry::new()),
//!     Arc::new(InMemoryExecutionStore::new()),
//!     Arc::new(waiter),
//!     EventPublisher::new(manager.config().execution.event_channel_capacity),
//!     manager.config().execution.clone(),
//! ));
//! let _worker = NotificationWorker::new(engine.clone(), notifications);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                       # Unit and in-memory integration tests
//! cargo test -- --ignored          # PostgreSQL store tests, needs DATABASE_URL
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod events;
pub mod execution;
pub mod logging;
pub mod restraint;
pub mod state_machine;
pub mod verification;
pub mod waiter;

pub use config::{ConfigManager, EngineConfig};
pub use error::{EngineError, EngineResult, ErrorCategory};
pub use events::EventPublisher;
pub use execution::{ExecutionStrategyEngine, NotificationWorker, StepRegistry};
pub use restraint::{ResourceRestraintStep, RestraintService};
pub use state_machine::ExecutionStatus;
pub use verification::AnalysisStateMachine;
pub use waiter::{InMemoryWaitNotifyEngine, WaitNotifyEngine};
