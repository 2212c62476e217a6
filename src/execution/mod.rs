//! # Execution Strategy Engine
//!
//! Step executables, the registry that resolves them by step type, the
//! persisted node and continuation store, and the engine that drives nodes
//! through start, suspension and resumption.

pub mod executable;
pub mod failure;
pub mod registry;
pub mod store;
pub mod strategy;
pub mod types;
pub mod worker;

pub use executable::{
    AsyncChainExecutable, AsyncExecutable, Executable, StepExecutable, SyncExecutable,
};
pub use failure::translate_failure;
pub use registry::StepRegistry;
pub use store::{ExecutionStore, InMemoryExecutionStore};
pub use strategy::ExecutionStrategyEngine;
pub use types::{
    Ambiance, AsyncCallback, AsyncExecutableResponse, ChainDetails, ChainLinkResponse,
    ExecutionContinuation, ExecutionMode, ExecutionNode, FailureInfo, PassThroughData,
    ResponseData, ResponseMap, ResumeOutcome, StartOutcome, StepContext, StepResponse,
};
pub use worker::NotificationWorker;
