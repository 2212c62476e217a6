//! # Deployment Verification
//!
//! Host-sampling classification followed by canary or improvised canary
//! analysis, driven to completion with bounded retries.

pub mod analysis;
pub mod collaborators;
pub mod host_sampling;
pub mod machine;
pub mod types;

pub use analysis::{AnalysisState, CanaryAnalysisState};
pub use collaborators::{AnalysisTaskScheduler, HostRecordLookup};
pub use host_sampling::{classify, Classification, HostSamplingState};
pub use machine::{AnalysisStateMachine, Tick};
pub use types::{
    AnalysisMode, AnalysisStatus, AnalysisTaskKind, AnalysisTaskStatus, DeploymentTopology,
    HostSet, VerificationInput, VerificationOutcome,
};
