//! # Host Sampling
//!
//! Splits the hosts seen around a deployment into control and test
//! populations according to the declared topology.
//!
//! `new_hosts` are post-deployment hosts that did not report before it:
//!
//! | topology         | new hosts            | control | test      | mode              |
//! |------------------|----------------------|---------|-----------|-------------------|
//! | CANARY           | empty                | post    | empty     | canary            |
//! | CANARY           | strict subset        | post - new | new    | canary            |
//! | CANARY           | all of post          | empty   | empty     | canary            |
//! | ROLLING / BLUE_GREEN | any              | pre     | post      | improvised canary |
//! | AUTO             | empty                | pre     | post      | improvised canary |
//! | AUTO             | strict subset        | pre     | new       | canary            |
//! | AUTO             | all of post          | pre     | new       | improvised canary |

use super::analysis::{AnalysisState, CanaryAnalysisState};
use super::collaborators::HostRecordLookup;
use super::types::{AnalysisMode, AnalysisStatus, DeploymentTopology, HostSet, VerificationInput};
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Control/test split produced by [`classify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub control_hosts: HostSet,
    pub test_hosts: HostSet,
    pub mode: AnalysisMode,
}

pub fn classify(topology: DeploymentTopology, pre: &HostSet, post: &HostSet) -> Classification {
    let new_hosts: HostSet = post.difference(pre).cloned().collect();
    let all_new = !post.is_empty() && new_hosts.len() == post.len();

    match topology {
        DeploymentTopology::Canary => {
            let (control_hosts, test_hosts) = if new_hosts.is_empty() {
                (post.clone(), HostSet::new())
            } else if all_new {
                (HostSet::new(), HostSet::new())
            } else {
                (post.difference(&new_hosts).cloned().collect(), new_hosts)
            };
            Classification {
                control_hosts,
                test_hosts,
                mode: AnalysisMode::Canary,
            }
        }
        DeploymentTopology::Rolling | DeploymentTopology::BlueGreen => Classification {
            control_hosts: pre.clone(),
            test_hosts: post.clone(),
            mode: AnalysisMode::ImprovisedCanary,
        },
        DeploymentTopology::Auto if new_hosts.is_empty() => Classification {
            control_hosts: pre.clone(),
            test_hosts: post.clone(),
            mode: AnalysisMode::ImprovisedCanary,
        },
        DeploymentTopology::Auto => Classification {
            control_hosts: pre.clone(),
            mode: if all_new {
                AnalysisMode::ImprovisedCanary
            } else {
                AnalysisMode::Canary
            },
            test_hosts: new_hosts,
        },
    }
}

/// Per verification task snapshot of sampled and classified hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSamplingState {
    pub input: VerificationInput,
    pub pre_deployment_hosts: HostSet,
    pub post_deployment_hosts: HostSet,
    pub control_hosts: HostSet,
    pub test_hosts: HostSet,
    pub topology: Option<DeploymentTopology>,
    pub mode: Option<AnalysisMode>,
    pub retry_count: u32,
    pub status: AnalysisStatus,
    /// Executions that ended without enough data to transition
    pub polls: u32,
    pub last_error: Option<String>,
}

impl HostSamplingState {
    pub fn new(input: VerificationInput) -> Self {
        Self {
            input,
            pre_deployment_hosts: HostSet::new(),
            post_deployment_hosts: HostSet::new(),
            control_hosts: HostSet::new(),
            test_hosts: HostSet::new(),
            topology: None,
            mode: None,
            retry_count: 0,
            status: AnalysisStatus::Created,
            polls: 0,
            last_error: None,
        }
    }

    /// Sample both host populations and classify them.
    ///
    /// An unrecognized topology is returned as a fatal error. Lookup failures
    /// move the state to RETRY instead.
    pub async fn execute(&mut self, lookup: &dyn HostRecordLookup) -> EngineResult<()> {
        let topology: DeploymentTopology = self.input.topology.parse()?;
        self.topology = Some(topology);

        let task_id = self.input.verification_task_id.clone();
        let sampled = async {
            let pre = lookup
                .hosts_in_range(&task_id, self.input.pre_deployment_start, self.input.deployment_start)
                .await?;
            let post = lookup
                .hosts_in_range(&task_id, self.input.deployment_start, self.input.post_deployment_end)
                .await?;
            Ok::<_, EngineError>((pre, post))
        }
        .await;

        let (pre, post) = match sampled {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(verification_task_id = %task_id, error = %e, "Host sampling failed");
                self.last_error = Some(e.to_string());
                self.status = AnalysisStatus::Retry;
                return Ok(());
            }
        };

        let classification = classify(topology, &pre, &post);
        self.pre_deployment_hosts = pre;
        self.post_deployment_hosts = post;
        self.control_hosts = classification.control_hosts;
        self.test_hosts = classification.test_hosts;
        self.mode = Some(classification.mode);
        self.status = self.get_execution_status();

        debug!(
            verification_task_id = %task_id,
            topology = %topology,
            control = self.control_hosts.len(),
            test = self.test_hosts.len(),
            status = %self.status,
            "Hosts classified"
        );
        Ok(())
    }

    /// TRANSITION once both populations are non-empty, RUNNING until then
    pub fn get_execution_status(&self) -> AnalysisStatus {
        if !self.control_hosts.is_empty() && !self.test_hosts.is_empty() {
            AnalysisStatus::Transition
        } else {
            AnalysisStatus::Running
        }
    }

    /// Hand the classified hosts to the analysis state for the chosen mode
    pub fn handle_transition(self) -> AnalysisState {
        let mode = self.mode.unwrap_or(AnalysisMode::Canary);
        let next = CanaryAnalysisState::new(self.input, self.control_hosts, self.test_hosts);
        match mode {
            AnalysisMode::Canary => AnalysisState::Canary(next),
            AnalysisMode::ImprovisedCanary => AnalysisState::ImprovisedCanary(next),
        }
    }

    /// Count a retry; FAILED on reaching `max_retry`, otherwise clear the
    /// computed sets and sample again
    pub async fn handle_retry(
        &mut self,
        lookup: &dyn HostRecordLookup,
        max_retry: u32,
    ) -> EngineResult<()> {
        self.retry_count += 1;
        if self.retry_count >= max_retry {
            self.status = AnalysisStatus::Failed;
            return Ok(());
        }

        self.pre_deployment_hosts.clear();
        self.post_deployment_hosts.clear();
        self.control_hosts.clear();
        self.test_hosts.clear();
        self.mode = None;
        self.execute(lookup).await
    }
}
