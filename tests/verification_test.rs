use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steprunner_core::config::VerificationConfig;
use steprunner_core::error::{EngineError, EngineResult};
use steprunner_core::events::EventPublisher;
use steprunner_core::verification::{
    AnalysisMode, AnalysisState, AnalysisStateMachine, AnalysisStatus, AnalysisTaskKind,
    AnalysisTaskScheduler, AnalysisTaskStatus, CanaryAnalysisState, HostRecordLookup, HostSet,
    Tick, VerificationInput, VerificationOutcome,
};

fn hosts(names: &[&str]) -> HostSet {
    names.iter().map(|n| n.to_string()).collect()
}

/// Serves fixed host sets after failing a configured number of lookups
struct FlakyHosts {
    pre: HostSet,
    post: HostSet,
    deployment_start: DateTime<Utc>,
    failures_left: AtomicU32,
}

#[async_trait]
impl HostRecordLookup for FlakyHosts {
    async fn hosts_in_range(
        &self,
        _verification_task_id: &str,
        start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> EngineResult<HostSet> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::DatabaseError("metrics store unavailable".to_string()));
        }
        Ok(if start < self.deployment_start {
            self.pre.clone()
        } else {
            self.post.clone()
        })
    }
}

#[derive(Default)]
struct ImmediateScheduler {
    scheduled: Mutex<Vec<(AnalysisTaskKind, HostSet, HostSet)>>,
}

#[async_trait]
impl AnalysisTaskScheduler for ImmediateScheduler {
    async fn schedule(
        &self,
        kind: AnalysisTaskKind,
        state: &CanaryAnalysisState,
    ) -> EngineResult<String> {
        self.scheduled
            .lock()
            .push((kind, state.control_hosts.clone(), state.test_hosts.clone()));
        Ok("analysis-1".to_string())
    }

    async fn task_status(&self, _task_id: &str) -> EngineResult<AnalysisTaskStatus> {
        Ok(AnalysisTaskStatus::Success)
    }
}

fn input(topology: &str, deployment_start: DateTime<Utc>) -> VerificationInput {
    VerificationInput {
        verification_task_id: "verify-42".to_string(),
        topology: topology.to_string(),
        pre_deployment_start: deployment_start - ChronoDuration::minutes(10),
        deployment_start,
        post_deployment_end: deployment_start + ChronoDuration::minutes(10),
    }
}

fn machine(
    failures: u32,
    deployment_start: DateTime<Utc>,
    scheduler: Arc<ImmediateScheduler>,
) -> AnalysisStateMachine {
    AnalysisStateMachine::new(
        Arc::new(FlakyHosts {
            pre: hosts(&["h1", "h2"]),
            post: hosts(&["h1", "h2", "h3"]),
            deployment_start,
            failures_left: AtomicU32::new(failures),
        }),
        scheduler,
        EventPublisher::new(32),
        VerificationConfig {
            max_retry: 3,
            max_sampling_polls: 5,
        },
    )
}

#[tokio::test]
async fn test_sampling_recovers_within_retry_budget() {
    let now = Utc::now();
    let scheduler = Arc::new(ImmediateScheduler::default());
    let machine = machine(2, now, scheduler.clone());

    let outcome = machine
        .run_to_completion(input("CANARY", now), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        VerificationOutcome::Succeeded {
            mode: AnalysisMode::Canary,
            control_hosts: hosts(&["h1", "h2"]),
            test_hosts: hosts(&["h3"]),
        }
    );
    let scheduled = scheduler.scheduled.lock();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].2, hosts(&["h3"]));
}

#[tokio::test]
async fn test_sampling_fails_after_max_retry() {
    let now = Utc::now();
    let scheduler = Arc::new(ImmediateScheduler::default());
    let machine = machine(u32::MAX, now, scheduler.clone());

    let outcome = machine
        .run_to_completion(input("ROLLING", now), Duration::ZERO)
        .await
        .unwrap();

    match outcome {
        VerificationOutcome::Failed {
            reason,
            retry_count,
        } => {
            assert_eq!(retry_count, 3);
            assert!(reason.contains("metrics store unavailable"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(scheduler.scheduled.lock().is_empty());
}

#[tokio::test]
async fn test_state_survives_persistence_between_ticks() {
    let now = Utc::now();
    let scheduler = Arc::new(ImmediateScheduler::default());
    let machine = machine(0, now, scheduler.clone());

    let state = machine.start(input("AUTO", now)).await.unwrap();
    let Tick::Continue(state) = machine.tick(state).await.unwrap() else {
        panic!("expected analysis state");
    };
    assert_eq!(state.status(), AnalysisStatus::Running);

    // a different worker picks the job up from its stored form
    let stored = serde_json::to_string(&state).unwrap();
    let restored: AnalysisState = serde_json::from_str(&stored).unwrap();
    assert_eq!(restored, state);

    let tick = machine.tick(restored).await.unwrap();
    assert!(matches!(
        tick,
        Tick::Done(VerificationOutcome::Succeeded {
            mode: AnalysisMode::Canary,
            ..
        })
    ));
}
