mod common;

use async_trait::async_trait;
use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steprunner_core::config::{RestraintConfig, StaticFeatureFlags};
use steprunner_core::constants::flags;
use steprunner_core::error::{EngineError, EngineResult, ErrorCategory};
use steprunner_core::execution::{StartOutcome, StepResponse};
use steprunner_core::restraint::{
    ConsumerState, ExecutionStoreLookup, HoldingScope, InMemoryRestraintStore,
    RegistrationRequest, RestraintInstance, RestraintService, RestraintStore,
    RESOURCE_RESTRAINT_STEP_TYPE,
};
use steprunner_core::state_machine::ExecutionStatus;

const UNIT: &str = "deploy-repo-x";

fn request(consumer_id: &str, permits: i32, release_entity_id: &str) -> RegistrationRequest {
    RegistrationRequest {
        resource_unit: UNIT.to_string(),
        consumer_id: consumer_id.to_string(),
        permits,
        holding_scope: HoldingScope::Plan,
        release_entity_id: release_entity_id.to_string(),
        account_id: "acct-1".to_string(),
    }
}

fn restraint_params(permits: i32, acquire_mode: &str) -> serde_json::Value {
    json!({
        "resource_unit": UNIT,
        "permits": permits,
        "holding_scope": "PLAN",
        "acquire_mode": acquire_mode,
    })
}

async fn state_of(h: &RestraintHarness, consumer_id: &str) -> ConsumerState {
    h.restraint_store
        .get_instance(consumer_id)
        .await
        .unwrap()
        .expect("instance exists")
        .state
}

#[tokio::test]
async fn test_single_permit_admits_in_registration_order() {
    let h = RestraintHarness::new(1);

    let a = h.service.register(&request("a", 1, "p1")).await.unwrap();
    let b = h.service.register(&request("b", 1, "p2")).await.unwrap();
    let c = h.service.register(&request("c", 1, "p3")).await.unwrap();

    assert_eq!((a.state, a.order), (ConsumerState::Active, Some(1)));
    assert_eq!((b.state, b.order), (ConsumerState::Blocked, Some(2)));
    assert_eq!((c.state, c.order), (ConsumerState::Blocked, Some(3)));

    let promoted = h.service.finish_and_promote("a").await.unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].id, "b");
    assert_eq!(state_of(&h, "c").await, ConsumerState::Blocked);

    let promoted = h.service.finish_and_promote("b").await.unwrap();
    assert_eq!(promoted[0].id, "c");
}

#[tokio::test]
async fn test_smaller_request_never_jumps_the_queue() {
    let h = RestraintHarness::new(3);

    h.service.register(&request("a", 2, "p1")).await.unwrap();
    let b = h.service.register(&request("b", 2, "p2")).await.unwrap();
    // would fit, but b is already waiting
    let c = h.service.register(&request("c", 1, "p3")).await.unwrap();
    assert_eq!(b.state, ConsumerState::Blocked);
    assert_eq!(c.state, ConsumerState::Blocked);

    let promoted = h.service.finish_and_promote("a").await.unwrap();
    let ids: Vec<&str> = promoted.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c"]);
}

#[tokio::test]
async fn test_invalid_permits_rejected_before_persisting() {
    let h = RestraintHarness::new(2);

    for permits in [0, -1, 3] {
        let err = h
            .service
            .register(&request("x", permits, "p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPermits { .. }));
    }
    assert_eq!(h.restraint_store.instance_count(), 0);
}

#[tokio::test]
async fn test_queue_length_gate_only_when_flag_enabled() {
    let h = RestraintHarness::with_config(RestraintConfig {
        default_capacity: 1,
        max_queue_length: 1,
        ..RestraintConfig::default()
    });

    h.service.register(&request("a", 1, "p1")).await.unwrap();
    h.service.register(&request("b", 1, "p2")).await.unwrap();
    let c = h.service.register(&request("c", 1, "p3")).await.unwrap();
    assert_eq!(c.state, ConsumerState::Blocked);

    h.flags
        .enable_for_account(flags::RESOURCE_CONSTRAINT_MAX_QUEUE, "acct-1");
    let d = h.service.register(&request("d", 1, "p4")).await.unwrap();
    assert_eq!(d.state, ConsumerState::Rejected);
    assert_eq!(d.order, None);
    assert_eq!(h.restraint_store.instance_count(), 3);
}

#[tokio::test]
async fn test_finish_is_idempotent() {
    let h = RestraintHarness::new(1);
    h.service.register(&request("a", 1, "p1")).await.unwrap();

    assert!(h.service.finish("a").await.unwrap().is_some());
    assert!(h.service.finish("a").await.unwrap().is_none());
    assert!(h.service.finish("never-registered").await.unwrap().is_none());
}

#[tokio::test]
async fn test_restraint_step_waits_until_promoted() {
    let mut h = RestraintHarness::new(1);
    let params = restraint_params(1, "ACCUMULATE");

    let first = h
        .harness
        .engine
        .start(ambiance("e1", "p1"), RESOURCE_RESTRAINT_STEP_TYPE, params.clone(), json!({}))
        .await
        .unwrap();
    assert!(matches!(first, StartOutcome::Completed(ref r) if r.status == ExecutionStatus::Succeeded));

    let second = h
        .harness
        .engine
        .start(ambiance("e2", "p2"), RESOURCE_RESTRAINT_STEP_TYPE, params, json!({}))
        .await
        .unwrap();
    let StartOutcome::Suspended { callback_ids } = second else {
        panic!("second consumer should queue");
    };
    assert_eq!(callback_ids.len(), 1);
    assert_eq!(state_of(&h, &callback_ids[0]).await, ConsumerState::Blocked);

    let holder = h
        .restraint_store
        .instances_in_states(UNIT, &[ConsumerState::Active])
        .await
        .unwrap()
        .remove(0);
    assert_eq!(holder.release_entity_id, "p1");

    h.service.finish_and_promote(&holder.id).await.unwrap();
    h.harness.worker.drain_pending().await;

    assert_eq!(h.harness.status("e2").await, ExecutionStatus::Succeeded);
    let outcome = h.harness.store_node("e2").await.response.unwrap().outcome.unwrap();
    assert_eq!(outcome["resource_unit"], UNIT);
    assert_eq!(outcome["capacity"], 1);
    assert_eq!(outcome["usage"], 1);
}

#[tokio::test]
async fn test_ensure_mode_counts_permits_already_held() {
    let h = RestraintHarness::new(2);

    h.harness
        .engine
        .start(ambiance("e1", "p1"), RESOURCE_RESTRAINT_STEP_TYPE, restraint_params(1, "ACCUMULATE"), json!({}))
        .await
        .unwrap();
    let ensured = h
        .harness
        .engine
        .start(ambiance("e2", "p1"), RESOURCE_RESTRAINT_STEP_TYPE, restraint_params(1, "ENSURE"), json!({}))
        .await
        .unwrap();

    assert!(matches!(ensured, StartOutcome::Completed(ref r) if r.status == ExecutionStatus::Succeeded));
    assert_eq!(h.restraint_store.instance_count(), 1);
}

#[tokio::test]
async fn test_rejected_consumer_fails_the_step() {
    let h = RestraintHarness::with_config(RestraintConfig {
        default_capacity: 1,
        max_queue_length: 0,
        ..RestraintConfig::default()
    });
    h.flags.enable(flags::RESOURCE_CONSTRAINT_MAX_QUEUE);
    let params = restraint_params(1, "ACCUMULATE");

    h.harness
        .engine
        .start(ambiance("e1", "p1"), RESOURCE_RESTRAINT_STEP_TYPE, params.clone(), json!({}))
        .await
        .unwrap();
    // zero-length queue: anyone who would wait is turned away
    let StartOutcome::Completed(rejected) = h
        .harness
        .engine
        .start(ambiance("e2", "p2"), RESOURCE_RESTRAINT_STEP_TYPE, params, json!({}))
        .await
        .unwrap()
    else {
        panic!("rejected consumer should not suspend");
    };

    assert_eq!(rejected.status, ExecutionStatus::Failed);
    assert_eq!(rejected.failure.unwrap().category, ErrorCategory::Business);
}

#[tokio::test]
async fn test_aborted_step_gives_up_its_place() {
    let mut h = RestraintHarness::new(1);
    let params = restraint_params(1, "ACCUMULATE");

    h.harness
        .engine
        .start(ambiance("e1", "p1"), RESOURCE_RESTRAINT_STEP_TYPE, params.clone(), json!({}))
        .await
        .unwrap();
    let StartOutcome::Suspended { callback_ids } = h
        .harness
        .engine
        .start(ambiance("e2", "p2"), RESOURCE_RESTRAINT_STEP_TYPE, params, json!({}))
        .await
        .unwrap()
    else {
        panic!("second consumer should queue");
    };

    h.harness.engine.abort("e2").await;
    h.harness
        .engine
        .conclude("e2", StepResponse::with_status(ExecutionStatus::Aborted))
        .await
        .unwrap();
    assert_eq!(state_of(&h, &callback_ids[0]).await, ConsumerState::Finished);

    let holder = h
        .restraint_store
        .instances_in_states(UNIT, &[ConsumerState::Active])
        .await
        .unwrap()
        .remove(0);
    let promoted = h.service.finish_and_promote(&holder.id).await.unwrap();
    assert!(promoted.is_empty());
    assert_eq!(h.harness.worker.drain_pending().await, 0);
}

#[tokio::test]
async fn test_cleanup_releases_orphaned_and_finished_holders() {
    let h = RestraintHarness::new(1);
    h.harness.insert_running_entity("plan-live").await;

    // no node exists for plan-gone, so its claim is orphaned
    h.service
        .register(&request("orphan", 1, "plan-gone"))
        .await
        .unwrap();
    h.service
        .register(&request("waiting", 1, "plan-live"))
        .await
        .unwrap();

    let report = h.service.cleanup().await.unwrap();

    assert_eq!(report.examined, 2);
    assert_eq!(report.finished, 1);
    assert_eq!(report.promoted, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(state_of(&h, "orphan").await, ConsumerState::Finished);
    assert_eq!(state_of(&h, "waiting").await, ConsumerState::Active);

    let again = h.service.cleanup().await.unwrap();
    assert_eq!((again.finished, again.promoted), (0, 0));
}

#[tokio::test]
async fn test_delete_for_release_entities() {
    let h = RestraintHarness::new(2);
    h.service.register(&request("a", 1, "p1")).await.unwrap();
    h.service.register(&request("b", 1, "p2")).await.unwrap();

    assert_eq!(
        h.service
            .delete_instances_for_release_entities(&[], HoldingScope::Plan)
            .await
            .unwrap(),
        0
    );
    let deleted = h
        .service
        .delete_instances_for_release_entities(&["p1".to_string()], HoldingScope::Plan)
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(h.restraint_store.instance_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registrations_get_dense_orders() {
    let h = RestraintHarness::new(1);

    let registrations = (0..16).map(|i| {
        let service = h.service.clone();
        async move {
            service
                .register(&request(&format!("c{i}"), 1, &format!("p{i}")))
                .await
        }
    });
    let outcomes = futures::future::join_all(registrations).await;

    let mut orders: Vec<i64> = outcomes
        .iter()
        .map(|o| o.as_ref().unwrap().order.expect("persisted"))
        .collect();
    orders.sort_unstable();
    assert_eq!(orders, (1..=16).collect::<Vec<i64>>());

    let active = outcomes
        .iter()
        .filter(|o| o.as_ref().unwrap().state == ConsumerState::Active)
        .count();
    assert_eq!(active, 1);
}

#[tokio::test]
async fn test_orders_not_reused_after_delete() {
    let h = RestraintHarness::new(2);
    h.service.register(&request("a", 1, "p1")).await.unwrap();
    h.service.register(&request("b", 1, "p2")).await.unwrap();
    h.service
        .delete_instances_for_release_entities(&["p2".to_string()], HoldingScope::Plan)
        .await
        .unwrap();

    let c = h.service.register(&request("c", 1, "p3")).await.unwrap();
    assert_eq!(c.order, Some(3));
}

/// Stalls once after its first read of live instances, long enough for the
/// caller's unit lease to lapse
struct StallingStore {
    inner: Arc<InMemoryRestraintStore>,
    stalled: AtomicBool,
    stall: Duration,
}

#[async_trait]
impl RestraintStore for StallingStore {
    async fn ensure_unit(&self, resource_unit: &str, capacity: i32) -> EngineResult<i32> {
        self.inner.ensure_unit(resource_unit, capacity).await
    }

    async fn try_lock_unit(
        &self,
        resource_unit: &str,
        holder: &str,
        lease: Duration,
    ) -> EngineResult<bool> {
        self.inner.try_lock_unit(resource_unit, holder, lease).await
    }

    async fn unlock_unit(&self, resource_unit: &str, holder: &str) -> EngineResult<()> {
        self.inner.unlock_unit(resource_unit, holder).await
    }

    async fn max_order(&self, resource_unit: &str) -> EngineResult<i64> {
        self.inner.max_order(resource_unit).await
    }

    async fn insert_instance(
        &self,
        instance: RestraintInstance,
        lease_holder: &str,
    ) -> EngineResult<()> {
        self.inner.insert_instance(instance, lease_holder).await
    }

    async fn get_instance(&self, id: &str) -> EngineResult<Option<RestraintInstance>> {
        self.inner.get_instance(id).await
    }

    async fn instances_in_states(
        &self,
        resource_unit: &str,
        states: &[ConsumerState],
    ) -> EngineResult<Vec<RestraintInstance>> {
        let found = self.inner.instances_in_states(resource_unit, states).await?;
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        Ok(found)
    }

    async fn live_instances(&self) -> EngineResult<Vec<RestraintInstance>> {
        self.inner.live_instances().await
    }

    async fn activate_blocked(
        &self,
        resource_unit: &str,
        id: &str,
        lease_holder: &str,
    ) -> EngineResult<Option<RestraintInstance>> {
        self.inner.activate_blocked(resource_unit, id, lease_holder).await
    }

    async fn finish_instance(&self, id: &str) -> EngineResult<Option<RestraintInstance>> {
        self.inner.finish_instance(id).await
    }

    async fn active_permits_for(
        &self,
        scope: HoldingScope,
        release_entity_id: &str,
        resource_unit: &str,
    ) -> EngineResult<i32> {
        self.inner
            .active_permits_for(scope, release_entity_id, resource_unit)
            .await
    }

    async fn delete_for_release_entities(
        &self,
        release_entity_ids: &[String],
        scope: HoldingScope,
    ) -> EngineResult<u64> {
        self.inner
            .delete_for_release_entities(release_entity_ids, scope)
            .await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_registrant_cannot_write_through_a_lapsed_lease() {
    let harness = TestHarness::new();
    let inner = Arc::new(InMemoryRestraintStore::new());
    let store = Arc::new(StallingStore {
        inner: inner.clone(),
        stalled: AtomicBool::new(false),
        stall: Duration::from_millis(300),
    });
    let service = Arc::new(RestraintService::new(
        store,
        harness.waiter.clone(),
        Arc::new(ExecutionStoreLookup::new(harness.store.clone())),
        Arc::new(StaticFeatureFlags::new()),
        harness.publisher.clone(),
        RestraintConfig {
            default_capacity: 1,
            lock_lease_ms: 50,
            ..RestraintConfig::default()
        },
    ));

    let stalled = {
        let service = service.clone();
        tokio::spawn(async move { service.register(&request("a", 1, "p1")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let b = service.register(&request("b", 1, "p2")).await.unwrap();
    let a = stalled.await.unwrap().unwrap();

    let active = inner
        .instances_in_states(UNIT, &[ConsumerState::Active])
        .await
        .unwrap();
    assert!(active.len() <= 1, "{} consumers ACTIVE", active.len());

    // a re-read the unit under a fresh lease and queued behind b
    assert_eq!((b.state, b.order), (ConsumerState::Active, Some(1)));
    assert_eq!((a.state, a.order), (ConsumerState::Blocked, Some(2)));
}
