//! # Resource Constraint Service
//!
//! Strict-FIFO, bounded-concurrency admission keyed by resource unit.
//!
//! Registration and promotion both read the unit's live instances, decide and
//! write while holding the unit lease, so at most `capacity` permits are ever
//! ACTIVE and blocked consumers are admitted in ascending order. The store
//! fences every admission write on the lease holder; a lease that lapsed
//! mid-decision surfaces as [`EngineError::LeaseLost`] and the whole
//! read-decide-write cycle is retried under a fresh lease. Finishing is a
//! conditional update and needs no lease.

use super::store::RestraintStore;
use super::types::{
    CleanupReport, ConsumerState, HoldingScope, RegistrationOutcome, RegistrationRequest,
    ReleaseEntityStatus, RestraintInstance,
};
use crate::config::{FeatureFlags, RestraintConfig};
use crate::constants::{events, flags};
use crate::error::{EngineError, EngineResult};
use crate::events::EventPublisher;
use crate::execution::store::ExecutionStore;
use crate::execution::types::ResponseData;
use crate::logging::{log_error, log_restraint_operation};
use crate::waiter::WaitNotifyEngine;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Answers whether the entity holding a claim has terminated
#[async_trait]
pub trait ReleaseEntityLookup: Send + Sync {
    async fn status(
        &self,
        scope: HoldingScope,
        release_entity_id: &str,
    ) -> EngineResult<ReleaseEntityStatus>;
}

/// Lookup over the execution store: plans, pipelines and stages are all nodes
pub struct ExecutionStoreLookup {
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionStoreLookup {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReleaseEntityLookup for ExecutionStoreLookup {
    async fn status(
        &self,
        _scope: HoldingScope,
        release_entity_id: &str,
    ) -> EngineResult<ReleaseEntityStatus> {
        Ok(match self.store.get_node(release_entity_id).await? {
            Some(node) if node.status.is_terminal() => ReleaseEntityStatus::Finished,
            Some(_) => ReleaseEntityStatus::Running,
            None => ReleaseEntityStatus::Missing,
        })
    }
}

pub struct RestraintService {
    store: Arc<dyn RestraintStore>,
    waiter: Arc<dyn WaitNotifyEngine>,
    lookup: Arc<dyn ReleaseEntityLookup>,
    flags: Arc<dyn FeatureFlags>,
    publisher: EventPublisher,
    config: RestraintConfig,
}

impl RestraintService {
    pub fn new(
        store: Arc<dyn RestraintStore>,
        waiter: Arc<dyn WaitNotifyEngine>,
        lookup: Arc<dyn ReleaseEntityLookup>,
        flags: Arc<dyn FeatureFlags>,
        publisher: EventPublisher,
        config: RestraintConfig,
    ) -> Self {
        Self {
            store,
            waiter,
            lookup,
            flags,
            publisher,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RestraintStore> {
        &self.store
    }

    /// Persisted capacity of a unit, initializing it from configuration
    pub async fn capacity(&self, resource_unit: &str) -> EngineResult<i32> {
        self.store
            .ensure_unit(resource_unit, self.config.capacity_for(resource_unit))
            .await
    }

    /// Register a consumer and assign it the next order on the unit.
    ///
    /// The consumer is ACTIVE when its permits fit and nobody is queued ahead,
    /// BLOCKED otherwise. A consumer that would block is REJECTED (not
    /// persisted) instead when the queue-length gate is enabled for the
    /// account and the queue is full.
    pub async fn register(&self, request: &RegistrationRequest) -> EngineResult<RegistrationOutcome> {
        let capacity = self.capacity(&request.resource_unit).await?;
        if request.permits <= 0 || request.permits > capacity {
            return Err(EngineError::InvalidPermits {
                resource_unit: request.resource_unit.clone(),
                permits: request.permits,
                capacity,
            });
        }

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let holder = self.lock_unit(&request.resource_unit).await?;
            let result = self.register_locked(request, capacity, &holder).await;
            self.unlock_unit(&request.resource_unit, &holder).await;

            match result {
                Err(EngineError::LeaseLost { .. })
                    if attempt < self.config.register_max_attempts =>
                {
                    warn!(
                        resource_unit = %request.resource_unit,
                        consumer_id = %request.consumer_id,
                        attempt = attempt,
                        "Unit lease lapsed before registration was written; retrying"
                    );
                }
                other => break other?,
            }
        };

        log_restraint_operation(
            "register",
            &request.resource_unit,
            Some(&request.consumer_id),
            outcome.order,
            outcome.state.as_str(),
            None,
        );
        Ok(outcome)
    }

    async fn register_locked(
        &self,
        request: &RegistrationRequest,
        capacity: i32,
        holder: &str,
    ) -> EngineResult<RegistrationOutcome> {
        let unit = &request.resource_unit;

        for attempt in 1..=self.config.register_max_attempts {
            let live = self
                .store
                .instances_in_states(unit, &[ConsumerState::Active, ConsumerState::Blocked])
                .await?;
            let blocked = live
                .iter()
                .filter(|i| i.state == ConsumerState::Blocked)
                .count();

            let active_permits: i32 = live
                .iter()
                .filter(|i| i.state == ConsumerState::Active)
                .map(|i| i.permits)
                .sum();
            let state = if blocked == 0 && active_permits + request.permits <= capacity {
                ConsumerState::Active
            } else {
                ConsumerState::Blocked
            };

            if state == ConsumerState::Blocked
                && self
                    .flags
                    .is_enabled(flags::RESOURCE_CONSTRAINT_MAX_QUEUE, &request.account_id)
                && blocked >= self.config.max_queue_length
            {
                warn!(
                    resource_unit = %unit,
                    consumer_id = %request.consumer_id,
                    queued = blocked,
                    "Queue full; consumer rejected"
                );
                return Ok(RegistrationOutcome {
                    consumer_id: request.consumer_id.clone(),
                    order: None,
                    state: ConsumerState::Rejected,
                });
            }

            let order = self.store.max_order(unit).await? + 1;
            let now = Utc::now();
            let instance = RestraintInstance {
                id: request.consumer_id.clone(),
                resource_unit: unit.clone(),
                release_entity_type: request.holding_scope,
                release_entity_id: request.release_entity_id.clone(),
                permits: request.permits,
                order,
                state,
                acquired_at: (state == ConsumerState::Active).then_some(now),
                created_at: now,
            };

            match self.store.insert_instance(instance, holder).await {
                Ok(()) => {
                    return Ok(RegistrationOutcome {
                        consumer_id: request.consumer_id.clone(),
                        order: Some(order),
                        state,
                    })
                }
                Err(EngineError::DuplicateOrder { order, .. }) => {
                    debug!(
                        resource_unit = %unit,
                        order = order,
                        attempt = attempt,
                        "Order taken by a concurrent registrant; retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::Contended {
            resource_unit: unit.clone(),
            attempts: self.config.register_max_attempts,
        })
    }

    /// Move an ACTIVE or BLOCKED consumer to FINISHED. Returns `None` when
    /// the consumer is missing or already finished.
    pub async fn finish(&self, consumer_id: &str) -> EngineResult<Option<RestraintInstance>> {
        let Some(instance) = self.store.finish_instance(consumer_id).await? else {
            warn!(consumer_id = %consumer_id, "Cannot finish consumer: missing or already finished");
            return Ok(None);
        };

        log_restraint_operation(
            "finish",
            &instance.resource_unit,
            Some(consumer_id),
            Some(instance.order),
            ConsumerState::Finished.as_str(),
            None,
        );
        self.publish(
            events::RESTRAINT_CONSUMER_FINISHED,
            json!({
                "consumer_id": consumer_id,
                "resource_unit": instance.resource_unit,
                "order": instance.order,
            }),
        )
        .await;
        Ok(Some(instance))
    }

    /// Finish a consumer and admit whoever it was holding back
    pub async fn finish_and_promote(
        &self,
        consumer_id: &str,
    ) -> EngineResult<Vec<RestraintInstance>> {
        match self.finish(consumer_id).await? {
            Some(instance) => self.promote_blocked(&instance.resource_unit).await,
            None => Ok(Vec::new()),
        }
    }

    /// Promote BLOCKED consumers in ascending order while their permits fit,
    /// stopping at the first that does not. Each promoted consumer is notified
    /// once through the wait-notify engine.
    pub async fn promote_blocked(&self, resource_unit: &str) -> EngineResult<Vec<RestraintInstance>> {
        let capacity = self.capacity(resource_unit).await?;
        let mut promoted = Vec::new();
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let holder = match self.lock_unit(resource_unit).await {
                Ok(holder) => holder,
                Err(e) => break Err(e),
            };
            let result = self
                .promote_locked(resource_unit, capacity, &holder, &mut promoted)
                .await;
            self.unlock_unit(resource_unit, &holder).await;

            match result {
                Err(EngineError::LeaseLost { .. })
                    if attempt < self.config.register_max_attempts =>
                {
                    warn!(
                        resource_unit = %resource_unit,
                        promoted = promoted.len(),
                        attempt = attempt,
                        "Unit lease lapsed during promotion; retrying"
                    );
                }
                other => break other,
            }
        };

        // Anyone already activated is told, even if a later step failed.
        // A failed notification leaves the consumer ACTIVE.
        for instance in &promoted {
            self.notify_unblocked(instance).await;
        }
        result.map(|()| promoted)
    }

    async fn promote_locked(
        &self,
        resource_unit: &str,
        capacity: i32,
        holder: &str,
        promoted: &mut Vec<RestraintInstance>,
    ) -> EngineResult<()> {
        let live = self
            .store
            .instances_in_states(
                resource_unit,
                &[ConsumerState::Active, ConsumerState::Blocked],
            )
            .await?;

        let mut used: i32 = live
            .iter()
            .filter(|i| i.state == ConsumerState::Active)
            .map(|i| i.permits)
            .sum();

        for candidate in live.iter().filter(|i| i.state == ConsumerState::Blocked) {
            if used + candidate.permits > capacity {
                break;
            }
            if let Some(instance) = self
                .store
                .activate_blocked(resource_unit, &candidate.id, holder)
                .await?
            {
                used += instance.permits;
                promoted.push(instance);
            }
        }
        Ok(())
    }

    async fn notify_unblocked(&self, instance: &RestraintInstance) {
        let response = ResponseData::RestraintUnblocked {
            resource_unit: instance.resource_unit.clone(),
        };
        if let Err(e) = self.waiter.done_with(&instance.id, response).await {
            log_error(
                "restraint",
                "notify_unblocked",
                &e.to_string(),
                Some(&instance.id),
            );
        }

        log_restraint_operation(
            "promote",
            &instance.resource_unit,
            Some(&instance.id),
            Some(instance.order),
            ConsumerState::Active.as_str(),
            None,
        );
        self.publish(
            events::RESTRAINT_CONSUMER_UNBLOCKED,
            json!({
                "consumer_id": instance.id,
                "resource_unit": instance.resource_unit,
                "order": instance.order,
            }),
        )
        .await;
    }

    /// Sweep every live consumer, finishing those whose releasing entity has
    /// terminated. One failing consumer does not stop the sweep.
    pub async fn cleanup(&self) -> EngineResult<CleanupReport> {
        let live = self.store.live_instances().await?;
        let mut report = CleanupReport {
            examined: live.len(),
            ..Default::default()
        };

        for instance in &live {
            match self.process_instance(instance).await {
                Ok((finished, promoted)) => {
                    report.finished += usize::from(finished);
                    report.promoted += promoted;
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(
                        consumer_id = %instance.id,
                        resource_unit = %instance.resource_unit,
                        error = %e,
                        "Cleanup failed for consumer; continuing"
                    );
                }
            }
        }

        if report.finished > 0 || report.promoted > 0 {
            info!(
                examined = report.examined,
                finished = report.finished,
                promoted = report.promoted,
                failures = report.failures,
                "Restraint cleanup sweep complete"
            );
        }
        Ok(report)
    }

    /// Reconcile one consumer: finish it if its releasing entity is gone, and
    /// retry admission on its unit. Returns whether it was finished and how
    /// many consumers were promoted.
    pub async fn process_instance(&self, instance: &RestraintInstance) -> EngineResult<(bool, usize)> {
        let status = self
            .lookup
            .status(instance.release_entity_type, &instance.release_entity_id)
            .await?;

        let finished = match status {
            ReleaseEntityStatus::Running => false,
            ReleaseEntityStatus::Finished | ReleaseEntityStatus::Missing => {
                if status == ReleaseEntityStatus::Missing {
                    debug!(
                        consumer_id = %instance.id,
                        release_entity_id = %instance.release_entity_id,
                        "Releasing entity missing; finishing orphaned consumer"
                    );
                }
                self.finish(&instance.id).await?.is_some()
            }
        };

        if finished || instance.state == ConsumerState::Blocked {
            let promoted = self.promote_blocked(&instance.resource_unit).await?;
            return Ok((finished, promoted.len()));
        }
        Ok((finished, 0))
    }

    /// Permits currently held ACTIVE by a releasing entity on a unit
    pub async fn acquired_permits(
        &self,
        scope: HoldingScope,
        release_entity_id: &str,
        resource_unit: &str,
    ) -> EngineResult<i32> {
        self.store
            .active_permits_for(scope, release_entity_id, resource_unit)
            .await
    }

    pub async fn delete_instances_for_release_entities(
        &self,
        release_entity_ids: &[String],
        scope: HoldingScope,
    ) -> EngineResult<u64> {
        if release_entity_ids.is_empty() {
            return Ok(0);
        }
        let removed = self
            .store
            .delete_for_release_entities(release_entity_ids, scope)
            .await?;
        debug!(scope = %scope, removed = removed, "Deleted consumers for release entities");
        Ok(removed)
    }

    async fn lock_unit(&self, resource_unit: &str) -> EngineResult<String> {
        let holder = Uuid::new_v4().to_string();
        let lease = self.config.lock_lease();

        for _ in 0..self.config.lock_max_attempts {
            if self
                .store
                .try_lock_unit(resource_unit, &holder, lease)
                .await?
            {
                return Ok(holder);
            }
            tokio::time::sleep(self.config.lock_retry_backoff()).await;
        }

        Err(EngineError::Contended {
            resource_unit: resource_unit.to_string(),
            attempts: self.config.lock_max_attempts,
        })
    }

    async fn unlock_unit(&self, resource_unit: &str, holder: &str) {
        if let Err(e) = self.store.unlock_unit(resource_unit, holder).await {
            warn!(resource_unit = %resource_unit, error = %e, "Failed to release unit lease");
        }
    }

    async fn publish(&self, event: &str, context: serde_json::Value) {
        if let Err(e) = self.publisher.publish(event, context).await {
            debug!(event = event, error = %e, "Event publish failed");
        }
    }
}
