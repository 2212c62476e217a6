//! # Restraint Ledger Store
//!
//! Persistence contract for the consumer ledger. Every state change is a
//! conditional update on the current state, and `(resource_unit, order)` is
//! unique, so a registrant that computed a stale order gets
//! [`EngineError::DuplicateOrder`] instead of a silent duplicate.
//!
//! Per-unit mutual exclusion is a lease on the unit row: the holder must
//! release it, and an abandoned lease lapses after its duration. Admission
//! writes name the lease holder and fail with [`EngineError::LeaseLost`] once
//! the lease has lapsed, so a stalled holder cannot act on a stale read.
//!
//! Orders come from a per-unit counter, so deleting instances never frees an
//! order for reuse.

use super::types::{ConsumerState, HoldingScope, RestraintInstance};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[async_trait]
pub trait RestraintStore: Send + Sync {
    /// Create the unit row if missing; returns the persisted capacity
    async fn ensure_unit(&self, resource_unit: &str, capacity: i32) -> EngineResult<i32>;

    /// Take the unit lease if it is free or lapsed
    async fn try_lock_unit(&self, resource_unit: &str, holder: &str, lease: Duration)
        -> EngineResult<bool>;

    async fn unlock_unit(&self, resource_unit: &str, holder: &str) -> EngineResult<()>;

    /// Highest order ever assigned on the unit, 0 when none
    async fn max_order(&self, resource_unit: &str) -> EngineResult<i64>;

    /// Insert under the unit lease held by `lease_holder`. The order must be
    /// above every order assigned on the unit so far.
    async fn insert_instance(
        &self,
        instance: RestraintInstance,
        lease_holder: &str,
    ) -> EngineResult<()>;

    async fn get_instance(&self, id: &str) -> EngineResult<Option<RestraintInstance>>;

    /// Instances on a unit in any of `states`, ascending by order
    async fn instances_in_states(
        &self,
        resource_unit: &str,
        states: &[ConsumerState],
    ) -> EngineResult<Vec<RestraintInstance>>;

    /// ACTIVE and BLOCKED instances across all units
    async fn live_instances(&self) -> EngineResult<Vec<RestraintInstance>>;

    /// Conditional `BLOCKED -> ACTIVE` under the unit lease held by
    /// `lease_holder`; `None` if the instance was not blocked
    async fn activate_blocked(
        &self,
        resource_unit: &str,
        id: &str,
        lease_holder: &str,
    ) -> EngineResult<Option<RestraintInstance>>;

    /// Conditional `{ACTIVE, BLOCKED} -> FINISHED`; `None` if already terminal or missing
    async fn finish_instance(&self, id: &str) -> EngineResult<Option<RestraintInstance>>;

    /// Permits held ACTIVE by one releasing entity on a unit
    async fn active_permits_for(
        &self,
        scope: HoldingScope,
        release_entity_id: &str,
        resource_unit: &str,
    ) -> EngineResult<i32>;

    async fn delete_for_release_entities(
        &self,
        release_entity_ids: &[String],
        scope: HoldingScope,
    ) -> EngineResult<u64>;
}

#[derive(Debug)]
struct UnitRow {
    capacity: i32,
    lease: Option<(String, DateTime<Utc>)>,
    last_order: i64,
}

#[derive(Debug, Default)]
struct LedgerState {
    instances: HashMap<String, RestraintInstance>,
    units: HashMap<String, UnitRow>,
}

impl LedgerState {
    /// Last assigned order of a unit whose live lease belongs to `holder`
    fn held_unit(&self, resource_unit: &str, holder: &str) -> EngineResult<i64> {
        let now = Utc::now();
        match self.units.get(resource_unit) {
            Some(UnitRow {
                lease: Some((current, until)),
                last_order,
                ..
            }) if current == holder && *until > now => Ok(*last_order),
            _ => Err(EngineError::LeaseLost {
                resource_unit: resource_unit.to_string(),
            }),
        }
    }
}

/// Ledger held in process memory behind one lock
#[derive(Debug, Default)]
pub struct InMemoryRestraintStore {
    state: Mutex<LedgerState>,
}

impl InMemoryRestraintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }
}

#[async_trait]
impl RestraintStore for InMemoryRestraintStore {
    async fn ensure_unit(&self, resource_unit: &str, capacity: i32) -> EngineResult<i32> {
        let mut state = self.state.lock();
        let row = state
            .units
            .entry(resource_unit.to_string())
            .or_insert(UnitRow {
                capacity,
                lease: None,
                last_order: 0,
            });
        Ok(row.capacity)
    }

    async fn try_lock_unit(
        &self,
        resource_unit: &str,
        holder: &str,
        lease: Duration,
    ) -> EngineResult<bool> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| EngineError::ValidationError(e.to_string()))?;

        let mut state = self.state.lock();
        let row = state
            .units
            .get_mut(resource_unit)
            .ok_or_else(|| EngineError::ValidationError(format!(
                "Resource unit {resource_unit} not initialized"
            )))?;

        match &row.lease {
            Some((current, until)) if current != holder && *until > now => Ok(false),
            _ => {
                row.lease = Some((holder.to_string(), expires_at));
                Ok(true)
            }
        }
    }

    async fn unlock_unit(&self, resource_unit: &str, holder: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(row) = state.units.get_mut(resource_unit) {
            if row.lease.as_ref().is_some_and(|(current, _)| current == holder) {
                row.lease = None;
            }
        }
        Ok(())
    }

    async fn max_order(&self, resource_unit: &str) -> EngineResult<i64> {
        let state = self.state.lock();
        Ok(state
            .units
            .get(resource_unit)
            .map_or(0, |row| row.last_order))
    }

    async fn insert_instance(
        &self,
        instance: RestraintInstance,
        lease_holder: &str,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        let last_order = state.held_unit(&instance.resource_unit, lease_holder)?;
        if instance.order <= last_order {
            return Err(EngineError::DuplicateOrder {
                resource_unit: instance.resource_unit,
                order: instance.order,
            });
        }
        if state.instances.contains_key(&instance.id) {
            return Err(EngineError::ValidationError(format!(
                "Consumer {} already registered",
                instance.id
            )));
        }
        if let Some(row) = state.units.get_mut(&instance.resource_unit) {
            row.last_order = instance.order;
        }
        state.instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> EngineResult<Option<RestraintInstance>> {
        Ok(self.state.lock().instances.get(id).cloned())
    }

    async fn instances_in_states(
        &self,
        resource_unit: &str,
        states: &[ConsumerState],
    ) -> EngineResult<Vec<RestraintInstance>> {
        let state = self.state.lock();
        let mut instances: Vec<RestraintInstance> = state
            .instances
            .values()
            .filter(|i| i.resource_unit == resource_unit && states.contains(&i.state))
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.order);
        Ok(instances)
    }

    async fn live_instances(&self) -> EngineResult<Vec<RestraintInstance>> {
        let state = self.state.lock();
        let mut instances: Vec<RestraintInstance> = state
            .instances
            .values()
            .filter(|i| i.state.is_live())
            .cloned()
            .collect();
        instances.sort_by(|a, b| {
            a.resource_unit
                .cmp(&b.resource_unit)
                .then(a.order.cmp(&b.order))
        });
        Ok(instances)
    }

    async fn activate_blocked(
        &self,
        resource_unit: &str,
        id: &str,
        lease_holder: &str,
    ) -> EngineResult<Option<RestraintInstance>> {
        let mut state = self.state.lock();
        state.held_unit(resource_unit, lease_holder)?;
        match state.instances.get_mut(id) {
            Some(instance)
                if instance.resource_unit == resource_unit
                    && instance.state == ConsumerState::Blocked =>
            {
                instance.state = ConsumerState::Active;
                instance.acquired_at = Some(Utc::now());
                Ok(Some(instance.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn finish_instance(&self, id: &str) -> EngineResult<Option<RestraintInstance>> {
        let mut state = self.state.lock();
        match state.instances.get_mut(id) {
            Some(instance) if instance.state.is_live() => {
                instance.state = ConsumerState::Finished;
                Ok(Some(instance.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn active_permits_for(
        &self,
        scope: HoldingScope,
        release_entity_id: &str,
        resource_unit: &str,
    ) -> EngineResult<i32> {
        let state = self.state.lock();
        Ok(state
            .instances
            .values()
            .filter(|i| {
                i.state == ConsumerState::Active
                    && i.release_entity_type == scope
                    && i.release_entity_id == release_entity_id
                    && i.resource_unit == resource_unit
            })
            .map(|i| i.permits)
            .sum())
    }

    async fn delete_for_release_entities(
        &self,
        release_entity_ids: &[String],
        scope: HoldingScope,
    ) -> EngineResult<u64> {
        let mut state = self.state.lock();
        let before = state.instances.len();
        state.instances.retain(|_, i| {
            !(i.release_entity_type == scope && release_entity_ids.contains(&i.release_entity_id))
        });
        Ok((before - state.instances.len()) as u64)
    }
}
