//! PostgreSQL [`RestraintStore`].
//!
//! The unit lease is a conditional `UPDATE` on `restraint_units`. Admission
//! writes run in a transaction that first locks the unit row `FOR UPDATE`
//! while checking the caller still holds a live lease, so a lease taken over
//! by another worker cannot be written through. `restraint_units.last_order`
//! and the `(resource_unit, order_num)` unique index turn a stale order into
//! [`EngineError::DuplicateOrder`].

use crate::error::{EngineError, EngineResult};
use crate::restraint::store::RestraintStore;
use crate::restraint::types::{ConsumerState, HoldingScope, RestraintInstance};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;

const ORDER_INDEX: &str = "uq_restraint_instances_unit_order";

const INSTANCE_COLUMNS: &str = "id, resource_unit, release_entity_type, release_entity_id, \
     permits, order_num, state, acquired_at, created_at";

#[derive(Debug, Clone)]
pub struct PgRestraintStore {
    pool: PgPool,
}

impl PgRestraintStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn instance_from_row(row: &PgRow) -> EngineResult<RestraintInstance> {
    let scope: String = row.try_get("release_entity_type")?;
    let state: String = row.try_get("state")?;

    Ok(RestraintInstance {
        id: row.try_get("id")?,
        resource_unit: row.try_get("resource_unit")?,
        release_entity_type: scope.parse().map_err(EngineError::SerializationError)?,
        release_entity_id: row.try_get("release_entity_id")?,
        permits: row.try_get("permits")?,
        order: row.try_get("order_num")?,
        state: state.parse().map_err(EngineError::SerializationError)?,
        acquired_at: row.try_get("acquired_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn instances_from_rows(rows: &[PgRow]) -> EngineResult<Vec<RestraintInstance>> {
    rows.iter().map(instance_from_row).collect()
}

/// Lock the unit row if `holder` still holds a live lease; returns its last order
async fn lock_held_unit(
    tx: &mut Transaction<'_, Postgres>,
    resource_unit: &str,
    holder: &str,
) -> EngineResult<i64> {
    let last_order: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT last_order FROM restraint_units
         WHERE resource_unit = $1
           AND lease_holder = $2
           AND lease_expires_at > clock_timestamp()
        FOR UPDATE
        "#,
    )
    .bind(resource_unit)
    .bind(holder)
    .fetch_optional(&mut **tx)
    .await?;

    last_order.ok_or_else(|| EngineError::LeaseLost {
        resource_unit: resource_unit.to_string(),
    })
}

#[async_trait]
impl RestraintStore for PgRestraintStore {
    async fn ensure_unit(&self, resource_unit: &str, capacity: i32) -> EngineResult<i32> {
        let capacity: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO restraint_units (resource_unit, capacity)
            VALUES ($1, $2)
            ON CONFLICT (resource_unit) DO UPDATE SET resource_unit = EXCLUDED.resource_unit
            RETURNING capacity
            "#,
        )
        .bind(resource_unit)
        .bind(capacity)
        .fetch_one(&self.pool)
        .await?;
        Ok(capacity)
    }

    async fn try_lock_unit(
        &self,
        resource_unit: &str,
        holder: &str,
        lease: Duration,
    ) -> EngineResult<bool> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);

        let taken = sqlx::query(
            r#"
            UPDATE restraint_units
               SET lease_holder = $2,
                   lease_expires_at = NOW() + make_interval(secs => $3::double precision / 1000.0)
             WHERE resource_unit = $1
               AND (lease_holder IS NULL OR lease_holder = $2 OR lease_expires_at <= NOW())
            "#,
        )
        .bind(resource_unit)
        .bind(holder)
        .bind(lease_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if taken == 1 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM restraint_units WHERE resource_unit = $1)",
        )
        .bind(resource_unit)
        .fetch_one(&self.pool)
        .await?;
        if exists {
            Ok(false)
        } else {
            Err(EngineError::ValidationError(format!(
                "Resource unit {resource_unit} not initialized"
            )))
        }
    }

    async fn unlock_unit(&self, resource_unit: &str, holder: &str) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE restraint_units
               SET lease_holder = NULL, lease_expires_at = NULL
             WHERE resource_unit = $1 AND lease_holder = $2
            "#,
        )
        .bind(resource_unit)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn max_order(&self, resource_unit: &str) -> EngineResult<i64> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT last_order FROM restraint_units WHERE resource_unit = $1")
                .bind(resource_unit)
                .fetch_optional(&self.pool)
                .await?;
        Ok(last.unwrap_or(0))
    }

    async fn insert_instance(
        &self,
        instance: RestraintInstance,
        lease_holder: &str,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let last_order = lock_held_unit(&mut tx, &instance.resource_unit, lease_holder).await?;
        if instance.order <= last_order {
            return Err(EngineError::DuplicateOrder {
                resource_unit: instance.resource_unit,
                order: instance.order,
            });
        }

        let result = sqlx::query(
            r#"
            INSERT INTO restraint_instances
                (id, resource_unit, release_entity_type, release_entity_id,
                 permits, order_num, state, acquired_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.resource_unit)
        .bind(instance.release_entity_type.as_str())
        .bind(&instance.release_entity_id)
        .bind(instance.permits)
        .bind(instance.order)
        .bind(instance.state.as_str())
        .bind(instance.acquired_at)
        .bind(instance.created_at)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return if e.constraint() == Some(ORDER_INDEX) {
                    Err(EngineError::DuplicateOrder {
                        resource_unit: instance.resource_unit,
                        order: instance.order,
                    })
                } else {
                    Err(EngineError::ValidationError(format!(
                        "Consumer {} already registered",
                        instance.id
                    )))
                };
            }
            Err(e) => return Err(e.into()),
        }

        sqlx::query("UPDATE restraint_units SET last_order = $2 WHERE resource_unit = $1")
            .bind(&instance.resource_unit)
            .bind(instance.order)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> EngineResult<Option<RestraintInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM restraint_instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn instances_in_states(
        &self,
        resource_unit: &str,
        states: &[ConsumerState],
    ) -> EngineResult<Vec<RestraintInstance>> {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS} FROM restraint_instances
             WHERE resource_unit = $1 AND state = ANY($2)
             ORDER BY order_num ASC
            "#
        ))
        .bind(resource_unit)
        .bind(&states)
        .fetch_all(&self.pool)
        .await?;

        instances_from_rows(&rows)
    }

    async fn live_instances(&self) -> EngineResult<Vec<RestraintInstance>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS} FROM restraint_instances
             WHERE state IN ('ACTIVE', 'BLOCKED')
             ORDER BY resource_unit, order_num
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        instances_from_rows(&rows)
    }

    async fn activate_blocked(
        &self,
        resource_unit: &str,
        id: &str,
        lease_holder: &str,
    ) -> EngineResult<Option<RestraintInstance>> {
        let mut tx = self.pool.begin().await?;
        lock_held_unit(&mut tx, resource_unit, lease_holder).await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE restraint_instances
               SET state = 'ACTIVE', acquired_at = NOW()
             WHERE id = $1 AND resource_unit = $2 AND state = 'BLOCKED'
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(resource_unit)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn finish_instance(&self, id: &str) -> EngineResult<Option<RestraintInstance>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE restraint_instances
               SET state = 'FINISHED'
             WHERE id = $1 AND state IN ('ACTIVE', 'BLOCKED')
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn active_permits_for(
        &self,
        scope: HoldingScope,
        release_entity_id: &str,
        resource_unit: &str,
    ) -> EngineResult<i32> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(permits)::BIGINT FROM restraint_instances
             WHERE state = 'ACTIVE'
               AND release_entity_type = $1
               AND release_entity_id = $2
               AND resource_unit = $3
            "#,
        )
        .bind(scope.as_str())
        .bind(release_entity_id)
        .bind(resource_unit)
        .fetch_one(&self.pool)
        .await?;

        i32::try_from(total.unwrap_or(0))
            .map_err(|e| EngineError::DatabaseError(format!("Permit total overflow: {e}")))
    }

    async fn delete_for_release_entities(
        &self,
        release_entity_ids: &[String],
        scope: HoldingScope,
    ) -> EngineResult<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM restraint_instances
             WHERE release_entity_type = $1 AND release_entity_id = ANY($2)
            "#,
        )
        .bind(scope.as_str())
        .bind(release_entity_ids)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const HOLDER: &str = "w1";

    async fn leased_store(pool: PgPool, capacity: i32) -> PgRestraintStore {
        let store = PgRestraintStore::new(pool);
        store.ensure_unit("repo-x", capacity).await.unwrap();
        assert!(store
            .try_lock_unit("repo-x", HOLDER, Duration::from_secs(30))
            .await
            .unwrap());
        store
    }

    fn instance(id: &str, order: i64, state: ConsumerState) -> RestraintInstance {
        RestraintInstance {
            id: id.to_string(),
            resource_unit: "repo-x".to_string(),
            release_entity_type: HoldingScope::Plan,
            release_entity_id: "plan-1".to_string(),
            permits: 1,
            order,
            state,
            acquired_at: None,
            created_at: Utc::now(),
        }
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    #[ignore = "requires PostgreSQL"]
    async fn test_duplicate_order_maps_to_domain_error(pool: PgPool) {
        let store = leased_store(pool, 2).await;
        // capacity is fixed on first creation
        assert_eq!(store.ensure_unit("repo-x", 5).await.unwrap(), 2);

        store
            .insert_instance(instance("a", 1, ConsumerState::Active), HOLDER)
            .await
            .unwrap();
        let err = store
            .insert_instance(instance("b", 1, ConsumerState::Blocked), HOLDER)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateOrder { order: 1, .. }));
        assert_eq!(store.max_order("repo-x").await.unwrap(), 1);

        // deleting the holder does not free its order
        store
            .delete_for_release_entities(&["plan-1".to_string()], HoldingScope::Plan)
            .await
            .unwrap();
        assert_eq!(store.max_order("repo-x").await.unwrap(), 1);
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    #[ignore = "requires PostgreSQL"]
    async fn test_writes_fenced_by_lease(pool: PgPool) {
        let store = PgRestraintStore::new(pool);
        store.ensure_unit("repo-x", 1).await.unwrap();
        assert!(store
            .try_lock_unit("repo-x", "stalled", Duration::from_millis(1))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store
            .try_lock_unit("repo-x", HOLDER, Duration::from_secs(30))
            .await
            .unwrap());

        let err = store
            .insert_instance(instance("a", 1, ConsumerState::Active), "stalled")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LeaseLost { .. }));
        assert!(store.get_instance("a").await.unwrap().is_none());

        store
            .insert_instance(instance("a", 1, ConsumerState::Blocked), HOLDER)
            .await
            .unwrap();
        let err = store
            .activate_blocked("repo-x", "a", "stalled")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LeaseLost { .. }));
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    #[ignore = "requires PostgreSQL"]
    async fn test_lease_excludes_other_holders(pool: PgPool) {
        let store = PgRestraintStore::new(pool);
        store.ensure_unit("repo-x", 1).await.unwrap();

        let lease = Duration::from_secs(30);
        assert!(store.try_lock_unit("repo-x", "w1", lease).await.unwrap());
        assert!(!store.try_lock_unit("repo-x", "w2", lease).await.unwrap());
        store.unlock_unit("repo-x", "w1").await.unwrap();
        assert!(store.try_lock_unit("repo-x", "w2", lease).await.unwrap());
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    #[ignore = "requires PostgreSQL"]
    async fn test_conditional_state_changes(pool: PgPool) {
        let store = leased_store(pool, 1).await;
        store
            .insert_instance(instance("a", 1, ConsumerState::Active), HOLDER)
            .await
            .unwrap();
        store
            .insert_instance(instance("b", 2, ConsumerState::Blocked), HOLDER)
            .await
            .unwrap();

        assert!(store
            .activate_blocked("repo-x", "a", HOLDER)
            .await
            .unwrap()
            .is_none());
        assert!(store.finish_instance("a").await.unwrap().is_some());
        assert!(store.finish_instance("a").await.unwrap().is_none());

        let promoted = store
            .activate_blocked("repo-x", "b", HOLDER)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(promoted.state, ConsumerState::Active);
        assert!(promoted.acquired_at.is_some());
        assert_eq!(
            store
                .active_permits_for(HoldingScope::Plan, "plan-1", "repo-x")
                .await
                .unwrap(),
            1
        );

        let deleted = store
            .delete_for_release_entities(&["plan-1".to_string()], HoldingScope::Plan)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
    }
}
