//! PostgreSQL [`ExecutionStore`].
//!
//! Status is stored as its `SMALLINT` tag and compare-and-set is a single
//! conditional `UPDATE`, so the row count decides the race.

use crate::error::{EngineError, EngineResult};
use crate::execution::store::ExecutionStore;
use crate::execution::types::{
    Ambiance, ChainDetails, ExecutionContinuation, ExecutionNode, StepResponse,
};
use crate::state_machine::ExecutionStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_from_row(row: &PgRow) -> EngineResult<ExecutionStatus> {
    let tag: i16 = row.try_get("status")?;
    ExecutionStatus::from_tag(tag)
        .ok_or_else(|| EngineError::SerializationError(format!("Unknown status tag {tag}")))
}

fn node_from_row(row: &PgRow) -> EngineResult<ExecutionNode> {
    let mode: String = row.try_get("mode")?;
    let ambiance: Json<Ambiance> = row.try_get("ambiance")?;
    let response: Option<Json<StepResponse>> = row.try_get("response")?;

    Ok(ExecutionNode {
        execution_id: row.try_get("execution_id")?,
        step_type: row.try_get("step_type")?,
        step_parameters: row.try_get::<Value, _>("step_parameters")?,
        inputs: row.try_get::<Value, _>("inputs")?,
        mode: mode.parse()?,
        status: status_from_row(row)?,
        ambiance: ambiance.0,
        response: response.map(|r| r.0),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn continuation_from_row(row: &PgRow) -> EngineResult<ExecutionContinuation> {
    let mode: String = row.try_get("mode")?;
    let callback_ids: Json<Vec<String>> = row.try_get("callback_ids")?;
    let chain_details: Option<Json<ChainDetails>> = row.try_get("chain_details")?;
    let timeout_ms: i64 = row.try_get("timeout_ms")?;

    Ok(ExecutionContinuation {
        execution_id: row.try_get("execution_id")?,
        mode: mode.parse()?,
        callback_ids: callback_ids.0,
        chain_details: chain_details.map(|c| c.0),
        timeout_ms: u64::try_from(timeout_ms).unwrap_or_default(),
        registered_at: row.try_get("registered_at")?,
    })
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn insert_node(&self, node: ExecutionNode) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO execution_nodes
                (execution_id, plan_execution_id, step_type, mode, status,
                 step_parameters, inputs, ambiance, response, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&node.execution_id)
        .bind(&node.ambiance.plan_execution_id)
        .bind(&node.step_type)
        .bind(node.mode.to_string())
        .bind(node.status.tag())
        .bind(&node.step_parameters)
        .bind(&node.inputs)
        .bind(Json(&node.ambiance))
        .bind(node.response.as_ref().map(Json))
        .bind(node.created_at)
        .bind(node.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                EngineError::ValidationError(format!("Execution {} already exists", node.execution_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_node(&self, execution_id: &str) -> EngineResult<Option<ExecutionNode>> {
        let row = sqlx::query("SELECT * FROM execution_nodes WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(node_from_row).transpose()
    }

    async fn compare_and_set_status(
        &self,
        execution_id: &str,
        expected: ExecutionStatus,
        new: ExecutionStatus,
    ) -> EngineResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE execution_nodes
               SET status = $3, updated_at = NOW()
             WHERE execution_id = $1 AND status = $2
            "#,
        )
        .bind(execution_id)
        .bind(expected.tag())
        .bind(new.tag())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(true);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM execution_nodes WHERE execution_id = $1)")
                .bind(execution_id)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(false)
        } else {
            Err(EngineError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })
        }
    }

    async fn record_response(&self, execution_id: &str, response: &StepResponse) -> EngineResult<()> {
        let updated = sqlx::query(
            "UPDATE execution_nodes SET response = $2, updated_at = NOW() WHERE execution_id = $1",
        )
        .bind(execution_id)
        .bind(Json(response))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(EngineError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            });
        }
        Ok(())
    }

    async fn save_continuation(&self, continuation: ExecutionContinuation) -> EngineResult<()> {
        let timeout_ms = i64::try_from(continuation.timeout_ms).unwrap_or(i64::MAX);

        sqlx::query(
            r#"
            INSERT INTO execution_continuations
                (execution_id, mode, callback_ids, chain_details, timeout_ms, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (execution_id) DO UPDATE
               SET mode = EXCLUDED.mode,
                   callback_ids = EXCLUDED.callback_ids,
                   chain_details = EXCLUDED.chain_details,
                   timeout_ms = EXCLUDED.timeout_ms,
                   registered_at = EXCLUDED.registered_at
            "#,
        )
        .bind(&continuation.execution_id)
        .bind(continuation.mode.to_string())
        .bind(Json(&continuation.callback_ids))
        .bind(continuation.chain_details.as_ref().map(Json))
        .bind(timeout_ms)
        .bind(continuation.registered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_continuation(
        &self,
        execution_id: &str,
    ) -> EngineResult<Option<ExecutionContinuation>> {
        let row = sqlx::query("SELECT * FROM execution_continuations WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(continuation_from_row).transpose()
    }
}
