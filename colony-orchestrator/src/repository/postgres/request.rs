//! Job request queries

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::domain::state::shift;
use colony_core::domain::{JobRequest, RequestState, StateChange};
use colony_core::{Error, Result};
use uuid::Uuid;

use super::{PgStore, expect_row, from_json, parse_state, storage, to_json};
use crate::repository::JobRequestRepository;

#[async_trait]
impl JobRequestRepository for PgStore {
    async fn save(&self, request: &JobRequest) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_requests (id, job_definition_id, job_type, job_version, job_state,
                                      job_priority, schedule_attempts, retried, job_execution_id,
                                      last_job_execution_id, current_task, error_code, error_message,
                                      parameters, scheduled_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(request.id)
        .bind(request.job_definition_id)
        .bind(&request.job_type)
        .bind(request.job_version)
        .bind(request.job_state.as_str())
        .bind(request.job_priority)
        .bind(request.schedule_attempts)
        .bind(request.retried)
        .bind(request.job_execution_id)
        .bind(request.last_job_execution_id)
        .bind(&request.current_task)
        .bind(&request.error_code)
        .bind(&request.error_message)
        .bind(to_json(&request.parameters)?)
        .bind(request.scheduled_at)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        expect_row(result.rows_affected(), || {
            format!("job request {} already exists", request.id)
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRequest>> {
        let row = sqlx::query_as::<_, RequestRow>(
            r#"
            SELECT id, job_definition_id, job_type, job_version, job_state, job_priority,
                   schedule_attempts, retried, job_execution_id, last_job_execution_id,
                   current_task, error_code, error_message, parameters,
                   scheduled_at, created_at, updated_at
            FROM job_requests
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(JobRequest::try_from).transpose()
    }

    async fn update_state(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE job_requests
            SET job_state = $1,
                error_code = COALESCE($2, error_code),
                error_message = COALESCE($3, error_message),
                current_task = COALESCE($4, current_task),
                retried = COALESCE($5, retried),
                scheduled_at = COALESCE($6, scheduled_at),
                updated_at = $7
            WHERE id = $8 AND job_state = $9 AND job_state <> ALL($10)
            "#,
        )
        .bind(new.as_str())
        .bind(&change.error_code)
        .bind(&change.error_message)
        .bind(&change.current_task)
        .bind(change.retried)
        .bind(change.rescheduled_at(new, now))
        .bind(now)
        .bind(id)
        .bind(old.as_str())
        .bind(RequestState::terminal_labels())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        expect_row(result.rows_affected(), || {
            format!("job request {} is not in state {}", id, old)
        })
    }

    async fn set_ready_to_execute(&self, id: Uuid, job_execution_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let owner: Option<Uuid> =
            sqlx::query_scalar("SELECT job_request_id FROM job_executions WHERE id = $1")
                .bind(job_execution_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage)?;
        if owner != Some(id) {
            return Err(Error::Conflict(format!(
                "job execution {} of request {} not found",
                job_execution_id, id
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE job_requests
            SET job_state = $1,
                last_job_execution_id = COALESCE(job_execution_id, $2),
                job_execution_id = $2,
                updated_at = $3
            WHERE id = $4 AND job_state = ANY($5)
            "#,
        )
        .bind(RequestState::Ready.as_str())
        .bind(job_execution_id)
        .bind(Utc::now())
        .bind(id)
        .bind(vec![
            RequestState::Pending.as_str().to_string(),
            RequestState::Paused.as_str().to_string(),
        ])
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        expect_row(result.rows_affected(), || {
            format!("job request {} is not pending or paused", id)
        })?;
        tx.commit().await.map_err(storage)
    }

    async fn increment_schedule_attempts(
        &self,
        id: Uuid,
        delay: Duration,
        priority_decrement: i32,
        message: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE job_requests
            SET schedule_attempts = schedule_attempts + 1,
                scheduled_at = $1,
                job_priority = LEAST(GREATEST(job_priority::BIGINT - $2, -2147483648), 2147483647)::INTEGER,
                error_message = $3,
                updated_at = $4
            WHERE id = $5 AND job_state <> ALL($6)
            "#,
        )
        .bind(shift(now, delay))
        .bind(i64::from(priority_decrement))
        .bind(message)
        .bind(now)
        .bind(id)
        .bind(RequestState::terminal_labels())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        expect_row(result.rows_affected(), || {
            format!("job request {} is not schedulable", id)
        })
    }

    async fn requeue_orphans(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE job_requests
            SET job_state = $1, scheduled_at = $2, updated_at = $2
            WHERE job_state = ANY($3) AND updated_at < $4
            "#,
        )
        .bind(RequestState::Pending.as_str())
        .bind(Utc::now())
        .bind(RequestState::orphan_labels())
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected())
    }

    async fn next_schedulable(
        &self,
        job_types: &[String],
        state: RequestState,
        limit: usize,
    ) -> Result<Vec<JobRequest>> {
        let rows = sqlx::query_as::<_, RequestRow>(
            r#"
            SELECT id, job_definition_id, job_type, job_version, job_state, job_priority,
                   schedule_attempts, retried, job_execution_id, last_job_execution_id,
                   current_task, error_code, error_message, parameters,
                   scheduled_at, created_at, updated_at
            FROM job_requests
            WHERE job_state = $1
              AND scheduled_at <= $2
              AND job_type IN (SELECT job_type FROM job_definitions WHERE active AND NOT disabled)
              AND (cardinality($3::TEXT[]) = 0 OR job_type = ANY($3))
            ORDER BY job_priority DESC, created_at ASC
            LIMIT $4
            "#,
        )
        .bind(state.as_str())
        .bind(Utc::now())
        .bind(job_types.to_vec())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter().map(JobRequest::try_from).collect()
    }
}

// ===== Row mapping =====

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    job_definition_id: Uuid,
    job_type: String,
    job_version: i32,
    job_state: String,
    job_priority: i32,
    schedule_attempts: i32,
    retried: i32,
    job_execution_id: Option<Uuid>,
    last_job_execution_id: Option<Uuid>,
    current_task: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    parameters: serde_json::Value,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RequestRow> for JobRequest {
    type Error = Error;

    fn try_from(row: RequestRow) -> Result<Self> {
        Ok(JobRequest {
            id: row.id,
            job_definition_id: row.job_definition_id,
            job_type: row.job_type,
            job_version: row.job_version,
            job_state: parse_state(&row.job_state)?,
            job_priority: row.job_priority,
            schedule_attempts: row.schedule_attempts,
            retried: row.retried,
            job_execution_id: row.job_execution_id,
            last_job_execution_id: row.last_job_execution_id,
            current_task: row.current_task,
            error_code: row.error_code,
            error_message: row.error_message,
            parameters: from_json(row.parameters)?,
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
