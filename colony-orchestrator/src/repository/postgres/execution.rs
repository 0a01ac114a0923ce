//! Job and task execution queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::domain::{JobExecution, RequestState, StateChange, TaskExecution};
use colony_core::{Error, Result};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{PgStore, expect_row, from_json, parse_state, storage, to_json};
use crate::repository::JobExecutionRepository;

impl PgStore {
    /// Paired job-level write shared by `update_state` and `finalize`
    async fn update_job(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
        finished: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let terminal = RequestState::terminal_labels();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let requests = sqlx::query(
            r#"
            UPDATE job_requests
            SET job_state = $1,
                error_code = COALESCE($2, error_code),
                error_message = COALESCE($3, error_message),
                current_task = COALESCE($4, current_task),
                retried = COALESCE($5, retried),
                scheduled_at = COALESCE($6, scheduled_at),
                updated_at = $7
            WHERE job_execution_id = $8 AND job_state = $9 AND job_state <> ALL($10)
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
        .bind(&terminal)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        expect_row(requests.rows_affected(), || {
            format!("job request of execution {} is not in state {}", id, old)
        })?;

        let executions = sqlx::query(
            r#"
            UPDATE job_executions
            SET job_state = $1,
                error_code = COALESCE($2, error_code),
                error_message = COALESCE($3, error_message),
                cost_secs = COALESCE($4, cost_secs),
                ended_at = COALESCE($5, ended_at),
                updated_at = $6
            WHERE id = $7 AND job_state = $8 AND job_state <> ALL($9)
            "#,
        )
        .bind(new.as_str())
        .bind(&change.error_code)
        .bind(&change.error_message)
        .bind(if finished { change.cost_secs } else { None })
        .bind(finished.then_some(now))
        .bind(now)
        .bind(id)
        .bind(old.as_str())
        .bind(&terminal)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        expect_row(executions.rows_affected(), || {
            format!("job execution {} is not in state {}", id, old)
        })?;

        tx.commit().await.map_err(storage)
    }

    /// Task-level write shared by `update_task_state` and `finalize_task`
    async fn update_task(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
        finished: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET task_state = $1,
                exit_code = COALESCE($2, exit_code),
                error_code = COALESCE($3, error_code),
                error_message = COALESCE($4, error_message),
                ended_at = CASE WHEN $5 THEN $6 ELSE ended_at END,
                cost_secs = CASE
                    WHEN $5 THEN COALESCE($7, EXTRACT(EPOCH FROM ($6 - started_at))::DOUBLE PRECISION)
                    ELSE cost_secs
                END,
                updated_at = $6
            WHERE id = $8 AND task_state = $9 AND task_state <> ALL($10)
            "#,
        )
        .bind(new.as_str())
        .bind(&change.exit_code)
        .bind(&change.error_code)
        .bind(&change.error_message)
        .bind(finished)
        .bind(now)
        .bind(change.cost_secs)
        .bind(id)
        .bind(old.as_str())
        .bind(RequestState::terminal_labels())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        expect_row(result.rows_affected(), || {
            format!("task execution {} is not in state {}", id, old)
        })
    }
}

async fn insert_task(conn: &mut PgConnection, task: &TaskExecution) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO task_executions (id, job_execution_id, task_type, task_state, exit_code,
                                     error_code, error_message, retried, cost_secs,
                                     inherited_cost_secs, started_at, ended_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(task.id)
    .bind(task.job_execution_id)
    .bind(&task.task_type)
    .bind(task.task_state.as_str())
    .bind(&task.exit_code)
    .bind(&task.error_code)
    .bind(&task.error_message)
    .bind(task.retried)
    .bind(task.cost_secs)
    .bind(task.inherited_cost_secs)
    .bind(task.started_at)
    .bind(task.ended_at)
    .bind(task.updated_at)
    .execute(conn)
    .await
    .map_err(storage)?;

    expect_row(result.rows_affected(), || {
        format!("task execution {} already exists", task.id)
    })
}

#[async_trait]
impl JobExecutionRepository for PgStore {
    async fn save(&self, execution: &JobExecution) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let result = sqlx::query(
            r#"
            INSERT INTO job_executions (id, job_request_id, job_state, contexts, cost_secs,
                                        error_code, error_message, started_at, ended_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(execution.id)
        .bind(execution.job_request_id)
        .bind(execution.job_state.as_str())
        .bind(to_json(&execution.contexts)?)
        .bind(execution.cost_secs)
        .bind(&execution.error_code)
        .bind(&execution.error_message)
        .bind(execution.started_at)
        .bind(execution.ended_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        expect_row(result.rows_affected(), || {
            format!("job execution {} already exists", execution.id)
        })?;

        for task in &execution.tasks {
            insert_task(&mut *tx, task).await?;
        }

        tx.commit().await.map_err(storage)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobExecution>> {
        let Some(row) = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, job_request_id, job_state, contexts, cost_secs,
                   error_code, error_message, started_at, ended_at, updated_at
            FROM job_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        else {
            return Ok(None);
        };

        let tasks = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, job_execution_id, task_type, task_state, exit_code, error_code,
                   error_message, retried, cost_secs, inherited_cost_secs,
                   started_at, ended_at, updated_at
            FROM task_executions
            WHERE job_execution_id = $1
            ORDER BY started_at ASC, retried ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?
        .into_iter()
        .map(TaskExecution::try_from)
        .collect::<Result<Vec<_>>>()?;

        let mut execution = JobExecution::try_from(row)?;
        execution.tasks = tasks;
        Ok(Some(execution))
    }

    async fn update_state(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        self.update_job(id, old, new, change, false).await
    }

    async fn finalize(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        self.update_job(id, old, new, change, true).await
    }

    async fn save_task(&self, task: &TaskExecution) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Locks the execution row so concurrent attempts of one task serialise
        let execution_state: Option<String> =
            sqlx::query_scalar("SELECT job_state FROM job_executions WHERE id = $1 FOR UPDATE")
                .bind(task.job_execution_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage)?;
        let live = match execution_state {
            Some(label) => !parse_state(&label)?.is_terminal(),
            None => false,
        };
        if !live {
            return Err(Error::Conflict(format!(
                "job execution {} not found or already finished",
                task.job_execution_id
            )));
        }

        let previous: Option<String> = sqlx::query_scalar(
            r#"
            SELECT task_state FROM task_executions
            WHERE job_execution_id = $1 AND task_type = $2
            ORDER BY started_at DESC, retried DESC
            LIMIT 1
            "#,
        )
        .bind(task.job_execution_id)
        .bind(&task.task_type)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;
        if let Some(label) = previous {
            let state = parse_state(&label)?;
            if !state.is_terminal() {
                return Err(Error::Conflict(format!(
                    "task {} of execution {} is still {}",
                    task.task_type, task.job_execution_id, state
                )));
            }
        }

        insert_task(&mut *tx, task).await?;
        tx.commit().await.map_err(storage)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskExecution>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, job_execution_id, task_type, task_state, exit_code, error_code,
                   error_message, retried, cost_secs, inherited_cost_secs,
                   started_at, ended_at, updated_at
            FROM task_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(TaskExecution::try_from).transpose()
    }

    async fn update_task_state(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        self.update_task(id, old, new, change, false).await
    }

    async fn finalize_task(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        self.update_task(id, old, new, change, true).await
    }
}

// ===== Row mapping =====

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    job_request_id: Uuid,
    job_state: String,
    contexts: serde_json::Value,
    cost_secs: f64,
    error_code: Option<String>,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for JobExecution {
    type Error = Error;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        Ok(JobExecution {
            id: row.id,
            job_request_id: row.job_request_id,
            job_state: parse_state(&row.job_state)?,
            tasks: Vec::new(),
            contexts: from_json(row.contexts)?,
            cost_secs: row.cost_secs,
            error_code: row.error_code,
            error_message: row.error_message,
            started_at: row.started_at,
            ended_at: row.ended_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    job_execution_id: Uuid,
    task_type: String,
    task_state: String,
    exit_code: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    retried: i32,
    cost_secs: f64,
    inherited_cost_secs: f64,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for TaskExecution {
    type Error = Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(TaskExecution {
            id: row.id,
            job_execution_id: row.job_execution_id,
            task_type: row.task_type,
            task_state: parse_state(&row.task_state)?,
            exit_code: row.exit_code,
            error_code: row.error_code,
            error_message: row.error_message,
            retried: row.retried,
            cost_secs: row.cost_secs,
            inherited_cost_secs: row.inherited_cost_secs,
            started_at: row.started_at,
            ended_at: row.ended_at,
            updated_at: row.updated_at,
        })
    }
}
