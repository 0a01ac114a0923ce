//! Job definition queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::domain::JobDefinition;
use colony_core::{Error, Result};
use uuid::Uuid;

use super::{PgStore, expect_row, from_json, storage, to_json};
use crate::repository::JobDefinitionRepository;

#[async_trait]
impl JobDefinitionRepository for PgStore {
    async fn save(&self, mut definition: JobDefinition) -> Result<JobDefinition> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let current: Option<i32> =
            sqlx::query_scalar("SELECT MAX(version) FROM job_definitions WHERE job_type = $1")
                .bind(&definition.job_type)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage)?;

        sqlx::query(
            r#"
            UPDATE job_definitions
            SET active = FALSE, updated_at = $2
            WHERE job_type = $1 AND active
            "#,
        )
        .bind(&definition.job_type)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        definition.version = current.unwrap_or(0) + 1;
        definition.active = true;
        definition.updated_at = now;

        sqlx::query(
            r#"
            INSERT INTO job_definitions (id, job_type, version, platform, description,
                                         disabled, active, tasks, variables, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(definition.id)
        .bind(&definition.job_type)
        .bind(definition.version)
        .bind(&definition.platform)
        .bind(&definition.description)
        .bind(definition.disabled)
        .bind(definition.active)
        .bind(to_json(&definition.tasks)?)
        .bind(to_json(&definition.variables)?)
        .bind(definition.created_at)
        .bind(definition.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(definition)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<JobDefinition>> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            r#"
            SELECT id, job_type, version, platform, description, disabled, active,
                   tasks, variables, created_at, updated_at
            FROM job_definitions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(JobDefinition::try_from).transpose()
    }

    async fn find_latest(&self, job_type: &str) -> Result<Option<JobDefinition>> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            r#"
            SELECT id, job_type, version, platform, description, disabled, active,
                   tasks, variables, created_at, updated_at
            FROM job_definitions
            WHERE job_type = $1 AND active
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(JobDefinition::try_from).transpose()
    }

    async fn set_disabled(&self, job_type: &str, disabled: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_definitions
            SET disabled = $2, updated_at = $3
            WHERE job_type = $1 AND active
            "#,
        )
        .bind(job_type)
        .bind(disabled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        expect_row(result.rows_affected(), || {
            format!("job definition {} not found", job_type)
        })
    }
}

// ===== Row mapping =====

#[derive(sqlx::FromRow)]
struct DefinitionRow {
    id: Uuid,
    job_type: String,
    version: i32,
    platform: String,
    description: Option<String>,
    disabled: bool,
    active: bool,
    tasks: serde_json::Value,
    variables: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DefinitionRow> for JobDefinition {
    type Error = Error;

    fn try_from(row: DefinitionRow) -> Result<Self> {
        Ok(JobDefinition {
            id: row.id,
            job_type: row.job_type,
            version: row.version,
            platform: row.platform,
            description: row.description,
            disabled: row.disabled,
            active: row.active,
            tasks: from_json(row.tasks)?,
            variables: from_json(row.variables)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
