//! Job resource and usage ledger queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::domain::{JobResource, JobResourceUse};
use colony_core::{Error, Result};
use uuid::Uuid;

use super::{PgStore, expect_row, storage};
use crate::repository::JobResourceRepository;

#[async_trait]
impl JobResourceRepository for PgStore {
    async fn save(&self, resource: &JobResource) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_resources (id, resource_type, platform, description, quota, tags,
                                       lease_timeout_secs, paused, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(resource.id)
        .bind(&resource.resource_type)
        .bind(&resource.platform)
        .bind(&resource.description)
        .bind(resource.quota)
        .bind(&resource.tags)
        .bind(resource.lease_timeout_secs)
        .bind(resource.paused)
        .bind(resource.active)
        .bind(resource.created_at)
        .bind(resource.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        expect_row(result.rows_affected(), || {
            format!("job resource {} already exists", resource.id)
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobResource>> {
        let row = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT id, resource_type, platform, description, quota, tags,
                   lease_timeout_secs, paused, active, created_at, updated_at
            FROM job_resources
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        Ok(row.map(Into::into))
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_resources
            SET paused = $2, updated_at = $3
            WHERE id = $1 AND active
            "#,
        )
        .bind(id)
        .bind(paused)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        expect_row(result.rows_affected(), || {
            format!("job resource {} not found", id)
        })
    }

    async fn retire(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_resources
            SET active = FALSE, updated_at = $2
            WHERE id = $1 AND active
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        expect_row(result.rows_affected(), || {
            format!("job resource {} not found", id)
        })
    }

    async fn allocate(&self, lease: &JobResourceUse) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Row lock serialises allocations against the same resource
        let quota: Option<i32> = sqlx::query_scalar(
            "SELECT quota FROM job_resources WHERE id = $1 AND active FOR UPDATE",
        )
        .bind(lease.job_resource_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;
        let quota = quota.ok_or_else(|| {
            Error::Conflict(format!("job resource {} not found", lease.job_resource_id))
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_resource_uses (id, job_resource_id, job_request_id, task_execution_id,
                                           amount, active, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(lease.id)
        .bind(lease.job_resource_id)
        .bind(lease.job_request_id)
        .bind(lease.task_execution_id)
        .bind(lease.amount)
        .bind(lease.expires_at)
        .bind(lease.created_at)
        .bind(lease.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        expect_row(inserted.rows_affected(), || {
            format!("job resource use {} already exists", lease.id)
        })?;

        let used: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM job_resource_uses
            WHERE job_resource_id = $1 AND active
            "#,
        )
        .bind(lease.job_resource_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        if used > i64::from(quota) {
            return Err(Error::QuotaExceeded {
                resource_id: lease.job_resource_id,
                requested: lease.amount,
                used: used - i64::from(lease.amount),
                quota,
            });
        }

        tx.commit().await.map_err(storage)?;
        Ok(i64::from(quota) - used)
    }

    async fn deallocate(&self, use_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_resource_uses
            SET active = FALSE, updated_at = $2
            WHERE id = $1 AND active
            "#,
        )
        .bind(use_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        expect_row(result.rows_affected(), || {
            format!("active job resource use {} not found", use_id)
        })
    }

    async fn used_quota(&self, resource_id: Uuid) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM job_resource_uses
            WHERE job_resource_id = $1 AND active
            "#,
        )
        .bind(resource_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)
    }

    async fn match_by_tags(
        &self,
        resource_type: &str,
        platform: &str,
        tags: &[String],
        amount: i32,
    ) -> Result<Vec<JobResource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT r.id, r.resource_type, r.platform, r.description, r.quota, r.tags,
                   r.lease_timeout_secs, r.paused, r.active, r.created_at, r.updated_at
            FROM job_resources r
            WHERE r.active
              AND NOT r.paused
              AND r.resource_type = $1
              AND r.platform = $2
              AND r.quota - COALESCE((
                    SELECT SUM(u.amount)
                    FROM job_resource_uses u
                    WHERE u.job_resource_id = r.id AND u.active
                  ), 0) >= $3
            ORDER BY r.created_at ASC
            "#,
        )
        .bind(resource_type)
        .bind(platform)
        .bind(amount)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        // Tags compare case-insensitively, which the array operators cannot express
        Ok(rows
            .into_iter()
            .map(JobResource::from)
            .filter(|resource| resource.matches_tags(tags))
            .collect())
    }

    async fn resource_uses(&self, resource_id: Uuid) -> Result<Vec<JobResourceUse>> {
        let rows = sqlx::query_as::<_, ResourceUseRow>(
            r#"
            SELECT id, job_resource_id, job_request_id, task_execution_id, amount, active,
                   expires_at, created_at, updated_at
            FROM job_resource_uses
            WHERE job_resource_id = $1 AND active
            ORDER BY created_at ASC
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE job_resource_uses
            SET active = FALSE, updated_at = $1
            WHERE active AND expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected())
    }
}

// ===== Row mapping =====

#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: Uuid,
    resource_type: String,
    platform: String,
    description: Option<String>,
    quota: i32,
    tags: Vec<String>,
    lease_timeout_secs: i64,
    paused: bool,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ResourceRow> for JobResource {
    fn from(row: ResourceRow) -> Self {
        JobResource {
            id: row.id,
            resource_type: row.resource_type,
            platform: row.platform,
            description: row.description,
            quota: row.quota,
            tags: row.tags,
            lease_timeout_secs: row.lease_timeout_secs,
            paused: row.paused,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ResourceUseRow {
    id: Uuid,
    job_resource_id: Uuid,
    job_request_id: Uuid,
    task_execution_id: Uuid,
    amount: i32,
    active: bool,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ResourceUseRow> for JobResourceUse {
    fn from(row: ResourceUseRow) -> Self {
        JobResourceUse {
            id: row.id,
            job_resource_id: row.job_resource_id,
            job_request_id: row.job_request_id,
            task_execution_id: row.task_execution_id,
            amount: row.amount,
            active: row.active,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
