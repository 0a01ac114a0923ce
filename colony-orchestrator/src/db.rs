use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::config::Config;

pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create job definitions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_definitions (
            id UUID PRIMARY KEY,
            job_type VARCHAR(255) NOT NULL,
            version INTEGER NOT NULL,
            platform VARCHAR(255) NOT NULL,
            description TEXT,
            disabled BOOLEAN NOT NULL DEFAULT FALSE,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            tasks JSONB NOT NULL DEFAULT '[]',
            variables JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            UNIQUE (job_type, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create job requests table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_requests (
            id UUID PRIMARY KEY,
            job_definition_id UUID NOT NULL REFERENCES job_definitions(id),
            job_type VARCHAR(255) NOT NULL,
            job_version INTEGER NOT NULL,
            job_state VARCHAR(50) NOT NULL,
            job_priority INTEGER NOT NULL DEFAULT 5,
            schedule_attempts INTEGER NOT NULL DEFAULT 0,
            retried INTEGER NOT NULL DEFAULT 0,
            job_execution_id UUID,
            last_job_execution_id UUID,
            current_task VARCHAR(255),
            error_code VARCHAR(255),
            error_message TEXT,
            parameters JSONB NOT NULL DEFAULT '{}',
            scheduled_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create job executions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_executions (
            id UUID PRIMARY KEY,
            job_request_id UUID NOT NULL REFERENCES job_requests(id) ON DELETE CASCADE,
            job_state VARCHAR(50) NOT NULL,
            contexts JSONB NOT NULL DEFAULT '{}',
            cost_secs DOUBLE PRECISION NOT NULL DEFAULT 0,
            error_code VARCHAR(255),
            error_message TEXT,
            started_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create task executions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_executions (
            id UUID PRIMARY KEY,
            job_execution_id UUID NOT NULL REFERENCES job_executions(id) ON DELETE CASCADE,
            task_type VARCHAR(255) NOT NULL,
            task_state VARCHAR(50) NOT NULL,
            exit_code VARCHAR(255),
            error_code VARCHAR(255),
            error_message TEXT,
            retried INTEGER NOT NULL DEFAULT 0,
            cost_secs DOUBLE PRECISION NOT NULL DEFAULT 0,
            inherited_cost_secs DOUBLE PRECISION NOT NULL DEFAULT 0,
            started_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create job resources table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_resources (
            id UUID PRIMARY KEY,
            resource_type VARCHAR(255) NOT NULL,
            platform VARCHAR(255) NOT NULL,
            description TEXT,
            quota INTEGER NOT NULL CHECK (quota > 0),
            tags TEXT[] NOT NULL DEFAULT '{}',
            lease_timeout_secs BIGINT NOT NULL,
            paused BOOLEAN NOT NULL DEFAULT FALSE,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create resource usage ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_resource_uses (
            id UUID PRIMARY KEY,
            job_resource_id UUID NOT NULL REFERENCES job_resources(id) ON DELETE CASCADE,
            job_request_id UUID NOT NULL,
            task_execution_id UUID NOT NULL,
            amount INTEGER NOT NULL CHECK (amount > 0),
            active BOOLEAN NOT NULL DEFAULT TRUE,
            expires_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_definitions_type ON job_definitions(job_type, active)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_requests_schedulable ON job_requests(job_state, scheduled_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_requests_execution_id ON job_requests(job_execution_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_requests_updated_at ON job_requests(updated_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_executions_job ON task_executions(job_execution_id, task_type)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_resources_match ON job_resources(resource_type, platform)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_resource_uses_active ON job_resource_uses(job_resource_id) WHERE active",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed");

    Ok(())
}
