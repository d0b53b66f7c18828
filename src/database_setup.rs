use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

/// Idempotent schema bootstrap for a fresh database: enum types, tables,
/// and the indexes the claim and analysis queries lean on.
pub struct DatabaseSetup {
    pool: PgPool,
}

const ENUM_TYPES: &[(&str, &str)] = &[
    ("http_method", "'GET','POST','PUT','PATCH','DELETE'"),
    ("run_status", "'running','success','failed','canceled'"),
    ("job_status", "'active','paused','archived'"),
    (
        "schedule_source",
        "'paused','ai-oneshot','ai-interval','baseline-cron','baseline-interval','clamped-min','clamped-max'",
    ),
];

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        tier TEXT NOT NULL DEFAULT 'free',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT,
        status job_status NOT NULL DEFAULT 'active',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS endpoints (
        id UUID PRIMARY KEY,
        job_id UUID REFERENCES jobs(id) ON DELETE CASCADE,
        tenant_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT,
        url TEXT NOT NULL,
        method http_method NOT NULL DEFAULT 'GET',
        headers TEXT,
        body_json JSONB,
        timeout_ms BIGINT,
        max_execution_time_ms BIGINT,
        max_response_size_kb BIGINT,
        baseline_cron TEXT,
        baseline_interval_ms BIGINT,
        min_interval_ms BIGINT,
        max_interval_ms BIGINT,
        ai_hint_interval_ms BIGINT,
        ai_hint_next_run_at TIMESTAMPTZ,
        ai_hint_expires_at TIMESTAMPTZ,
        ai_hint_reason TEXT,
        paused_until TIMESTAMPTZ,
        last_run_at TIMESTAMPTZ,
        next_run_at TIMESTAMPTZ NOT NULL,
        failure_count INTEGER NOT NULL DEFAULT 0,
        locked_until TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT endpoints_one_baseline
            CHECK ((baseline_cron IS NULL) <> (baseline_interval_ms IS NULL)),
        CONSTRAINT endpoints_failure_count_non_negative
            CHECK (failure_count >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id UUID PRIMARY KEY,
        endpoint_id UUID NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
        attempt INTEGER NOT NULL,
        source schedule_source,
        status run_status NOT NULL DEFAULT 'running',
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ,
        duration_ms BIGINT,
        status_code INTEGER,
        response_body JSONB,
        error_message TEXT,
        error_details JSONB
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id UUID PRIMARY KEY,
        endpoint_id UUID NOT NULL REFERENCES endpoints(id) ON DELETE CASCADE,
        analyzed_at TIMESTAMPTZ NOT NULL,
        tool_calls JSONB NOT NULL DEFAULT '[]'::jsonb,
        reasoning TEXT NOT NULL,
        token_usage BIGINT,
        duration_ms BIGINT,
        next_analysis_at TIMESTAMPTZ,
        endpoint_failure_count INTEGER
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_endpoints_next_run_at ON endpoints (next_run_at)",
    "CREATE INDEX IF NOT EXISTS idx_endpoints_tenant ON endpoints (tenant_id)",
    "CREATE INDEX IF NOT EXISTS idx_runs_endpoint_started ON runs (endpoint_id, started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_runs_running ON runs (started_at) WHERE status = 'running'",
    "CREATE INDEX IF NOT EXISTS idx_sessions_endpoint_analyzed ON sessions (endpoint_id, analyzed_at DESC)",
];

impl DatabaseSetup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn setup(&self) -> Result<()> {
        info!("Starting database setup");

        self.create_enum_types().await?;
        self.create_tables().await?;
        self.create_indexes().await?;
        self.verify().await?;

        info!("Database setup completed");
        Ok(())
    }

    async fn create_enum_types(&self) -> Result<()> {
        for (name, values) in ENUM_TYPES {
            let statement = format!(
                r#"
                DO $$ BEGIN
                    CREATE TYPE {name} AS ENUM ({values});
                EXCEPTION WHEN duplicate_object THEN NULL;
                END $$
                "#
            );
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create enum type {name}"))?;
        }
        Ok(())
    }

    async fn create_tables(&self) -> Result<()> {
        for statement in TABLES {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create table")?;
        }
        Ok(())
    }

    async fn create_indexes(&self) -> Result<()> {
        for statement in INDEXES {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create index")?;
        }
        Ok(())
    }

    async fn verify(&self) -> Result<()> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM information_schema.tables
            WHERE table_schema = 'public'
              AND table_name IN ('users', 'jobs', 'endpoints', 'runs', 'sessions')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        if count != 5 {
            return Err(anyhow::anyhow!(
                "Schema verification failed: expected 5 tables, found {count}"
            ));
        }
        Ok(())
    }
}
