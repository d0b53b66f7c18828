//! SQL-backed repositories. Postgres is the serialization point for the
//! whole system: claims, run records, hint writes, and quota all go
//! through these queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{start_of_utc_month, JobsRepo, QuotaGuard, RunsRepo, SessionsRepo};
use crate::scheduling::cron::StandardCron;
use crate::scheduling::error::{Result, SchedulerError};
use crate::scheduling::models::{
    AfterRunUpdate, AiHintWrite, CreateEndpointRequest, CreateJobRequest, Endpoint, FinishRun,
    HealthSummary, Job, JobStatus, NewRun, NewSession, ResponseHistoryPage, ResponseSnapshot, Run,
    RunFilters, RunStatus, Session, SiblingSnapshot, UpdateEndpointRequest, UpdateJobRequest,
    UsageSummary, UserTier, DEFAULT_LOCK_DURATION_MS, MIN_BASELINE_INTERVAL_MS,
};
use crate::secrets::HeaderCipher;

pub struct PgJobsRepo {
    pool: PgPool,
    cipher: Arc<HeaderCipher>,
}

impl PgJobsRepo {
    pub fn new(pool: PgPool, cipher: Arc<HeaderCipher>) -> Self {
        Self { pool, cipher }
    }
}

#[async_trait]
impl JobsRepo for PgJobsRepo {
    async fn create_job(&self, request: CreateJobRequest) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (id, user_id, name, description, status)
            VALUES ($1, $2, $3, $4, 'active')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.user_id)
        .bind(&request.name)
        .bind(&request.description)
        .fetch_one(&self.pool)
        .await?;

        info!(job_id = %job.id, user_id = %job.user_id, "Created job");
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    async fn list_jobs(&self, user_id: Uuid, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE user_id = $1 AND ($2::job_status IS NULL OR status = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn update_job(&self, id: Uuid, request: UpdateJobRequest) -> Result<Job> {
        sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                status = COALESCE($4, status),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(request.status)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    async fn archive_job(&self, id: Uuid) -> Result<Job> {
        self.update_job(
            id,
            UpdateJobRequest {
                status: Some(JobStatus::Archived),
                ..Default::default()
            },
        )
        .await
    }

    async fn add_endpoint(&self, request: CreateEndpointRequest) -> Result<Endpoint> {
        request.validate()?;
        if let Some(expression) = &request.baseline_cron {
            StandardCron::validate(expression)?;
        }

        let headers = match &request.headers {
            Some(map) => self.cipher.seal(map)?,
            None => None,
        };

        let endpoint = sqlx::query_as::<_, Endpoint>(
            r#"
            INSERT INTO endpoints (
                id, job_id, tenant_id, name, description, url, method,
                headers, body_json, timeout_ms, max_execution_time_ms,
                max_response_size_kb, baseline_cron, baseline_interval_ms,
                min_interval_ms, max_interval_ms, next_run_at, failure_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, COALESCE($17, NOW()), 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.job_id)
        .bind(request.tenant_id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.url)
        .bind(request.method)
        .bind(&headers)
        .bind(&request.body_json)
        .bind(request.timeout_ms)
        .bind(request.max_execution_time_ms)
        .bind(request.max_response_size_kb)
        .bind(&request.baseline_cron)
        .bind(request.baseline_interval_ms)
        .bind(request.min_interval_ms)
        .bind(request.max_interval_ms)
        .bind(request.next_run_at)
        .fetch_one(&self.pool)
        .await?;

        info!(endpoint_id = %endpoint.id, name = %endpoint.name, "Created endpoint");
        Ok(endpoint)
    }

    async fn update_endpoint(&self, id: Uuid, request: UpdateEndpointRequest) -> Result<Endpoint> {
        if request.baseline_cron.is_some() && request.baseline_interval_ms.is_some() {
            return Err(SchedulerError::Validation(
                "baseline_cron and baseline_interval_ms are mutually exclusive".to_string(),
            ));
        }
        if let Some(expression) = &request.baseline_cron {
            StandardCron::validate(expression)?;
        }
        if let Some(interval) = request.baseline_interval_ms {
            if interval < MIN_BASELINE_INTERVAL_MS {
                return Err(SchedulerError::Validation(format!(
                    "baseline_interval_ms must be at least {MIN_BASELINE_INTERVAL_MS}, got {interval}"
                )));
            }
        }

        let mut tx = self.pool.begin().await?;

        let current =
            sqlx::query_as::<_, Endpoint>("SELECT * FROM endpoints WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })?;

        let headers = match &request.headers {
            Some(map) => self.cipher.seal(map)?,
            None => current.headers.clone(),
        };

        // A baseline update swaps cadence kinds; otherwise both columns keep
        // their current values, preserving the XOR invariant.
        let (baseline_cron, baseline_interval_ms) =
            match (&request.baseline_cron, request.baseline_interval_ms) {
                (Some(expression), None) => (Some(expression.clone()), None),
                (None, Some(interval)) => (None, Some(interval)),
                _ => (
                    current.baseline_cron.clone(),
                    current.baseline_interval_ms,
                ),
            };

        let min_interval_ms = request.min_interval_ms.or(current.min_interval_ms);
        let max_interval_ms = request.max_interval_ms.or(current.max_interval_ms);
        if let (Some(min), Some(max)) = (min_interval_ms, max_interval_ms) {
            if min > max {
                return Err(SchedulerError::Validation(format!(
                    "min_interval_ms ({min}) must not exceed max_interval_ms ({max})"
                )));
            }
        }

        let updated = sqlx::query_as::<_, Endpoint>(
            r#"
            UPDATE endpoints
            SET name = $2, description = $3, url = $4, method = $5,
                headers = $6, body_json = $7, timeout_ms = $8,
                max_execution_time_ms = $9, max_response_size_kb = $10,
                baseline_cron = $11, baseline_interval_ms = $12,
                min_interval_ms = $13, max_interval_ms = $14,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(request.name.unwrap_or(current.name))
        .bind(request.description.or(current.description))
        .bind(request.url.unwrap_or(current.url))
        .bind(request.method.unwrap_or(current.method))
        .bind(&headers)
        .bind(request.body_json.or(current.body_json))
        .bind(request.timeout_ms.or(current.timeout_ms))
        .bind(request.max_execution_time_ms.or(current.max_execution_time_ms))
        .bind(request.max_response_size_kb.or(current.max_response_size_kb))
        .bind(&baseline_cron)
        .bind(baseline_interval_ms)
        .bind(min_interval_ms)
        .bind(max_interval_ms)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Endpoint> {
        sqlx::query_as::<_, Endpoint>("SELECT * FROM endpoints WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })
    }

    async fn find_endpoint(&self, user_id: Uuid, id: Uuid) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            "SELECT * FROM endpoints WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(endpoint)
    }

    async fn list_endpoints_by_job(&self, job_id: Uuid) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(
            "SELECT * FROM endpoints WHERE job_id = $1 ORDER BY created_at ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(endpoints)
    }

    async fn delete_endpoint(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM endpoints WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::EndpointNotFound { id: id.to_string() });
        }
        info!(endpoint_id = %id, "Deleted endpoint");
        Ok(())
    }

    async fn claim_due_endpoints(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        within_ms: i64,
    ) -> Result<Vec<Uuid>> {
        let horizon = now + chrono::Duration::milliseconds(within_ms);

        // Single statement: the locking SELECT and the lock write commit
        // together, so concurrent workers cannot claim the same row.
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT e.id,
                       GREATEST(COALESCE(e.max_execution_time_ms, 0), $4) AS lock_ms
                FROM endpoints e
                LEFT JOIN jobs j ON j.id = e.job_id
                WHERE e.next_run_at <= $2
                  AND (e.paused_until IS NULL OR e.paused_until <= $1)
                  AND (e.locked_until IS NULL OR e.locked_until <= $1)
                  AND (e.job_id IS NULL OR j.status = 'active')
                ORDER BY e.next_run_at ASC
                LIMIT $3
                FOR UPDATE OF e SKIP LOCKED
            )
            UPDATE endpoints e
            SET locked_until = $1 + make_interval(secs => due.lock_ms / 1000.0)
            FROM due
            WHERE e.id = due.id
            RETURNING e.id
            "#,
        )
        .bind(now)
        .bind(horizon)
        .bind(limit)
        .bind(DEFAULT_LOCK_DURATION_MS)
        .fetch_all(&self.pool)
        .await?;

        let claimed: Vec<Uuid> = rows.iter().map(|row| row.get("id")).collect();
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed due endpoints");
        }
        Ok(claimed)
    }

    async fn set_lock(&self, id: Uuid, until: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE endpoints SET locked_until = $2 WHERE id = $1")
            .bind(id)
            .bind(until)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::EndpointNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn clear_lock(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE endpoints SET locked_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::EndpointNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn set_next_run_at_if_earlier(&self, id: Uuid, when: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE endpoints SET next_run_at = $2 WHERE id = $1 AND next_run_at > $2")
            .bind(id)
            .bind(when)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_after_run(
        &self,
        endpoint_id: Uuid,
        update: AfterRunUpdate,
    ) -> Result<Endpoint> {
        let mut tx = self.pool.begin().await?;

        let finished = sqlx::query(
            r#"
            UPDATE runs
            SET status = $2, finished_at = $3, duration_ms = $4,
                status_code = $5, response_body = $6, error_message = $7,
                error_details = $8
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(update.run_id)
        .bind(update.finish.status)
        .bind(update.finish.finished_at)
        .bind(update.finish.duration_ms)
        .bind(update.finish.status_code)
        .bind(&update.finish.response_body)
        .bind(&update.finish.error_message)
        .bind(&update.finish.error_details)
        .execute(&mut *tx)
        .await?;
        if finished.rows_affected() == 0 {
            return Err(SchedulerError::RunAlreadyFinished {
                id: update.run_id.to_string(),
            });
        }

        let endpoint = sqlx::query_as::<_, Endpoint>(
            r#"
            UPDATE endpoints
            SET last_run_at = $2,
                failure_count = $3,
                next_run_at = $4,
                ai_hint_interval_ms = CASE WHEN $5 THEN NULL ELSE ai_hint_interval_ms END,
                ai_hint_next_run_at = CASE WHEN $5 THEN NULL ELSE ai_hint_next_run_at END,
                ai_hint_expires_at = CASE WHEN $5 THEN NULL ELSE ai_hint_expires_at END,
                ai_hint_reason = CASE WHEN $5 THEN NULL ELSE ai_hint_reason END,
                locked_until = NULL,
                updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(endpoint_id)
        .bind(update.last_run_at)
        .bind(update.failure_count)
        .bind(update.next_run_at)
        .bind(update.clear_hints)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| SchedulerError::EndpointNotFound {
            id: endpoint_id.to_string(),
        })?;

        tx.commit().await?;
        Ok(endpoint)
    }

    async fn write_ai_hint(&self, id: Uuid, hint: AiHintWrite) -> Result<Endpoint> {
        sqlx::query_as::<_, Endpoint>(
            r#"
            UPDATE endpoints
            SET ai_hint_interval_ms = $2, ai_hint_next_run_at = $3,
                ai_hint_expires_at = $4, ai_hint_reason = $5, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(hint.interval_ms)
        .bind(hint.next_run_at)
        .bind(hint.expires_at)
        .bind(&hint.reason)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })
    }

    async fn clear_ai_hints(&self, id: Uuid) -> Result<Endpoint> {
        sqlx::query_as::<_, Endpoint>(
            r#"
            UPDATE endpoints
            SET ai_hint_interval_ms = NULL, ai_hint_next_run_at = NULL,
                ai_hint_expires_at = NULL, ai_hint_reason = NULL, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })
    }

    async fn set_paused_until(&self, id: Uuid, until: Option<DateTime<Utc>>) -> Result<Endpoint> {
        sqlx::query_as::<_, Endpoint>(
            "UPDATE endpoints SET paused_until = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(until)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })
    }

    async fn reset_failure_count(&self, id: Uuid) -> Result<()> {
        let result =
            sqlx::query("UPDATE endpoints SET failure_count = 0, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::EndpointNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn get_usage(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<UsageSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM endpoints WHERE tenant_id = $1) AS endpoint_count,
                (SELECT COUNT(*) FROM runs r
                 JOIN endpoints e ON e.id = r.endpoint_id
                 WHERE e.tenant_id = $1 AND r.started_at >= $2) AS run_count
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageSummary {
            endpoint_count: row.get("endpoint_count"),
            run_count: row.get("run_count"),
        })
    }
}

pub struct PgRunsRepo {
    pool: PgPool,
}

impl PgRunsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunsRepo for PgRunsRepo {
    async fn create(&self, new_run: NewRun) -> Result<Run> {
        let run = sqlx::query_as::<_, Run>(
            r#"
            INSERT INTO runs (id, endpoint_id, attempt, source, status, started_at)
            VALUES ($1, $2, $3, $4, 'running', $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new_run.endpoint_id)
        .bind(new_run.attempt)
        .bind(new_run.source)
        .bind(new_run.started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(run)
    }

    async fn finish(&self, run_id: Uuid, outcome: FinishRun) -> Result<Run> {
        sqlx::query_as::<_, Run>(
            r#"
            UPDATE runs
            SET status = $2, finished_at = $3, duration_ms = $4,
                status_code = $5, response_body = $6, error_message = $7,
                error_details = $8
            WHERE id = $1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(outcome.status)
        .bind(outcome.finished_at)
        .bind(outcome.duration_ms)
        .bind(outcome.status_code)
        .bind(&outcome.response_body)
        .bind(&outcome.error_message)
        .bind(&outcome.error_details)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::RunAlreadyFinished {
            id: run_id.to_string(),
        })
    }

    async fn list_runs(&self, filters: RunFilters) -> Result<Vec<Run>> {
        let limit = if filters.limit > 0 {
            Some(filters.limit)
        } else {
            None
        };
        let runs = sqlx::query_as::<_, Run>(
            r#"
            SELECT * FROM runs
            WHERE ($1::uuid IS NULL OR endpoint_id = $1)
              AND ($2::run_status IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR started_at >= $3)
            ORDER BY started_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filters.endpoint_id)
        .bind(filters.status)
        .bind(filters.since)
        .bind(limit)
        .bind(filters.offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    async fn get_run_details(&self, run_id: Uuid) -> Result<Run> {
        sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::RunNotFound {
                id: run_id.to_string(),
            })
    }

    async fn get_health_summary(
        &self,
        endpoint_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<HealthSummary> {
        let aggregates = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'success') AS success_count,
                COUNT(*) FILTER (WHERE status IN ('failed', 'canceled')) AS failure_count,
                AVG(duration_ms)::float8 AS avg_duration_ms
            FROM runs
            WHERE endpoint_id = $1 AND started_at >= $2 AND status <> 'running'
            "#,
        )
        .bind(endpoint_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        // The streak needs per-row order, so it is counted in code over the
        // most recent statuses rather than in SQL.
        let recent = sqlx::query(
            r#"
            SELECT status, finished_at FROM runs
            WHERE endpoint_id = $1 AND started_at >= $2 AND status <> 'running'
            ORDER BY finished_at DESC
            LIMIT 50
            "#,
        )
        .bind(endpoint_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let statuses: Vec<RunStatus> = recent.iter().map(|row| row.get("status")).collect();
        let failure_streak = statuses
            .iter()
            .take_while(|status| status.counts_as_failure())
            .count() as i64;

        Ok(HealthSummary {
            success_count: aggregates.get("success_count"),
            failure_count: aggregates.get("failure_count"),
            avg_duration_ms: aggregates.get("avg_duration_ms"),
            last_run_at: recent
                .first()
                .and_then(|row| row.get::<Option<DateTime<Utc>>, _>("finished_at")),
            last_run_status: statuses.first().copied(),
            failure_streak,
        })
    }

    async fn get_endpoints_with_recent_runs(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT DISTINCT endpoint_id FROM runs WHERE started_at >= $1 ORDER BY endpoint_id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("endpoint_id")).collect())
    }

    async fn get_latest_response(&self, endpoint_id: Uuid) -> Result<Option<ResponseSnapshot>> {
        let snapshot = sqlx::query_as::<_, ResponseSnapshot>(
            r#"
            SELECT id AS run_id, status, status_code, response_body, finished_at
            FROM runs
            WHERE endpoint_id = $1 AND status <> 'running'
            ORDER BY finished_at DESC
            LIMIT 1
            "#,
        )
        .bind(endpoint_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(snapshot)
    }

    async fn get_response_history(
        &self,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<ResponseHistoryPage> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM runs WHERE endpoint_id = $1 AND status <> 'running'",
        )
        .bind(endpoint_id)
        .fetch_one(&self.pool)
        .await?;

        let entries = sqlx::query_as::<_, ResponseSnapshot>(
            r#"
            SELECT id AS run_id, status, status_code, response_body, finished_at
            FROM runs
            WHERE endpoint_id = $1 AND status <> 'running'
            ORDER BY finished_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(endpoint_id)
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(ResponseHistoryPage {
            entries,
            total,
            limit,
            offset,
        })
    }

    async fn get_sibling_latest_responses(
        &self,
        job_id: Uuid,
        exclude_endpoint_id: Uuid,
    ) -> Result<Vec<SiblingSnapshot>> {
        let siblings = sqlx::query_as::<_, Endpoint>(
            "SELECT * FROM endpoints WHERE job_id = $1 AND id <> $2 ORDER BY created_at ASC",
        )
        .bind(job_id)
        .bind(exclude_endpoint_id)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots = Vec::with_capacity(siblings.len());
        for sibling in siblings {
            let latest = self.get_latest_response(sibling.id).await?;
            snapshots.push(SiblingSnapshot {
                endpoint_id: sibling.id,
                name: sibling.name,
                baseline_cron: sibling.baseline_cron,
                baseline_interval_ms: sibling.baseline_interval_ms,
                next_run_at: sibling.next_run_at,
                paused_until: sibling.paused_until,
                ai_hint_interval_ms: sibling.ai_hint_interval_ms,
                ai_hint_next_run_at: sibling.ai_hint_next_run_at,
                ai_hint_expires_at: sibling.ai_hint_expires_at,
                latest,
            });
        }
        Ok(snapshots)
    }

    async fn cleanup_zombie_runs(&self, now: DateTime<Utc>, older_than_ms: i64) -> Result<u64> {
        let threshold = now - chrono::Duration::milliseconds(older_than_ms);
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'failed',
                finished_at = $1,
                duration_ms = (EXTRACT(EPOCH FROM ($1 - started_at)) * 1000)::bigint,
                error_message = 'zombie run reaped: still running after ' || $2::bigint || 'ms'
            WHERE status = 'running' AND started_at <= $3
            "#,
        )
        .bind(now)
        .bind(older_than_ms)
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

pub struct PgSessionsRepo {
    pool: PgPool,
}

impl PgSessionsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionsRepo for PgSessionsRepo {
    async fn create(&self, session: NewSession) -> Result<Session> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO sessions (
                id, endpoint_id, analyzed_at, tool_calls, reasoning,
                token_usage, duration_ms, next_analysis_at, endpoint_failure_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session.endpoint_id)
        .bind(session.analyzed_at)
        .bind(&session.tool_calls)
        .bind(&session.reasoning)
        .bind(session.token_usage)
        .bind(session.duration_ms)
        .bind(session.next_analysis_at)
        .bind(session.endpoint_failure_count)
        .fetch_one(&self.pool)
        .await?;
        Ok(session)
    }

    async fn get_last_session(&self, endpoint_id: Uuid) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE endpoint_id = $1
            ORDER BY analyzed_at DESC
            LIMIT 1
            "#,
        )
        .bind(endpoint_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn get_recent_sessions(
        &self,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE endpoint_id = $1
            ORDER BY analyzed_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(endpoint_id)
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn get_total_token_usage(
        &self,
        endpoint_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(token_usage), 0)::bigint
            FROM sessions
            WHERE endpoint_id = $1 AND analyzed_at >= $2
            "#,
        )
        .bind(endpoint_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}

pub struct PgQuotaGuard {
    pool: PgPool,
}

impl PgQuotaGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaGuard for PgQuotaGuard {
    async fn can_proceed(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let tier: Option<String> = sqlx::query_scalar("SELECT tier FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(tier) = tier else {
            return Ok(false);
        };
        let Ok(tier) = UserTier::from_str(&tier) else {
            // Unknown tier strings fail closed rather than granting budget.
            return Ok(false);
        };

        let used: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(s.token_usage), 0)::bigint
            FROM sessions s
            JOIN endpoints e ON e.id = s.endpoint_id
            WHERE e.tenant_id = $1 AND s.analyzed_at >= $2
            "#,
        )
        .bind(user_id)
        .bind(start_of_utc_month(now))
        .fetch_one(&self.pool)
        .await?;

        Ok(used < tier.monthly_token_limit())
    }

    async fn record_usage(&self, _user_id: Uuid, _tokens: i64) -> Result<()> {
        Ok(())
    }
}
