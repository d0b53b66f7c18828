//! Persistence contracts for the scheduling core.
//!
//! The database is the only coordination channel between workers, so these
//! traits carry the whole shared-state surface: claims, run records, hint
//! writes, sessions, and quota. `postgres` is the production backend;
//! `memory` is the fixture the worker and planner tests run against.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use uuid::Uuid;

use super::error::Result;
use super::models::{
    AfterRunUpdate, AiHintWrite, CreateEndpointRequest, CreateJobRequest, Endpoint, FinishRun,
    HealthSummary, Job, JobStatus, NewRun, NewSession, ResponseHistoryPage, ResponseSnapshot, Run,
    RunFilters, Session, SiblingSnapshot, UpdateEndpointRequest, UpdateJobRequest, UsageSummary,
};

pub use memory::InMemoryStore;
pub use postgres::{PgJobsRepo, PgQuotaGuard, PgRunsRepo, PgSessionsRepo};

/// Jobs, endpoints, and the pessimistic claim machinery.
#[async_trait]
pub trait JobsRepo: Send + Sync {
    async fn create_job(&self, request: CreateJobRequest) -> Result<Job>;
    async fn get_job(&self, id: Uuid) -> Result<Job>;
    async fn list_jobs(&self, user_id: Uuid, status: Option<JobStatus>) -> Result<Vec<Job>>;
    async fn update_job(&self, id: Uuid, request: UpdateJobRequest) -> Result<Job>;
    /// Archives the job; its endpoints stop being claimable.
    async fn archive_job(&self, id: Uuid) -> Result<Job>;

    async fn add_endpoint(&self, request: CreateEndpointRequest) -> Result<Endpoint>;
    async fn update_endpoint(&self, id: Uuid, request: UpdateEndpointRequest) -> Result<Endpoint>;
    async fn get_endpoint(&self, id: Uuid) -> Result<Endpoint>;
    /// Ownership-filtered lookup for tenant-facing callers.
    async fn find_endpoint(&self, user_id: Uuid, id: Uuid) -> Result<Option<Endpoint>>;
    async fn list_endpoints_by_job(&self, job_id: Uuid) -> Result<Vec<Endpoint>>;
    async fn delete_endpoint(&self, id: Uuid) -> Result<()>;

    /// Atomically claims up to `limit` endpoints due within `within_ms`,
    /// setting each one's lock to `now + max(max_execution_time_ms, 60s)`.
    /// Safe against concurrent workers: an endpoint appears in at most one
    /// caller's result until its lock elapses.
    async fn claim_due_endpoints(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        within_ms: i64,
    ) -> Result<Vec<Uuid>>;
    async fn set_lock(&self, id: Uuid, until: DateTime<Utc>) -> Result<()>;
    async fn clear_lock(&self, id: Uuid) -> Result<()>;

    /// Nudge: moves `next_run_at` backward only, never forward.
    async fn set_next_run_at_if_earlier(&self, id: Uuid, when: DateTime<Utc>) -> Result<()>;

    /// Finishes the run and advances the endpoint in one transaction; the
    /// lock release rides the same commit so a crash cannot leak it.
    async fn update_after_run(&self, endpoint_id: Uuid, update: AfterRunUpdate)
        -> Result<Endpoint>;

    async fn write_ai_hint(&self, id: Uuid, hint: AiHintWrite) -> Result<Endpoint>;
    async fn clear_ai_hints(&self, id: Uuid) -> Result<Endpoint>;
    async fn set_paused_until(&self, id: Uuid, until: Option<DateTime<Utc>>) -> Result<Endpoint>;
    async fn reset_failure_count(&self, id: Uuid) -> Result<()>;

    async fn get_usage(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<UsageSummary>;
}

/// Run records and their read models.
#[async_trait]
pub trait RunsRepo: Send + Sync {
    async fn create(&self, new_run: NewRun) -> Result<Run>;
    /// Transitions a run to a terminal state exactly once.
    async fn finish(&self, run_id: Uuid, outcome: FinishRun) -> Result<Run>;

    async fn list_runs(&self, filters: RunFilters) -> Result<Vec<Run>>;
    async fn get_run_details(&self, run_id: Uuid) -> Result<Run>;

    async fn get_health_summary(
        &self,
        endpoint_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<HealthSummary>;
    async fn get_endpoints_with_recent_runs(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>>;

    async fn get_latest_response(&self, endpoint_id: Uuid) -> Result<Option<ResponseSnapshot>>;
    async fn get_response_history(
        &self,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<ResponseHistoryPage>;
    async fn get_sibling_latest_responses(
        &self,
        job_id: Uuid,
        exclude_endpoint_id: Uuid,
    ) -> Result<Vec<SiblingSnapshot>>;

    /// Fails runs stuck in `running` for longer than `older_than_ms`.
    /// Returns how many were reaped.
    async fn cleanup_zombie_runs(&self, now: DateTime<Utc>, older_than_ms: i64) -> Result<u64>;
}

/// AI analysis sessions: append-only audit log and quota source.
#[async_trait]
pub trait SessionsRepo: Send + Sync {
    async fn create(&self, session: NewSession) -> Result<Session>;
    async fn get_last_session(&self, endpoint_id: Uuid) -> Result<Option<Session>>;
    async fn get_recent_sessions(
        &self,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>>;
    async fn get_total_token_usage(&self, endpoint_id: Uuid, since: DateTime<Utc>)
        -> Result<i64>;
}

/// Monthly AI token budget enforcement.
#[async_trait]
pub trait QuotaGuard: Send + Sync {
    /// True iff the tenant's usage this UTC month is strictly below the
    /// tier limit. Unknown tiers fail closed.
    async fn can_proceed(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<bool>;
    /// Usage derives from session rows, so recording is a no-op for both
    /// backends; kept on the contract for meters that bill differently.
    async fn record_usage(&self, user_id: Uuid, tokens: i64) -> Result<()>;
}

/// UTC midnight on the first of the month containing `now`. Everything
/// strictly before this instant belongs to a prior billing window.
pub fn start_of_utc_month(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .expect("first of month at midnight is always a valid UTC instant")
}
