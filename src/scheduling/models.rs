use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::{Result, SchedulerError};

/// Baseline intervals shorter than this are rejected at validation.
pub const MIN_BASELINE_INTERVAL_MS: i64 = 1000;

/// Default pessimistic lock duration when the endpoint does not declare
/// a `max_execution_time_ms`.
pub const DEFAULT_LOCK_DURATION_MS: i64 = 60_000;

/// Default cap on captured response bodies, in kilobytes.
pub const DEFAULT_MAX_RESPONSE_SIZE_KB: i64 = 100;

/// Failure backoff doubles per failure up to 2^5 = 32x the baseline.
pub const MAX_BACKOFF_EXPONENT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "http_method", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn allows_body(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            _ => Err(format!("Invalid HTTP method: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "run_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn counts_as_failure(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Canceled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Paused,
    Archived,
}

/// Provenance of a scheduling decision, recorded on runs for auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "schedule_source", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleSource {
    Paused,
    AiOneshot,
    AiInterval,
    BaselineCron,
    BaselineInterval,
    ClampedMin,
    ClampedMax,
}

impl fmt::Display for ScheduleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleSource::Paused => "paused",
            ScheduleSource::AiOneshot => "ai-oneshot",
            ScheduleSource::AiInterval => "ai-interval",
            ScheduleSource::BaselineCron => "baseline-cron",
            ScheduleSource::BaselineInterval => "baseline-interval",
            ScheduleSource::ClampedMin => "clamped-min",
            ScheduleSource::ClampedMax => "clamped-max",
        };
        write!(f, "{s}")
    }
}

/// Billing tier. Stored as text so unknown values survive reads and can
/// fail closed in quota checks instead of poisoning row decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    Free,
    Pro,
    Enterprise,
}

impl UserTier {
    /// Monthly AI token budget per tier.
    pub fn monthly_token_limit(&self) -> i64 {
        match self {
            UserTier::Free => 100_000,
            UserTier::Pro => 1_000_000,
            UserTier::Enterprise => 10_000_000,
        }
    }
}

impl FromStr for UserTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(UserTier::Free),
            "pro" => Ok(UserTier::Pro),
            "enterprise" => Ok(UserTier::Enterprise),
            _ => Err(format!("Unknown tier: {s}")),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub tier: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The unit of scheduling: one URL plus cadence, guardrails, hint slot,
/// and runtime state.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,

    pub url: String,
    pub method: HttpMethod,
    /// Encrypted wire text or plain JSON object, depending on sensitivity.
    pub headers: Option<String>,
    pub body_json: Option<serde_json::Value>,
    pub timeout_ms: Option<i64>,
    pub max_execution_time_ms: Option<i64>,
    pub max_response_size_kb: Option<i64>,

    pub baseline_cron: Option<String>,
    pub baseline_interval_ms: Option<i64>,
    pub min_interval_ms: Option<i64>,
    pub max_interval_ms: Option<i64>,

    pub ai_hint_interval_ms: Option<i64>,
    pub ai_hint_next_run_at: Option<DateTime<Utc>>,
    pub ai_hint_expires_at: Option<DateTime<Utc>>,
    pub ai_hint_reason: Option<String>,

    pub paused_until: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub failure_count: i32,

    /// Pessimistic lock deadline. Adapter-private; never exposed to tenants.
    pub locked_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// A hint participates in scheduling only while its expiry is strictly
    /// in the future.
    pub fn hint_is_fresh(&self, now: DateTime<Utc>) -> bool {
        matches!(self.ai_hint_expires_at, Some(expires) if expires > now)
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        matches!(self.paused_until, Some(until) if until > now)
    }

    pub fn lock_duration_ms(&self) -> i64 {
        self.max_execution_time_ms
            .unwrap_or(0)
            .max(DEFAULT_LOCK_DURATION_MS)
    }

    pub fn response_cap_bytes(&self) -> usize {
        let kb = self
            .max_response_size_kb
            .unwrap_or(DEFAULT_MAX_RESPONSE_SIZE_KB)
            .max(1);
        (kb as usize) * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEndpointRequest {
    pub job_id: Option<Uuid>,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub url: String,
    pub method: HttpMethod,
    pub headers: Option<crate::secrets::HeaderMap>,
    pub body_json: Option<serde_json::Value>,
    pub timeout_ms: Option<i64>,
    pub max_execution_time_ms: Option<i64>,
    pub max_response_size_kb: Option<i64>,
    pub baseline_cron: Option<String>,
    pub baseline_interval_ms: Option<i64>,
    pub min_interval_ms: Option<i64>,
    pub max_interval_ms: Option<i64>,
    /// First due time. Defaults to the creation instant, which makes new
    /// endpoints immediately claimable; the governor owns every value after.
    pub next_run_at: Option<DateTime<Utc>>,
}

impl CreateEndpointRequest {
    /// Enforces the construction invariants: exactly one baseline cadence,
    /// interval floor, and min/max ordering.
    pub fn validate(&self) -> Result<()> {
        match (&self.baseline_cron, self.baseline_interval_ms) {
            (Some(_), Some(_)) => {
                return Err(SchedulerError::Validation(
                    "baseline_cron and baseline_interval_ms are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(SchedulerError::Validation(
                    "one of baseline_cron or baseline_interval_ms is required".to_string(),
                ))
            }
            (None, Some(interval)) if interval < MIN_BASELINE_INTERVAL_MS => {
                return Err(SchedulerError::Validation(format!(
                    "baseline_interval_ms must be at least {MIN_BASELINE_INTERVAL_MS}, got {interval}"
                )))
            }
            _ => {}
        }

        if let (Some(min), Some(max)) = (self.min_interval_ms, self.max_interval_ms) {
            if min > max {
                return Err(SchedulerError::Validation(format!(
                    "min_interval_ms ({min}) must not exceed max_interval_ms ({max})"
                )));
            }
        }

        if self.url.trim().is_empty() {
            return Err(SchedulerError::Validation("url must not be empty".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateEndpointRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub method: Option<HttpMethod>,
    pub headers: Option<crate::secrets::HeaderMap>,
    pub body_json: Option<serde_json::Value>,
    pub timeout_ms: Option<i64>,
    pub max_execution_time_ms: Option<i64>,
    pub max_response_size_kb: Option<i64>,
    pub baseline_cron: Option<String>,
    pub baseline_interval_ms: Option<i64>,
    pub min_interval_ms: Option<i64>,
    pub max_interval_ms: Option<i64>,
}

/// One execution attempt of one endpoint.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub attempt: i32,
    pub source: Option<ScheduleSource>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status_code: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub endpoint_id: Uuid,
    pub attempt: i32,
    pub source: Option<ScheduleSource>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FinishRun {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status_code: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
}

/// Everything the worker writes when a run completes: the terminal run
/// fields plus the endpoint advance, committed as one transaction.
#[derive(Debug, Clone)]
pub struct AfterRunUpdate {
    pub run_id: Uuid,
    pub finish: FinishRun,
    pub last_run_at: DateTime<Utc>,
    pub failure_count: i32,
    pub next_run_at: DateTime<Utc>,
    /// Set when the hint expired at or before the advance instant; clears
    /// all four hint fields.
    pub clear_hints: bool,
}

/// TTL-bounded schedule mutation written by the AI planner. Every write
/// replaces the whole quadruple.
#[derive(Debug, Clone)]
pub struct AiHintWrite {
    pub interval_ms: Option<i64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// One AI analysis of one endpoint. Immutable once written.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
    pub tool_calls: serde_json::Value,
    pub reasoning: String,
    pub token_usage: Option<i64>,
    pub duration_ms: Option<i64>,
    pub next_analysis_at: Option<DateTime<Utc>>,
    pub endpoint_failure_count: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub endpoint_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
    pub tool_calls: serde_json::Value,
    pub reasoning: String,
    pub token_usage: Option<i64>,
    pub duration_ms: Option<i64>,
    pub next_analysis_at: Option<DateTime<Utc>>,
    pub endpoint_failure_count: Option<i32>,
}

/// Ordered record of one tool invocation inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub args: serde_json::Value,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilters {
    pub endpoint_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Aggregate over an endpoint's recent runs, fed into the analysis prompt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub success_count: i64,
    pub failure_count: i64,
    pub avg_duration_ms: Option<f64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    /// Consecutive failures counted back from the most recent finished run.
    pub failure_streak: i64,
}

/// Latest captured response for one endpoint.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ResponseSnapshot {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub status_code: Option<i32>,
    pub response_body: Option<serde_json::Value>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One page of recent finished runs with captured responses.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseHistoryPage {
    pub entries: Vec<ResponseSnapshot>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Latest response and schedule posture of a sibling endpoint in the
/// same job.
#[derive(Debug, Clone, Serialize)]
pub struct SiblingSnapshot {
    pub endpoint_id: Uuid,
    pub name: String,
    pub baseline_cron: Option<String>,
    pub baseline_interval_ms: Option<i64>,
    pub next_run_at: DateTime<Utc>,
    pub paused_until: Option<DateTime<Utc>>,
    pub ai_hint_interval_ms: Option<i64>,
    pub ai_hint_next_run_at: Option<DateTime<Utc>>,
    pub ai_hint_expires_at: Option<DateTime<Utc>>,
    pub latest: Option<ResponseSnapshot>,
}

/// Tenant usage counters for cap enforcement by the outer API.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub endpoint_count: i64,
    pub run_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> CreateEndpointRequest {
        CreateEndpointRequest {
            job_id: None,
            tenant_id: Uuid::new_v4(),
            name: "health-probe".to_string(),
            description: None,
            url: "https://example.com/health".to_string(),
            method: HttpMethod::Get,
            headers: None,
            body_json: None,
            timeout_ms: None,
            max_execution_time_ms: None,
            max_response_size_kb: None,
            baseline_cron: None,
            baseline_interval_ms: Some(60_000),
            min_interval_ms: None,
            max_interval_ms: None,
            next_run_at: None,
        }
    }

    #[test]
    fn validate_requires_exactly_one_baseline() {
        let mut both = base_request();
        both.baseline_cron = Some("*/5 * * * *".to_string());
        assert!(both.validate().is_err());

        let mut neither = base_request();
        neither.baseline_interval_ms = None;
        assert!(neither.validate().is_err());

        assert!(base_request().validate().is_ok());
    }

    #[test]
    fn validate_rejects_sub_second_interval() {
        let mut request = base_request();
        request.baseline_interval_ms = Some(999);
        assert!(request.validate().is_err());

        request.baseline_interval_ms = Some(1000);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_clamps() {
        let mut request = base_request();
        request.min_interval_ms = Some(60_000);
        request.max_interval_ms = Some(30_000);
        assert!(request.validate().is_err());

        request.max_interval_ms = Some(60_000);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn hint_freshness_is_strict() {
        let now = Utc::now();
        let mut endpoint = test_endpoint(now);
        assert!(!endpoint.hint_is_fresh(now));

        endpoint.ai_hint_expires_at = Some(now);
        assert!(!endpoint.hint_is_fresh(now));

        endpoint.ai_hint_expires_at = Some(now + chrono::Duration::seconds(1));
        assert!(endpoint.hint_is_fresh(now));
    }

    #[test]
    fn unknown_tier_fails_to_parse() {
        assert!(UserTier::from_str("platinum").is_err());
        assert_eq!(UserTier::from_str("FREE").unwrap(), UserTier::Free);
        assert_eq!(
            UserTier::from_str("enterprise").unwrap().monthly_token_limit(),
            10_000_000
        );
    }

    fn test_endpoint(now: DateTime<Utc>) -> Endpoint {
        Endpoint {
            id: Uuid::new_v4(),
            job_id: None,
            tenant_id: Uuid::new_v4(),
            name: "health-probe".to_string(),
            description: None,
            url: "https://example.com/health".to_string(),
            method: HttpMethod::Get,
            headers: None,
            body_json: None,
            timeout_ms: None,
            max_execution_time_ms: None,
            max_response_size_kb: None,
            baseline_cron: None,
            baseline_interval_ms: Some(60_000),
            min_interval_ms: None,
            max_interval_ms: None,
            ai_hint_interval_ms: None,
            ai_hint_next_run_at: None,
            ai_hint_expires_at: None,
            ai_hint_reason: None,
            paused_until: None,
            last_run_at: None,
            next_run_at: now,
            failure_count: 0,
            locked_until: None,
            created_at: now,
            updated_at: now,
        }
    }
}
