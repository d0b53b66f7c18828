//! In-memory repository fixture.
//!
//! Backs the worker, planner, and governor integration tests without a
//! database. One mutex over the whole store keeps every operation atomic,
//! which is exactly the serialization point the claim contract needs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{start_of_utc_month, JobsRepo, QuotaGuard, RunsRepo, SessionsRepo};
use crate::scheduling::cron::StandardCron;
use crate::scheduling::error::{Result, SchedulerError};
use crate::scheduling::models::{
    AfterRunUpdate, AiHintWrite, CreateEndpointRequest, CreateJobRequest, Endpoint, FinishRun,
    HealthSummary, Job, JobStatus, NewRun, NewSession, ResponseHistoryPage, ResponseSnapshot, Run,
    RunFilters, RunStatus, Session, SiblingSnapshot, UpdateEndpointRequest, UpdateJobRequest,
    UsageSummary, User, UserTier,
};
use crate::secrets::HeaderCipher;

#[derive(Default)]
struct StoreInner {
    users: HashMap<Uuid, User>,
    jobs: HashMap<Uuid, Job>,
    endpoints: HashMap<Uuid, Endpoint>,
    runs: Vec<Run>,
    sessions: Vec<Session>,
}

pub struct InMemoryStore {
    cipher: Arc<HeaderCipher>,
    inner: Mutex<StoreInner>,
}

impl InMemoryStore {
    pub fn new(cipher: Arc<HeaderCipher>) -> Self {
        Self {
            cipher,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Seeds a user row; tests drive quota decisions through tiers here.
    pub fn insert_user(&self, id: Uuid, email: &str, tier: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.insert(
            id,
            User {
                id,
                email: email.to_string(),
                tier: tier.to_string(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn cipher(&self) -> Arc<HeaderCipher> {
        self.cipher.clone()
    }

    fn latest_snapshot_for(inner: &StoreInner, endpoint_id: Uuid) -> Option<ResponseSnapshot> {
        inner
            .runs
            .iter()
            .filter(|run| run.endpoint_id == endpoint_id && run.status.is_terminal())
            .max_by_key(|run| run.finished_at)
            .map(|run| ResponseSnapshot {
                run_id: run.id,
                status: run.status,
                status_code: run.status_code,
                response_body: run.response_body.clone(),
                finished_at: run.finished_at,
            })
    }
}

#[async_trait]
impl JobsRepo for InMemoryStore {
    async fn create_job(&self, request: CreateJobRequest) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            name: request.name,
            description: request.description,
            status: JobStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().unwrap().jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    async fn list_jobs(&self, user_id: Uuid, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.user_id == user_id)
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn update_job(&self, id: Uuid, request: UpdateJobRequest) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        if let Some(name) = request.name {
            job.name = name;
        }
        if let Some(description) = request.description {
            job.description = Some(description);
        }
        if let Some(status) = request.status {
            job.status = status;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
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

        let now = Utc::now();
        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            job_id: request.job_id,
            tenant_id: request.tenant_id,
            name: request.name,
            description: request.description,
            url: request.url,
            method: request.method,
            headers,
            body_json: request.body_json,
            timeout_ms: request.timeout_ms,
            max_execution_time_ms: request.max_execution_time_ms,
            max_response_size_kb: request.max_response_size_kb,
            baseline_cron: request.baseline_cron,
            baseline_interval_ms: request.baseline_interval_ms,
            min_interval_ms: request.min_interval_ms,
            max_interval_ms: request.max_interval_ms,
            ai_hint_interval_ms: None,
            ai_hint_next_run_at: None,
            ai_hint_expires_at: None,
            ai_hint_reason: None,
            paused_until: None,
            last_run_at: None,
            next_run_at: request.next_run_at.unwrap_or(now),
            failure_count: 0,
            locked_until: None,
            created_at: now,
            updated_at: now,
        };

        self.inner
            .lock()
            .unwrap()
            .endpoints
            .insert(endpoint.id, endpoint.clone());
        Ok(endpoint)
    }

    async fn update_endpoint(&self, id: Uuid, request: UpdateEndpointRequest) -> Result<Endpoint> {
        if request.baseline_cron.is_some() && request.baseline_interval_ms.is_some() {
            return Err(SchedulerError::Validation(
                "baseline_cron and baseline_interval_ms are mutually exclusive".to_string(),
            ));
        }

        let headers = match &request.headers {
            Some(map) => self.cipher.seal(map)?,
            None => None,
        };

        if let Some(expression) = &request.baseline_cron {
            StandardCron::validate(expression)?;
        }
        if let Some(interval) = request.baseline_interval_ms {
            if interval < crate::scheduling::models::MIN_BASELINE_INTERVAL_MS {
                return Err(SchedulerError::Validation(format!(
                    "baseline_interval_ms must be at least 1000, got {interval}"
                )));
            }
        }

        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })?;

        // Reject inverted clamps before any field is touched.
        let merged_min = request.min_interval_ms.or(endpoint.min_interval_ms);
        let merged_max = request.max_interval_ms.or(endpoint.max_interval_ms);
        if let (Some(min), Some(max)) = (merged_min, merged_max) {
            if min > max {
                return Err(SchedulerError::Validation(format!(
                    "min_interval_ms ({min}) must not exceed max_interval_ms ({max})"
                )));
            }
        }

        if let Some(name) = request.name {
            endpoint.name = name;
        }
        if let Some(description) = request.description {
            endpoint.description = Some(description);
        }
        if let Some(url) = request.url {
            endpoint.url = url;
        }
        if let Some(method) = request.method {
            endpoint.method = method;
        }
        if headers.is_some() {
            endpoint.headers = headers;
        }
        if let Some(body) = request.body_json {
            endpoint.body_json = Some(body);
        }
        if let Some(timeout) = request.timeout_ms {
            endpoint.timeout_ms = Some(timeout);
        }
        if let Some(max_execution) = request.max_execution_time_ms {
            endpoint.max_execution_time_ms = Some(max_execution);
        }
        if let Some(cap) = request.max_response_size_kb {
            endpoint.max_response_size_kb = Some(cap);
        }
        if let Some(expression) = request.baseline_cron {
            endpoint.baseline_cron = Some(expression);
            endpoint.baseline_interval_ms = None;
        }
        if let Some(interval) = request.baseline_interval_ms {
            endpoint.baseline_interval_ms = Some(interval);
            endpoint.baseline_cron = None;
        }
        endpoint.min_interval_ms = merged_min;
        endpoint.max_interval_ms = merged_max;

        endpoint.updated_at = Utc::now();
        Ok(endpoint.clone())
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Endpoint> {
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })
    }

    async fn find_endpoint(&self, user_id: Uuid, id: Uuid) -> Result<Option<Endpoint>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .endpoints
            .get(&id)
            .filter(|endpoint| endpoint.tenant_id == user_id)
            .cloned())
    }

    async fn list_endpoints_by_job(&self, job_id: Uuid) -> Result<Vec<Endpoint>> {
        let inner = self.inner.lock().unwrap();
        let mut endpoints: Vec<Endpoint> = inner
            .endpoints
            .values()
            .filter(|endpoint| endpoint.job_id == Some(job_id))
            .cloned()
            .collect();
        endpoints.sort_by_key(|endpoint| endpoint.created_at);
        Ok(endpoints)
    }

    async fn delete_endpoint(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.endpoints.remove(&id).is_none() {
            return Err(SchedulerError::EndpointNotFound { id: id.to_string() });
        }
        inner.runs.retain(|run| run.endpoint_id != id);
        inner.sessions.retain(|session| session.endpoint_id != id);
        Ok(())
    }

    async fn claim_due_endpoints(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        within_ms: i64,
    ) -> Result<Vec<Uuid>> {
        let horizon = now + Duration::milliseconds(within_ms);
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = inner
            .endpoints
            .values()
            .filter(|e| e.next_run_at <= horizon)
            .filter(|e| e.paused_until.map_or(true, |until| until <= now))
            .filter(|e| e.locked_until.map_or(true, |until| until <= now))
            .filter(|e| match e.job_id {
                Some(job_id) => inner
                    .jobs
                    .get(&job_id)
                    .map_or(false, |job| job.status == JobStatus::Active),
                None => true,
            })
            .map(|e| (e.next_run_at, e.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(endpoint) = inner.endpoints.get_mut(&id) {
                endpoint.locked_until =
                    Some(now + Duration::milliseconds(endpoint.lock_duration_ms()));
                claimed.push(id);
            }
        }
        Ok(claimed)
    }

    async fn set_lock(&self, id: Uuid, until: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })?;
        endpoint.locked_until = Some(until);
        Ok(())
    }

    async fn clear_lock(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })?;
        endpoint.locked_until = None;
        Ok(())
    }

    async fn set_next_run_at_if_earlier(&self, id: Uuid, when: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })?;
        if when < endpoint.next_run_at {
            endpoint.next_run_at = when;
        }
        Ok(())
    }

    async fn update_after_run(
        &self,
        endpoint_id: Uuid,
        update: AfterRunUpdate,
    ) -> Result<Endpoint> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let run = inner
            .runs
            .iter_mut()
            .find(|run| run.id == update.run_id)
            .ok_or_else(|| SchedulerError::RunNotFound {
                id: update.run_id.to_string(),
            })?;
        if run.status.is_terminal() {
            return Err(SchedulerError::RunAlreadyFinished {
                id: update.run_id.to_string(),
            });
        }
        apply_finish(run, &update.finish);

        let endpoint = inner
            .endpoints
            .get_mut(&endpoint_id)
            .ok_or_else(|| SchedulerError::EndpointNotFound {
                id: endpoint_id.to_string(),
            })?;
        endpoint.last_run_at = Some(update.last_run_at);
        endpoint.failure_count = update.failure_count;
        endpoint.next_run_at = update.next_run_at;
        if update.clear_hints {
            endpoint.ai_hint_interval_ms = None;
            endpoint.ai_hint_next_run_at = None;
            endpoint.ai_hint_expires_at = None;
            endpoint.ai_hint_reason = None;
        }
        endpoint.locked_until = None;
        endpoint.updated_at = update.last_run_at;
        Ok(endpoint.clone())
    }

    async fn write_ai_hint(&self, id: Uuid, hint: AiHintWrite) -> Result<Endpoint> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })?;
        endpoint.ai_hint_interval_ms = hint.interval_ms;
        endpoint.ai_hint_next_run_at = hint.next_run_at;
        endpoint.ai_hint_expires_at = Some(hint.expires_at);
        endpoint.ai_hint_reason = hint.reason;
        Ok(endpoint.clone())
    }

    async fn clear_ai_hints(&self, id: Uuid) -> Result<Endpoint> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })?;
        endpoint.ai_hint_interval_ms = None;
        endpoint.ai_hint_next_run_at = None;
        endpoint.ai_hint_expires_at = None;
        endpoint.ai_hint_reason = None;
        Ok(endpoint.clone())
    }

    async fn set_paused_until(&self, id: Uuid, until: Option<DateTime<Utc>>) -> Result<Endpoint> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })?;
        endpoint.paused_until = until;
        Ok(endpoint.clone())
    }

    async fn reset_failure_count(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::EndpointNotFound { id: id.to_string() })?;
        endpoint.failure_count = 0;
        Ok(())
    }

    async fn get_usage(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<UsageSummary> {
        let inner = self.inner.lock().unwrap();
        let owned: Vec<Uuid> = inner
            .endpoints
            .values()
            .filter(|endpoint| endpoint.tenant_id == user_id)
            .map(|endpoint| endpoint.id)
            .collect();
        let run_count = inner
            .runs
            .iter()
            .filter(|run| owned.contains(&run.endpoint_id) && run.started_at >= since)
            .count() as i64;
        Ok(UsageSummary {
            endpoint_count: owned.len() as i64,
            run_count,
        })
    }
}

fn apply_finish(run: &mut Run, finish: &FinishRun) {
    run.status = finish.status;
    run.finished_at = Some(finish.finished_at);
    run.duration_ms = Some(finish.duration_ms);
    run.status_code = finish.status_code;
    run.response_body = finish.response_body.clone();
    run.error_message = finish.error_message.clone();
    run.error_details = finish.error_details.clone();
}

#[async_trait]
impl RunsRepo for InMemoryStore {
    async fn create(&self, new_run: NewRun) -> Result<Run> {
        let run = Run {
            id: Uuid::new_v4(),
            endpoint_id: new_run.endpoint_id,
            attempt: new_run.attempt,
            source: new_run.source,
            status: RunStatus::Running,
            started_at: new_run.started_at,
            finished_at: None,
            duration_ms: None,
            status_code: None,
            response_body: None,
            error_message: None,
            error_details: None,
        };
        self.inner.lock().unwrap().runs.push(run.clone());
        Ok(run)
    }

    async fn finish(&self, run_id: Uuid, outcome: FinishRun) -> Result<Run> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .runs
            .iter_mut()
            .find(|run| run.id == run_id)
            .ok_or_else(|| SchedulerError::RunNotFound {
                id: run_id.to_string(),
            })?;
        if run.status.is_terminal() {
            return Err(SchedulerError::RunAlreadyFinished {
                id: run_id.to_string(),
            });
        }
        apply_finish(run, &outcome);
        Ok(run.clone())
    }

    async fn list_runs(&self, filters: RunFilters) -> Result<Vec<Run>> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<Run> = inner
            .runs
            .iter()
            .filter(|run| filters.endpoint_id.map_or(true, |id| run.endpoint_id == id))
            .filter(|run| filters.status.map_or(true, |status| run.status == status))
            .filter(|run| filters.since.map_or(true, |since| run.started_at >= since))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let offset = filters.offset.max(0) as usize;
        let limit = if filters.limit > 0 {
            filters.limit as usize
        } else {
            runs.len()
        };
        Ok(runs.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_run_details(&self, run_id: Uuid) -> Result<Run> {
        self.inner
            .lock()
            .unwrap()
            .runs
            .iter()
            .find(|run| run.id == run_id)
            .cloned()
            .ok_or_else(|| SchedulerError::RunNotFound {
                id: run_id.to_string(),
            })
    }

    async fn get_health_summary(
        &self,
        endpoint_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<HealthSummary> {
        let inner = self.inner.lock().unwrap();
        let mut finished: Vec<&Run> = inner
            .runs
            .iter()
            .filter(|run| {
                run.endpoint_id == endpoint_id
                    && run.status.is_terminal()
                    && run.started_at >= since
            })
            .collect();
        finished.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));

        let success_count = finished
            .iter()
            .filter(|run| run.status == RunStatus::Success)
            .count() as i64;
        let failure_count = finished
            .iter()
            .filter(|run| run.status.counts_as_failure())
            .count() as i64;

        let durations: Vec<i64> = finished.iter().filter_map(|run| run.duration_ms).collect();
        let avg_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };

        let failure_streak = finished
            .iter()
            .take_while(|run| run.status.counts_as_failure())
            .count() as i64;

        Ok(HealthSummary {
            success_count,
            failure_count,
            avg_duration_ms,
            last_run_at: finished.first().and_then(|run| run.finished_at),
            last_run_status: finished.first().map(|run| run.status),
            failure_streak,
        })
    }

    async fn get_endpoints_with_recent_runs(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<Uuid> = inner
            .runs
            .iter()
            .filter(|run| run.started_at >= since)
            .map(|run| run.endpoint_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn get_latest_response(&self, endpoint_id: Uuid) -> Result<Option<ResponseSnapshot>> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::latest_snapshot_for(&inner, endpoint_id))
    }

    async fn get_response_history(
        &self,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<ResponseHistoryPage> {
        let inner = self.inner.lock().unwrap();
        let mut finished: Vec<&Run> = inner
            .runs
            .iter()
            .filter(|run| run.endpoint_id == endpoint_id && run.status.is_terminal())
            .collect();
        finished.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));

        let total = finished.len() as i64;
        let entries = finished
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|run| ResponseSnapshot {
                run_id: run.id,
                status: run.status,
                status_code: run.status_code,
                response_body: run.response_body.clone(),
                finished_at: run.finished_at,
            })
            .collect();

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
        let inner = self.inner.lock().unwrap();
        let mut siblings: Vec<SiblingSnapshot> = inner
            .endpoints
            .values()
            .filter(|e| e.job_id == Some(job_id) && e.id != exclude_endpoint_id)
            .map(|e| SiblingSnapshot {
                endpoint_id: e.id,
                name: e.name.clone(),
                baseline_cron: e.baseline_cron.clone(),
                baseline_interval_ms: e.baseline_interval_ms,
                next_run_at: e.next_run_at,
                paused_until: e.paused_until,
                ai_hint_interval_ms: e.ai_hint_interval_ms,
                ai_hint_next_run_at: e.ai_hint_next_run_at,
                ai_hint_expires_at: e.ai_hint_expires_at,
                latest: Self::latest_snapshot_for(&inner, e.id),
            })
            .collect();
        siblings.sort_by_key(|s| s.endpoint_id);
        Ok(siblings)
    }

    async fn cleanup_zombie_runs(&self, now: DateTime<Utc>, older_than_ms: i64) -> Result<u64> {
        let threshold = now - Duration::milliseconds(older_than_ms);
        let mut inner = self.inner.lock().unwrap();
        let mut reaped = 0;
        for run in inner
            .runs
            .iter_mut()
            .filter(|run| run.status == RunStatus::Running && run.started_at <= threshold)
        {
            run.status = RunStatus::Failed;
            run.finished_at = Some(now);
            run.duration_ms = Some((now - run.started_at).num_milliseconds());
            run.error_message = Some(format!(
                "zombie run reaped: still running after {older_than_ms}ms"
            ));
            reaped += 1;
        }
        Ok(reaped)
    }
}

#[async_trait]
impl SessionsRepo for InMemoryStore {
    async fn create(&self, session: NewSession) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4(),
            endpoint_id: session.endpoint_id,
            analyzed_at: session.analyzed_at,
            tool_calls: session.tool_calls,
            reasoning: session.reasoning,
            token_usage: session.token_usage,
            duration_ms: session.duration_ms,
            next_analysis_at: session.next_analysis_at,
            endpoint_failure_count: session.endpoint_failure_count,
        };
        self.inner.lock().unwrap().sessions.push(session.clone());
        Ok(session)
    }

    async fn get_last_session(&self, endpoint_id: Uuid) -> Result<Option<Session>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .iter()
            .filter(|session| session.endpoint_id == endpoint_id)
            .max_by_key(|session| session.analyzed_at)
            .cloned())
    }

    async fn get_recent_sessions(
        &self,
        endpoint_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<Session> = inner
            .sessions
            .iter()
            .filter(|session| session.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.analyzed_at.cmp(&a.analyzed_at));
        Ok(sessions
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn get_total_token_usage(
        &self,
        endpoint_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .iter()
            .filter(|session| session.endpoint_id == endpoint_id && session.analyzed_at >= since)
            .filter_map(|session| session.token_usage)
            .sum())
    }
}

#[async_trait]
impl QuotaGuard for InMemoryStore {
    async fn can_proceed(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let month_start = start_of_utc_month(now);
        let inner = self.inner.lock().unwrap();

        let Some(user) = inner.users.get(&user_id) else {
            return Ok(false);
        };
        let Ok(tier) = UserTier::from_str(&user.tier) else {
            return Ok(false);
        };

        let owned: Vec<Uuid> = inner
            .endpoints
            .values()
            .filter(|endpoint| endpoint.tenant_id == user_id)
            .map(|endpoint| endpoint.id)
            .collect();
        let used: i64 = inner
            .sessions
            .iter()
            .filter(|session| {
                owned.contains(&session.endpoint_id) && session.analyzed_at >= month_start
            })
            .filter_map(|session| session.token_usage)
            .sum();

        Ok(used < tier.monthly_token_limit())
    }

    async fn record_usage(&self, _user_id: Uuid, _tokens: i64) -> Result<()> {
        Ok(())
    }
}
