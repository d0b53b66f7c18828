//! The AI planner worker: finds endpoints with recent activity, decides
//! which are due for analysis, and drives the tool loop that lets the
//! model bend their schedules.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::llm::{ChatClient, ChatMessage, ChatRequest};
use super::prompt::{build_analysis_prompt, AnalysisContext};
use super::tools::{SubmitAnalysis, ToolOutcome, ToolRegistry};
use crate::scheduling::clock::Clock;
use crate::scheduling::error::Result;
use crate::scheduling::models::{Endpoint, NewSession, Session, ToolCallRecord};
use crate::scheduling::repository::{JobsRepo, QuotaGuard, RunsRepo, SessionsRepo};

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub analysis_interval_ms: u64,
    pub lookback_minutes: i64,
    /// Upper bound on chat rounds per analysis; the model is expected to
    /// terminate with `submit_analysis` well before this.
    pub max_tool_rounds: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            analysis_interval_ms: 300_000,
            lookback_minutes: 5,
            max_tool_rounds: 8,
        }
    }
}

/// Whether an endpoint should be analyzed now: first analysis, the
/// scheduled reanalysis time arriving, or new failures since the last
/// session's snapshot.
pub fn analysis_is_due(
    endpoint: &Endpoint,
    last_session: Option<&Session>,
    now: DateTime<Utc>,
) -> bool {
    let Some(session) = last_session else {
        return true;
    };
    if matches!(session.next_analysis_at, Some(at) if at <= now) {
        return true;
    }
    endpoint.failure_count > session.endpoint_failure_count.unwrap_or(0)
}

pub struct PlannerWorker {
    jobs: Arc<dyn JobsRepo>,
    runs: Arc<dyn RunsRepo>,
    sessions: Arc<dyn SessionsRepo>,
    quota: Arc<dyn QuotaGuard>,
    chat: Arc<dyn ChatClient>,
    clock: Arc<dyn Clock>,
    settings: PlannerSettings,
}

impl PlannerWorker {
    pub fn new(
        jobs: Arc<dyn JobsRepo>,
        runs: Arc<dyn RunsRepo>,
        sessions: Arc<dyn SessionsRepo>,
        quota: Arc<dyn QuotaGuard>,
        chat: Arc<dyn ChatClient>,
        clock: Arc<dyn Clock>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            jobs,
            runs,
            sessions,
            quota,
            chat,
            clock,
            settings,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            analysis_interval_ms = self.settings.analysis_interval_ms,
            lookback_minutes = self.settings.lookback_minutes,
            "AI planner worker started"
        );

        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(self.settings.analysis_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("AI planner worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Planner tick failed");
                    }
                }
            }
        }
    }

    /// One planning pass: discover candidates, analyze the due ones
    /// sequentially. A failed analysis never aborts the rest.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let since = now - Duration::minutes(self.settings.lookback_minutes);
        let candidates = self.runs.get_endpoints_with_recent_runs(since).await?;

        let mut analyzed = 0;
        for endpoint_id in candidates {
            match self.maybe_analyze(endpoint_id).await {
                Ok(true) => analyzed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(endpoint_id = %endpoint_id, error = %e, "Endpoint analysis failed");
                }
            }
        }
        Ok(analyzed)
    }

    async fn maybe_analyze(&self, endpoint_id: Uuid) -> Result<bool> {
        let endpoint = self.jobs.get_endpoint(endpoint_id).await?;
        let now = self.clock.now();
        let last_session = self.sessions.get_last_session(endpoint_id).await?;

        if !analysis_is_due(&endpoint, last_session.as_ref(), now) {
            return Ok(false);
        }

        if !self.quota.can_proceed(endpoint.tenant_id, now).await? {
            warn!(
                endpoint_id = %endpoint_id,
                tenant_id = %endpoint.tenant_id,
                "Monthly token quota exhausted, skipping analysis"
            );
            return Ok(false);
        }

        self.analyze(&endpoint).await?;
        Ok(true)
    }

    /// Runs one agentic analysis session and persists it, complete or
    /// not: a session row is written even when the model never calls
    /// `submit_analysis`.
    async fn analyze(&self, endpoint: &Endpoint) -> Result<Session> {
        let analyzed_at = self.clock.now();
        let wall = Instant::now();

        let health = self
            .runs
            .get_health_summary(endpoint.id, analyzed_at - Duration::hours(24))
            .await?;
        let job = match endpoint.job_id {
            Some(job_id) => self.jobs.get_job(job_id).await.ok(),
            None => None,
        };

        let prompt = build_analysis_prompt(&AnalysisContext {
            now: analyzed_at,
            job: job.as_ref(),
            endpoint,
            health: &health,
        });

        let registry = ToolRegistry::new(
            endpoint.id,
            endpoint.job_id,
            self.jobs.clone(),
            self.runs.clone(),
            self.clock.clone(),
        );

        let mut messages = vec![
            ChatMessage::system(prompt),
            ChatMessage::user("Analyze this endpoint now and submit your conclusion."),
        ];
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut token_usage: i64 = 0;
        let mut submitted: Option<SubmitAnalysis> = None;

        'rounds: for _ in 0..self.settings.max_tool_rounds {
            let completion = self
                .chat
                .complete(ChatRequest {
                    messages: messages.clone(),
                    tools: registry.definitions(),
                })
                .await
                .map_err(|e| crate::scheduling::error::SchedulerError::Dispatch {
                    message: format!("LLM call failed: {e}"),
                })?;

            token_usage += completion.total_tokens;
            let assistant = completion.message;
            let calls = assistant.tool_calls.clone().unwrap_or_default();
            messages.push(assistant);

            if calls.is_empty() {
                // Text-only turn: the model stopped driving tools without
                // terminating properly.
                break;
            }

            for call in calls {
                let args: serde_json::Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));

                match registry.execute(&call.function.name, &args).await {
                    Ok(ToolOutcome::Final(submit)) => {
                        records.push(ToolCallRecord {
                            tool: call.function.name.clone(),
                            args,
                            result: json!({ "accepted": true }),
                        });
                        submitted = Some(submit);
                        break 'rounds;
                    }
                    Ok(ToolOutcome::Result(result)) => {
                        debug!(
                            endpoint_id = %endpoint.id,
                            tool = %call.function.name,
                            "Tool executed"
                        );
                        messages.push(ChatMessage::tool_result(&call.id, result.to_string()));
                        records.push(ToolCallRecord {
                            tool: call.function.name.clone(),
                            args,
                            result,
                        });
                    }
                    Err(e) => {
                        let failure = json!({ "error": e.to_string() });
                        warn!(
                            endpoint_id = %endpoint.id,
                            tool = %call.function.name,
                            error = %e,
                            "Tool call rejected"
                        );
                        messages.push(ChatMessage::tool_result(&call.id, failure.to_string()));
                        records.push(ToolCallRecord {
                            tool: call.function.name.clone(),
                            args,
                            result: failure,
                        });
                    }
                }
            }
        }

        if submitted.is_none() {
            warn!(
                endpoint_id = %endpoint.id,
                "Analysis ended without submit_analysis, persisting partial session"
            );
        }

        let next_analysis_at = submitted
            .as_ref()
            .and_then(|submit| submit.next_analysis_in_ms)
            .map(|ms| analyzed_at + Duration::milliseconds(ms));
        let reasoning = submitted
            .map(|submit| submit.reasoning)
            .unwrap_or_else(|| "analysis ended without submit_analysis".to_string());

        let session = self
            .sessions
            .create(NewSession {
                endpoint_id: endpoint.id,
                analyzed_at,
                tool_calls: serde_json::to_value(&records)?,
                reasoning,
                token_usage: Some(token_usage),
                duration_ms: Some(wall.elapsed().as_millis() as i64),
                next_analysis_at,
                endpoint_failure_count: Some(endpoint.failure_count),
            })
            .await?;

        info!(
            endpoint_id = %endpoint.id,
            session_id = %session.id,
            token_usage,
            tool_calls = records.len(),
            "Analysis session persisted"
        );
        Ok(session)
    }
}
