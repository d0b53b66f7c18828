//! Endpoint-scoped tools exposed to the analysis model.
//!
//! Every registry is bound to one endpoint at construction; write tools
//! cannot reach anything else. Arguments are validated against the
//! declared schemas before execution, and dispatch is a plain match on the
//! tool name.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::planner::llm::ToolDefinition;
use crate::scheduling::clock::Clock;
use crate::scheduling::error::{Result, SchedulerError};
use crate::scheduling::models::{AiHintWrite, ResponseSnapshot};
use crate::scheduling::repository::{JobsRepo, RunsRepo};

/// Reanalysis window bounds for `submit_analysis.next_analysis_in_ms`.
pub const MIN_NEXT_ANALYSIS_MS: i64 = 300_000;
pub const MAX_NEXT_ANALYSIS_MS: i64 = 86_400_000;

const HISTORY_MAX_LIMIT: i64 = 10;
const BODY_PREVIEW_CHARS: usize = 1000;

/// Parsed terminal call. Ends the session; `reasoning` becomes the
/// canonical justification on the persisted row.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitAnalysis {
    pub reasoning: String,
    #[serde(default)]
    pub actions_taken: Option<Vec<String>>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub next_analysis_in_ms: Option<i64>,
}

/// What one tool invocation produced: a value to feed back to the model,
/// or the terminal analysis.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Result(Value),
    Final(SubmitAnalysis),
}

pub struct ToolRegistry {
    endpoint_id: Uuid,
    job_id: Option<Uuid>,
    jobs: Arc<dyn JobsRepo>,
    runs: Arc<dyn RunsRepo>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
struct ResponseHistoryArgs {
    #[serde(default = "default_history_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_history_limit() -> i64 {
    5
}

#[derive(Debug, Deserialize)]
struct ProposeIntervalArgs {
    interval_ms: i64,
    ttl_minutes: i64,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProposeNextTimeArgs {
    next_run_at_iso: String,
    ttl_minutes: i64,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PauseUntilArgs {
    until_iso: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClearHintsArgs {
    reason: String,
}

impl ToolRegistry {
    pub fn new(
        endpoint_id: Uuid,
        job_id: Option<Uuid>,
        jobs: Arc<dyn JobsRepo>,
        runs: Arc<dyn RunsRepo>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            endpoint_id,
            job_id,
            jobs,
            runs,
            clock,
        }
    }

    /// Tool declarations sent with every chat request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                "get_latest_response",
                "Get the most recent finished run's response body and status",
                json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                }),
            ),
            ToolDefinition::function(
                "get_response_history",
                "List recent finished runs newest-first with response bodies truncated to 1000 characters",
                json!({
                    "type": "object",
                    "properties": {
                        "limit": {
                            "type": "integer",
                            "minimum": 1,
                            "maximum": HISTORY_MAX_LIMIT,
                            "default": 5,
                            "description": "Number of runs to return"
                        },
                        "offset": {
                            "type": "integer",
                            "minimum": 0,
                            "default": 0,
                            "description": "Number of runs to skip"
                        }
                    },
                    "required": []
                }),
            ),
            ToolDefinition::function(
                "get_sibling_latest_responses",
                "For each other endpoint in the same job, get its latest response plus schedule and active-hint metadata",
                json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                }),
            ),
            ToolDefinition::function(
                "propose_interval",
                "Set a time-bounded interval hint; the schedule follows it until the hint expires",
                json!({
                    "type": "object",
                    "properties": {
                        "interval_ms": {
                            "type": "integer",
                            "minimum": 1000,
                            "description": "Desired interval between runs in milliseconds"
                        },
                        "ttl_minutes": {
                            "type": "integer",
                            "minimum": 1,
                            "description": "How long the hint stays active"
                        },
                        "reason": {
                            "type": "string",
                            "description": "Why this interval fits the observed behavior"
                        }
                    },
                    "required": ["interval_ms", "ttl_minutes"]
                }),
            ),
            ToolDefinition::function(
                "propose_next_time",
                "Set a one-shot hint for a specific next run time",
                json!({
                    "type": "object",
                    "properties": {
                        "next_run_at_iso": {
                            "type": "string",
                            "description": "RFC 3339 timestamp for the next run"
                        },
                        "ttl_minutes": {
                            "type": "integer",
                            "minimum": 1,
                            "description": "How long the hint stays active"
                        },
                        "reason": {
                            "type": "string",
                            "description": "Why this time fits the observed behavior"
                        }
                    },
                    "required": ["next_run_at_iso", "ttl_minutes"]
                }),
            ),
            ToolDefinition::function(
                "pause_until",
                "Pause the endpoint until the given time, or resume it with null",
                json!({
                    "type": "object",
                    "properties": {
                        "until_iso": {
                            "type": ["string", "null"],
                            "description": "RFC 3339 timestamp to pause until, or null to resume"
                        },
                        "reason": {
                            "type": "string",
                            "description": "Why the endpoint should pause or resume"
                        }
                    },
                    "required": ["until_iso"]
                }),
            ),
            ToolDefinition::function(
                "clear_hints",
                "Remove all active hints and return to the baseline schedule",
                json!({
                    "type": "object",
                    "properties": {
                        "reason": {
                            "type": "string",
                            "description": "Why the hints should be removed"
                        }
                    },
                    "required": ["reason"]
                }),
            ),
            ToolDefinition::function(
                "submit_analysis",
                "Finish the analysis. Must be called exactly once, after any other tools",
                json!({
                    "type": "object",
                    "properties": {
                        "reasoning": {
                            "type": "string",
                            "description": "Justification for the decisions made in this session"
                        },
                        "actions_taken": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Summary of the write tools used"
                        },
                        "confidence": {
                            "type": "number",
                            "minimum": 0.0,
                            "maximum": 1.0,
                            "description": "Confidence in the decisions"
                        },
                        "next_analysis_in_ms": {
                            "type": "integer",
                            "minimum": MIN_NEXT_ANALYSIS_MS,
                            "maximum": MAX_NEXT_ANALYSIS_MS,
                            "description": "When to analyze this endpoint again"
                        }
                    },
                    "required": ["reasoning"]
                }),
            ),
        ]
    }

    /// Validates and runs one tool call. Argument errors come back as
    /// `InvalidRequest` so the driver can surface them to the model.
    pub async fn execute(&self, name: &str, args: &Value) -> Result<ToolOutcome> {
        match name {
            "get_latest_response" => self.get_latest_response().await,
            "get_response_history" => self.get_response_history(args).await,
            "get_sibling_latest_responses" => self.get_sibling_latest_responses().await,
            "propose_interval" => self.propose_interval(args).await,
            "propose_next_time" => self.propose_next_time(args).await,
            "pause_until" => self.pause_until(args).await,
            "clear_hints" => self.clear_hints(args).await,
            "submit_analysis" => {
                let mut submit: SubmitAnalysis = parse_args(args)?;
                if submit.reasoning.trim().is_empty() {
                    return Err(SchedulerError::InvalidRequest {
                        message: "submit_analysis.reasoning must not be empty".to_string(),
                    });
                }
                // The reanalysis window is clamped into its allowed range
                // instead of bouncing the terminal call back to the model.
                submit.next_analysis_in_ms = submit
                    .next_analysis_in_ms
                    .map(|ms| ms.clamp(MIN_NEXT_ANALYSIS_MS, MAX_NEXT_ANALYSIS_MS));
                Ok(ToolOutcome::Final(submit))
            }
            other => Err(SchedulerError::InvalidRequest {
                message: format!("unknown tool: {other}"),
            }),
        }
    }

    async fn get_latest_response(&self) -> Result<ToolOutcome> {
        let latest = self.runs.get_latest_response(self.endpoint_id).await?;
        Ok(ToolOutcome::Result(match latest {
            Some(snapshot) => json!({
                "found": true,
                "responseBody": snapshot.response_body,
                "timestamp": snapshot.finished_at,
                "status": snapshot.status,
                "statusCode": snapshot.status_code,
            }),
            None => json!({ "found": false }),
        }))
    }

    async fn get_response_history(&self, args: &Value) -> Result<ToolOutcome> {
        let args: ResponseHistoryArgs = parse_args(args)?;
        if !(1..=HISTORY_MAX_LIMIT).contains(&args.limit) {
            return Err(SchedulerError::InvalidRequest {
                message: format!("limit must be in [1, {HISTORY_MAX_LIMIT}], got {}", args.limit),
            });
        }
        if args.offset < 0 {
            return Err(SchedulerError::InvalidRequest {
                message: format!("offset must be non-negative, got {}", args.offset),
            });
        }

        let page = self
            .runs
            .get_response_history(self.endpoint_id, args.limit, args.offset)
            .await?;

        let entries: Vec<Value> = page.entries.iter().map(snapshot_preview).collect();
        Ok(ToolOutcome::Result(json!({
            "entries": entries,
            "total": page.total,
            "limit": page.limit,
            "offset": page.offset,
            "hasMore": page.offset + (page.entries.len() as i64) < page.total,
        })))
    }

    async fn get_sibling_latest_responses(&self) -> Result<ToolOutcome> {
        let Some(job_id) = self.job_id else {
            return Ok(ToolOutcome::Result(json!({ "siblings": [] })));
        };

        let siblings = self
            .runs
            .get_sibling_latest_responses(job_id, self.endpoint_id)
            .await?;

        let entries: Vec<Value> = siblings
            .iter()
            .map(|sibling| {
                json!({
                    "endpointId": sibling.endpoint_id,
                    "name": sibling.name,
                    "baselineCron": sibling.baseline_cron,
                    "baselineIntervalMs": sibling.baseline_interval_ms,
                    "nextRunAt": sibling.next_run_at,
                    "pausedUntil": sibling.paused_until,
                    "aiHintIntervalMs": sibling.ai_hint_interval_ms,
                    "aiHintNextRunAt": sibling.ai_hint_next_run_at,
                    "aiHintExpiresAt": sibling.ai_hint_expires_at,
                    "latest": sibling.latest.as_ref().map(snapshot_preview),
                })
            })
            .collect();

        Ok(ToolOutcome::Result(json!({ "siblings": entries })))
    }

    async fn propose_interval(&self, args: &Value) -> Result<ToolOutcome> {
        let args: ProposeIntervalArgs = parse_args(args)?;
        if args.interval_ms < 1000 {
            return Err(SchedulerError::InvalidRequest {
                message: format!("interval_ms must be at least 1000, got {}", args.interval_ms),
            });
        }
        if args.ttl_minutes < 1 {
            return Err(SchedulerError::InvalidRequest {
                message: format!("ttl_minutes must be at least 1, got {}", args.ttl_minutes),
            });
        }

        let now = self.clock.now();
        let expires_at = now + Duration::minutes(args.ttl_minutes);
        self.jobs
            .write_ai_hint(
                self.endpoint_id,
                AiHintWrite {
                    interval_ms: Some(args.interval_ms),
                    next_run_at: None,
                    expires_at,
                    reason: args.reason,
                },
            )
            .await?;

        // Nudge so the new cadence takes effect at the next tick instead of
        // waiting out the previously planned gap.
        let nudge_to = now + Duration::milliseconds(args.interval_ms);
        self.jobs
            .set_next_run_at_if_earlier(self.endpoint_id, nudge_to)
            .await?;

        Ok(ToolOutcome::Result(json!({
            "applied": true,
            "intervalMs": args.interval_ms,
            "expiresAt": expires_at,
        })))
    }

    async fn propose_next_time(&self, args: &Value) -> Result<ToolOutcome> {
        let args: ProposeNextTimeArgs = parse_args(args)?;
        if args.ttl_minutes < 1 {
            return Err(SchedulerError::InvalidRequest {
                message: format!("ttl_minutes must be at least 1, got {}", args.ttl_minutes),
            });
        }
        let next_run_at = parse_iso(&args.next_run_at_iso)?;

        let now = self.clock.now();
        let expires_at = now + Duration::minutes(args.ttl_minutes);
        self.jobs
            .write_ai_hint(
                self.endpoint_id,
                AiHintWrite {
                    interval_ms: None,
                    next_run_at: Some(next_run_at),
                    expires_at,
                    reason: args.reason,
                },
            )
            .await?;
        self.jobs
            .set_next_run_at_if_earlier(self.endpoint_id, next_run_at)
            .await?;

        Ok(ToolOutcome::Result(json!({
            "applied": true,
            "nextRunAt": next_run_at,
            "expiresAt": expires_at,
        })))
    }

    async fn pause_until(&self, args: &Value) -> Result<ToolOutcome> {
        let args: PauseUntilArgs = parse_args(args)?;
        let until = match &args.until_iso {
            Some(iso) => Some(parse_iso(iso)?),
            None => None,
        };

        self.jobs.set_paused_until(self.endpoint_id, until).await?;
        Ok(ToolOutcome::Result(json!({
            "applied": true,
            "pausedUntil": until,
            "reason": args.reason,
        })))
    }

    async fn clear_hints(&self, args: &Value) -> Result<ToolOutcome> {
        let args: ClearHintsArgs = parse_args(args)?;
        self.jobs.clear_ai_hints(self.endpoint_id).await?;
        Ok(ToolOutcome::Result(json!({
            "applied": true,
            "reason": args.reason,
        })))
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T> {
    serde_json::from_value(args.clone()).map_err(|e| SchedulerError::InvalidRequest {
        message: format!("invalid tool arguments: {e}"),
    })
}

fn parse_iso(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::InvalidRequest {
            message: format!("invalid RFC 3339 timestamp '{value}': {e}"),
        })
}

/// Run snapshot with the body rendered as text and truncated for prompt
/// budget reasons.
fn snapshot_preview(snapshot: &ResponseSnapshot) -> Value {
    let body_preview = snapshot.response_body.as_ref().map(|body| {
        let rendered = body.to_string();
        if rendered.chars().count() > BODY_PREVIEW_CHARS {
            let truncated: String = rendered.chars().take(BODY_PREVIEW_CHARS).collect();
            format!("{truncated}…")
        } else {
            rendered
        }
    });

    json!({
        "runId": snapshot.run_id,
        "status": snapshot.status,
        "statusCode": snapshot.status_code,
        "finishedAt": snapshot.finished_at,
        "responseBody": body_preview,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_analysis_args_parse_with_defaults() {
        let submit: SubmitAnalysis = parse_args(&json!({
            "reasoning": "stable, widened the interval"
        }))
        .unwrap();
        assert_eq!(submit.reasoning, "stable, widened the interval");
        assert!(submit.next_analysis_in_ms.is_none());
        assert!(submit.confidence.is_none());
    }

    #[test]
    fn history_args_reject_out_of_range_limits() {
        let parsed: ResponseHistoryArgs = parse_args(&json!({})).unwrap();
        assert_eq!(parsed.limit, 5);
        assert_eq!(parsed.offset, 0);

        let parsed: ResponseHistoryArgs = parse_args(&json!({"limit": 99})).unwrap();
        assert!(!(1..=HISTORY_MAX_LIMIT).contains(&parsed.limit));
    }

    #[test]
    fn iso_parsing_accepts_offsets_and_rejects_garbage() {
        let parsed = parse_iso("2025-06-01T12:00:00+02:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-06-01T10:00:00+00:00");
        assert!(parse_iso("next tuesday").is_err());
    }

    #[test]
    fn body_previews_truncate_at_one_thousand_chars() {
        let long = "x".repeat(3000);
        let snapshot = ResponseSnapshot {
            run_id: Uuid::new_v4(),
            status: crate::scheduling::models::RunStatus::Success,
            status_code: Some(200),
            response_body: Some(json!({ "payload": long })),
            finished_at: Some(Utc::now()),
        };

        let preview = snapshot_preview(&snapshot);
        let body = preview["responseBody"].as_str().unwrap();
        assert!(body.chars().count() <= BODY_PREVIEW_CHARS + 1);
    }
}
