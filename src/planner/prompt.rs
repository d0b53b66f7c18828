//! Prompt assembly for the analysis model.

use chrono::{DateTime, Utc};

use crate::scheduling::models::{Endpoint, HealthSummary, Job};

pub struct AnalysisContext<'a> {
    pub now: DateTime<Utc>,
    pub job: Option<&'a Job>,
    pub endpoint: &'a Endpoint,
    pub health: &'a HealthSummary,
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
}

fn baseline_line(endpoint: &Endpoint) -> String {
    match (&endpoint.baseline_cron, endpoint.baseline_interval_ms) {
        (Some(expression), _) => format!("cron \"{expression}\""),
        (None, Some(interval)) => format!("every {interval}ms"),
        (None, None) => "unset".to_string(),
    }
}

fn hint_lines(endpoint: &Endpoint, now: DateTime<Utc>) -> String {
    if !endpoint.hint_is_fresh(now) {
        return "none".to_string();
    }
    let mut parts = Vec::new();
    if let Some(interval) = endpoint.ai_hint_interval_ms {
        parts.push(format!("interval {interval}ms"));
    }
    if let Some(at) = endpoint.ai_hint_next_run_at {
        parts.push(format!("one-shot at {}", at.to_rfc3339()));
    }
    if let Some(expires) = endpoint.ai_hint_expires_at {
        parts.push(format!("expires {}", expires.to_rfc3339()));
    }
    if let Some(reason) = &endpoint.ai_hint_reason {
        parts.push(format!("reason: {reason}"));
    }
    parts.join(", ")
}

fn constraint_lines(endpoint: &Endpoint) -> String {
    let mut parts = Vec::new();
    if let Some(min) = endpoint.min_interval_ms {
        parts.push(format!("min interval {min}ms"));
    }
    if let Some(max) = endpoint.max_interval_ms {
        parts.push(format!("max interval {max}ms"));
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}

/// Builds the system prompt for one analysis session: everything the
/// model needs to judge whether the schedule should bend, plus the rules
/// of engagement for its tools.
pub fn build_analysis_prompt(ctx: &AnalysisContext<'_>) -> String {
    let endpoint = ctx.endpoint;
    let health = ctx.health;

    let job_section = match ctx.job {
        Some(job) => format!(
            "Job: {}\nJob description: {}",
            job.name,
            job.description.as_deref().unwrap_or("(none)")
        ),
        None => "Job: (endpoint is not grouped under a job)".to_string(),
    };

    let pause_line = match endpoint.paused_until {
        Some(until) if until > ctx.now => format!("paused until {}", until.to_rfc3339()),
        _ => "not paused".to_string(),
    };

    format!(
        r#"You are the scheduling analyst for an adaptive HTTP job scheduler. You adjust when an endpoint runs by writing time-bounded hints; the scheduler itself enforces all hard constraints.

Current time: {now}

{job_section}
Endpoint: {name}
Endpoint description: {description}
Baseline schedule: {baseline}
Last run: {last_run}
Next run: {next_run}
Pause status: {pause}
Consecutive failure count: {failures}
Constraints: {constraints}
Active hints: {hints}

Health over the last 24 hours:
- successes: {successes}
- failures: {failure_total}
- average duration: {avg_duration}
- failure streak: {streak}
- last outcome: {last_outcome}

Decision framework, in order:
1. Stability first. If the endpoint is healthy and the baseline cadence fits the observed behavior, change nothing.
2. Intervene only on evidence. Use the read tools to inspect recent responses before writing any hint.
3. Failing endpoints deserve breathing room: consider a wider interval or a pause with a short TTL rather than hammering a broken target.
4. Hints are temporary. Pick the smallest TTL that covers the situation; the baseline reasserts itself when a hint expires.
5. Never try to enforce min/max constraints yourself; the scheduler clamps every hint.

You may call read tools (get_latest_response, get_response_history, get_sibling_latest_responses) any number of times, and write tools (propose_interval, propose_next_time, pause_until, clear_hints) as needed. When you are done you MUST call submit_analysis exactly once with your reasoning; nothing after it is processed."#,
        now = ctx.now.to_rfc3339(),
        job_section = job_section,
        name = endpoint.name,
        description = endpoint.description.as_deref().unwrap_or("(none)"),
        baseline = baseline_line(endpoint),
        last_run = format_time(endpoint.last_run_at),
        next_run = endpoint.next_run_at.to_rfc3339(),
        pause = pause_line,
        failures = endpoint.failure_count,
        constraints = constraint_lines(endpoint),
        hints = hint_lines(endpoint, ctx.now),
        successes = health.success_count,
        failure_total = health.failure_count,
        avg_duration = health
            .avg_duration_ms
            .map(|ms| format!("{ms:.0}ms"))
            .unwrap_or_else(|| "n/a".to_string()),
        streak = health.failure_streak,
        last_outcome = health
            .last_run_status
            .map(|status| status.to_string())
            .unwrap_or_else(|| "none".to_string()),
    )
}
