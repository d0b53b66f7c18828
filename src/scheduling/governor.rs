use chrono::{DateTime, Duration, Utc};

use super::cron::Cron;
use super::models::{Endpoint, ScheduleSource, MAX_BACKOFF_EXPONENT};

/// Outcome of one governor evaluation: when to run next and which rule
/// produced that time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRun {
    pub next_run_at: DateTime<Utc>,
    pub source: ScheduleSource,
}

/// Selection order when candidate times tie. Lower wins.
fn tie_priority(source: ScheduleSource) -> u8 {
    match source {
        ScheduleSource::AiOneshot => 0,
        ScheduleSource::AiInterval => 1,
        ScheduleSource::BaselineCron => 2,
        ScheduleSource::BaselineInterval => 3,
        // Never candidates; assigned by clamp/pause handling.
        ScheduleSource::Paused | ScheduleSource::ClampedMin | ScheduleSource::ClampedMax => u8::MAX,
    }
}

/// Baseline interval after failure backoff: doubles per failure, capped
/// at 2^MAX_BACKOFF_EXPONENT (32x).
pub fn effective_interval_ms(baseline_interval_ms: i64, failure_count: i32) -> i64 {
    let exponent = (failure_count.max(0) as u32).min(MAX_BACKOFF_EXPONENT);
    baseline_interval_ms.saturating_mul(1_i64 << exponent)
}

/// Plans the next run for an endpoint. Total and referentially
/// transparent: same inputs, same answer, no side effects.
///
/// Rule order: pause dominance, then the earliest of the baseline and any
/// fresh AI candidates, then min/max clamps, then a floor at `now`.
pub fn plan_next_run(now: DateTime<Utc>, endpoint: &Endpoint, cron: &dyn Cron) -> PlannedRun {
    if let Some(paused_until) = endpoint.paused_until {
        if paused_until > now {
            return PlannedRun {
                next_run_at: paused_until,
                source: ScheduleSource::Paused,
            };
        }
    }

    let anchor = match endpoint.last_run_at {
        Some(last) if last > now => last,
        _ => now,
    };

    let mut candidates: Vec<(DateTime<Utc>, ScheduleSource)> = Vec::with_capacity(3);

    if let Some(expression) = &endpoint.baseline_cron {
        match cron.next_fire(expression, now) {
            Ok(at) => candidates.push((at, ScheduleSource::BaselineCron)),
            // Validation rejects bad expressions at creation; if one slips
            // through, retry in a minute rather than hot-looping.
            Err(_) => candidates.push((now + Duration::minutes(1), ScheduleSource::BaselineCron)),
        }
    } else if let Some(interval) = endpoint.baseline_interval_ms {
        let backed_off = effective_interval_ms(interval, endpoint.failure_count);
        candidates.push((
            anchor + Duration::milliseconds(backed_off),
            ScheduleSource::BaselineInterval,
        ));
    }

    if endpoint.hint_is_fresh(now) {
        if let Some(interval) = endpoint.ai_hint_interval_ms {
            // A fresh hint interval is applied raw; failure backoff never
            // stretches it.
            candidates.push((
                anchor + Duration::milliseconds(interval),
                ScheduleSource::AiInterval,
            ));
        }
        if let Some(at) = endpoint.ai_hint_next_run_at {
            candidates.push((at, ScheduleSource::AiOneshot));
        }
    }

    let (mut chosen_at, mut source) = candidates
        .into_iter()
        .min_by_key(|(at, source)| (*at, tie_priority(*source)))
        // Unreachable for validated rows (one baseline is always set);
        // a bare row retries in a minute.
        .unwrap_or((now + Duration::minutes(1), ScheduleSource::BaselineInterval));

    if let Some(min_interval) = endpoint.min_interval_ms {
        let min_at = now + Duration::milliseconds(min_interval);
        if chosen_at < min_at {
            chosen_at = min_at;
            source = ScheduleSource::ClampedMin;
        }
    }
    if source != ScheduleSource::ClampedMin {
        if let (Some(max_interval), Some(last_run_at)) =
            (endpoint.max_interval_ms, endpoint.last_run_at)
        {
            let max_at = last_run_at + Duration::milliseconds(max_interval);
            if chosen_at > max_at {
                chosen_at = max_at;
                source = ScheduleSource::ClampedMax;
            }
        }
    }

    if chosen_at < now {
        chosen_at = now;
    }

    PlannedRun {
        next_run_at: chosen_at,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::cron::StandardCron;
    use crate::scheduling::models::{Endpoint, HttpMethod};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn endpoint_at(now: DateTime<Utc>) -> Endpoint {
        Endpoint {
            id: Uuid::new_v4(),
            job_id: None,
            tenant_id: Uuid::new_v4(),
            name: "probe".to_string(),
            description: None,
            url: "https://example.com".to_string(),
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

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn pause_overrides_every_other_source() {
        let now = at(0, 0, 0);
        let mut endpoint = endpoint_at(now);
        endpoint.ai_hint_next_run_at = Some(at(0, 1, 0));
        endpoint.ai_hint_expires_at = Some(at(1, 0, 0));
        endpoint.paused_until = Some(at(0, 10, 0));

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        assert_eq!(planned.next_run_at, at(0, 10, 0));
        assert_eq!(planned.source, ScheduleSource::Paused);
    }

    #[test]
    fn elapsed_pause_is_ignored() {
        let now = at(0, 10, 0);
        let mut endpoint = endpoint_at(now);
        endpoint.paused_until = Some(at(0, 5, 0));

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        assert_eq!(planned.source, ScheduleSource::BaselineInterval);
    }

    #[test]
    fn interval_baseline_backs_off_exponentially() {
        let now = at(0, 0, 10);
        let mut endpoint = endpoint_at(now);
        endpoint.failure_count = 3;
        endpoint.last_run_at = Some(now);

        // 60s * 2^3 = 8 minutes.
        let planned = plan_next_run(now, &endpoint, &StandardCron);
        assert_eq!(planned.next_run_at, at(0, 8, 10));
        assert_eq!(planned.source, ScheduleSource::BaselineInterval);
    }

    #[test]
    fn backoff_caps_at_thirty_two_times() {
        assert_eq!(effective_interval_ms(60_000, 5), 60_000 * 32);
        assert_eq!(effective_interval_ms(60_000, 9), 60_000 * 32);
        assert_eq!(effective_interval_ms(60_000, 0), 60_000);
    }

    #[test]
    fn fresh_interval_hint_bypasses_backoff() {
        let now = at(0, 0, 10);
        let mut endpoint = endpoint_at(now);
        endpoint.failure_count = 3;
        endpoint.last_run_at = Some(now);
        endpoint.ai_hint_interval_ms = Some(120_000);
        endpoint.ai_hint_expires_at = Some(at(12, 0, 0));

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        assert_eq!(planned.next_run_at, at(0, 2, 10));
        assert_eq!(planned.source, ScheduleSource::AiInterval);
    }

    #[test]
    fn stale_hint_is_invisible() {
        let now = at(1, 0, 0);
        let mut endpoint = endpoint_at(now);
        endpoint.ai_hint_interval_ms = Some(1_000);
        endpoint.ai_hint_expires_at = Some(at(0, 30, 0));

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        assert_eq!(planned.source, ScheduleSource::BaselineInterval);
    }

    #[test]
    fn earliest_candidate_wins_and_ties_prefer_oneshot() {
        let now = at(0, 0, 0);
        let mut endpoint = endpoint_at(now);
        endpoint.ai_hint_expires_at = Some(at(12, 0, 0));
        // Oneshot at the same instant the interval hint would produce.
        endpoint.ai_hint_interval_ms = Some(30_000);
        endpoint.ai_hint_next_run_at = Some(at(0, 0, 30));

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        assert_eq!(planned.next_run_at, at(0, 0, 30));
        assert_eq!(planned.source, ScheduleSource::AiOneshot);
    }

    #[test]
    fn cron_baseline_uses_next_fire() {
        let now = at(0, 0, 30);
        let mut endpoint = endpoint_at(now);
        endpoint.baseline_interval_ms = None;
        endpoint.baseline_cron = Some("*/5 * * * *".to_string());

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        assert_eq!(planned.next_run_at, at(0, 5, 0));
        assert_eq!(planned.source, ScheduleSource::BaselineCron);
    }

    #[test]
    fn min_clamp_fires_and_tags_source() {
        let now = at(0, 0, 0);
        let mut endpoint = endpoint_at(now);
        endpoint.ai_hint_next_run_at = Some(at(0, 0, 5));
        endpoint.ai_hint_expires_at = Some(at(12, 0, 0));
        endpoint.min_interval_ms = Some(30_000);

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        assert_eq!(planned.next_run_at, at(0, 0, 30));
        assert_eq!(planned.source, ScheduleSource::ClampedMin);
    }

    #[test]
    fn max_clamp_fires_and_tags_source() {
        let now = at(0, 0, 0);
        let mut endpoint = endpoint_at(now);
        endpoint.last_run_at = Some(now);
        endpoint.failure_count = 5;
        endpoint.max_interval_ms = Some(300_000);

        // Backoff wants 32 minutes; the guardrail holds it to 5.
        let planned = plan_next_run(now, &endpoint, &StandardCron);
        assert_eq!(planned.next_run_at, at(0, 5, 0));
        assert_eq!(planned.source, ScheduleSource::ClampedMax);
    }

    #[test]
    fn result_never_precedes_now() {
        let now = at(2, 0, 0);
        let mut endpoint = endpoint_at(now);
        endpoint.ai_hint_next_run_at = Some(at(1, 0, 0));
        endpoint.ai_hint_expires_at = Some(at(12, 0, 0));

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        assert!(planned.next_run_at >= now);
    }

    #[test]
    fn replanning_with_same_inputs_is_stable() {
        let now = at(0, 0, 10);
        let mut endpoint = endpoint_at(now);
        endpoint.failure_count = 2;
        endpoint.last_run_at = Some(at(0, 0, 0));

        let first = plan_next_run(now, &endpoint, &StandardCron);
        let second = plan_next_run(now, &endpoint, &StandardCron);
        assert_eq!(first, second);
    }
}
