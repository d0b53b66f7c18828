//! Property-based tests for the governor.
//!
//! These pin the scheduling laws under randomly generated endpoint state:
//! totality, pause dominance, clamp membership, backoff monotonicity, and
//! hint override behavior.

use chrono::{DateTime, Duration, TimeZone, Utc};
use cronicorn::scheduling::governor::{effective_interval_ms, plan_next_run};
use cronicorn::scheduling::models::{Endpoint, HttpMethod, ScheduleSource};
use cronicorn::scheduling::StandardCron;
use proptest::prelude::*;
use uuid::Uuid;

fn base_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn endpoint_with_interval(interval_ms: i64, now: DateTime<Utc>) -> Endpoint {
    Endpoint {
        id: Uuid::new_v4(),
        job_id: None,
        tenant_id: Uuid::new_v4(),
        name: "generated".to_string(),
        description: None,
        url: "https://example.com".to_string(),
        method: HttpMethod::Get,
        headers: None,
        body_json: None,
        timeout_ms: None,
        max_execution_time_ms: None,
        max_response_size_kb: None,
        baseline_cron: None,
        baseline_interval_ms: Some(interval_ms),
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

prop_compose! {
    fn arb_interval_ms()(interval in 1000_i64..86_400_000) -> i64 {
        interval
    }
}

prop_compose! {
    fn arb_failure_count()(count in 0_i32..20) -> i32 {
        count
    }
}

prop_compose! {
    fn arb_now()(offset_s in 0_i64..1_000_000) -> DateTime<Utc> {
        base_instant() + Duration::seconds(offset_s)
    }
}

prop_compose! {
    fn arb_endpoint()(
        now in arb_now(),
        interval in arb_interval_ms(),
        failures in arb_failure_count(),
        last_run_ago_s in proptest::option::of(0_i64..3600),
        hint_interval in proptest::option::of(1000_i64..3_600_000),
        hint_oneshot_in_s in proptest::option::of(-3600_i64..3600),
        hint_expires_in_s in proptest::option::of(-3600_i64..3600),
        paused_in_s in proptest::option::of(-3600_i64..3600),
        clamp in proptest::option::of((1000_i64..600_000, 600_000_i64..7_200_000)),
    ) -> (DateTime<Utc>, Endpoint) {
        let mut endpoint = endpoint_with_interval(interval, now);
        endpoint.failure_count = failures;
        endpoint.last_run_at = last_run_ago_s.map(|s| now - Duration::seconds(s));
        endpoint.ai_hint_interval_ms = hint_interval;
        endpoint.ai_hint_next_run_at = hint_oneshot_in_s.map(|s| now + Duration::seconds(s));
        endpoint.ai_hint_expires_at = hint_expires_in_s.map(|s| now + Duration::seconds(s));
        endpoint.paused_until = paused_in_s.map(|s| now + Duration::seconds(s));
        if let Some((min, max)) = clamp {
            endpoint.min_interval_ms = Some(min);
            endpoint.max_interval_ms = Some(max);
        }
        (now, endpoint)
    }
}

proptest! {
    /// The governor is total: any valid endpoint yields a time at or after
    /// `now`, under one of the closed set of sources.
    #[test]
    fn plan_is_total_and_never_in_the_past((now, endpoint) in arb_endpoint()) {
        let planned = plan_next_run(now, &endpoint, &StandardCron);
        prop_assert!(planned.next_run_at >= now);
        // Exhaustive by type; spelled out to pin the enumeration.
        prop_assert!(matches!(
            planned.source,
            ScheduleSource::Paused
                | ScheduleSource::AiOneshot
                | ScheduleSource::AiInterval
                | ScheduleSource::BaselineCron
                | ScheduleSource::BaselineInterval
                | ScheduleSource::ClampedMin
                | ScheduleSource::ClampedMax
        ));
    }

    /// A future pause wins over every other field.
    #[test]
    fn pause_dominates((now, mut endpoint) in arb_endpoint(), pause_s in 1_i64..7200) {
        let paused_until = now + Duration::seconds(pause_s);
        endpoint.paused_until = Some(paused_until);

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        prop_assert_eq!(planned.next_run_at, paused_until);
        prop_assert_eq!(planned.source, ScheduleSource::Paused);
    }

    /// Replanning with identical inputs gives identical answers.
    #[test]
    fn planning_is_idempotent((now, endpoint) in arb_endpoint()) {
        let first = plan_next_run(now, &endpoint, &StandardCron);
        let second = plan_next_run(now, &endpoint, &StandardCron);
        prop_assert_eq!(first, second);
    }

    /// With both guardrails set and reachable, the result stays inside
    /// them, and clamp sources appear exactly when a clamp fired.
    #[test]
    fn clamps_bound_the_result(
        (now, mut endpoint) in arb_endpoint(),
        min in 1000_i64..600_000,
        max in 600_000_i64..7_200_000,
        last_run_ago_s in 0_i64..600,
    ) {
        endpoint.paused_until = None;
        endpoint.min_interval_ms = Some(min);
        endpoint.max_interval_ms = Some(max);
        let last_run_at = now - Duration::seconds(last_run_ago_s);
        endpoint.last_run_at = Some(last_run_at);

        let min_at = now + Duration::milliseconds(min);
        let max_at = last_run_at + Duration::milliseconds(max);

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        match planned.source {
            ScheduleSource::ClampedMin => prop_assert_eq!(planned.next_run_at, min_at),
            ScheduleSource::ClampedMax => prop_assert_eq!(planned.next_run_at, max_at.max(now)),
            ScheduleSource::Paused => prop_assert!(false, "pause was cleared"),
            _ => {
                prop_assert!(planned.next_run_at >= min_at);
                prop_assert!(planned.next_run_at <= max_at);
            }
        }
    }

    /// More failures never pull an interval baseline earlier, and the
    /// offset caps at 32x.
    #[test]
    fn backoff_is_monotone_and_capped(
        now in arb_now(),
        interval in arb_interval_ms(),
        failures in 0_i32..12,
    ) {
        let mut endpoint = endpoint_with_interval(interval, now);
        endpoint.last_run_at = Some(now);

        endpoint.failure_count = failures;
        let at_k = plan_next_run(now, &endpoint, &StandardCron).next_run_at;

        endpoint.failure_count = failures + 1;
        let at_k_plus_one = plan_next_run(now, &endpoint, &StandardCron).next_run_at;

        prop_assert!(at_k_plus_one >= at_k);
        prop_assert!(at_k - now <= Duration::milliseconds(interval.saturating_mul(32)));
        prop_assert!(effective_interval_ms(interval, failures) <= interval.saturating_mul(32));
    }

    /// A fresh interval hint is applied raw; failure backoff does not
    /// stretch it.
    #[test]
    fn fresh_interval_hint_ignores_backoff(
        now in arb_now(),
        interval in 60_000_i64..600_000,
        hint in 1000_i64..60_000,
        failures in 1_i32..10,
    ) {
        let mut endpoint = endpoint_with_interval(interval, now);
        endpoint.last_run_at = Some(now);
        endpoint.failure_count = failures;
        endpoint.ai_hint_interval_ms = Some(hint);
        endpoint.ai_hint_expires_at = Some(now + Duration::hours(24));

        let planned = plan_next_run(now, &endpoint, &StandardCron);
        prop_assert_eq!(planned.next_run_at, now + Duration::milliseconds(hint));
        prop_assert_eq!(planned.source, ScheduleSource::AiInterval);
    }

    /// Among live candidates the earliest wins.
    #[test]
    fn earliest_candidate_wins(
        now in arb_now(),
        interval in 60_000_i64..600_000,
        oneshot_in_s in 1_i64..30,
    ) {
        let mut endpoint = endpoint_with_interval(interval, now);
        endpoint.last_run_at = Some(now);
        endpoint.ai_hint_next_run_at = Some(now + Duration::seconds(oneshot_in_s));
        endpoint.ai_hint_expires_at = Some(now + Duration::hours(24));

        // The one-shot lands strictly before the baseline interval.
        let planned = plan_next_run(now, &endpoint, &StandardCron);
        prop_assert_eq!(planned.next_run_at, now + Duration::seconds(oneshot_in_s));
        prop_assert_eq!(planned.source, ScheduleSource::AiOneshot);
    }
}
