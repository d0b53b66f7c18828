//! Planner worker tests: due filtering, the agentic tool loop, quota
//! gating, and session persistence, all against the in-memory
//! repositories and a scripted chat client.

use chrono::{DateTime, Duration, TimeZone, Utc};
use cronicorn::planner::{MockChatClient, PlannerSettings, PlannerWorker};
use cronicorn::scheduling::models::{
    AfterRunUpdate, CreateEndpointRequest, FinishRun, HttpMethod, NewRun, NewSession, RunStatus,
    ScheduleSource,
};
use cronicorn::scheduling::repository::{InMemoryStore, JobsRepo, RunsRepo, SessionsRepo};
use cronicorn::scheduling::{Clock, ManualClock};
use cronicorn::HeaderCipher;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const TEST_SECRET: &str = "test-secret-0123456789abcdef0123456789";
const TOKENS_PER_TURN: i64 = 100;

struct TestEnv {
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
    chat: Arc<MockChatClient>,
    worker: PlannerWorker,
    tenant_id: Uuid,
}

fn start_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn test_env(tier: &str) -> TestEnv {
    let cipher = Arc::new(HeaderCipher::new(TEST_SECRET).unwrap());
    let store = Arc::new(InMemoryStore::new(cipher));
    let clock = Arc::new(ManualClock::new(start_instant()));
    let chat = Arc::new(MockChatClient::new(TOKENS_PER_TURN));

    let worker = PlannerWorker::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        chat.clone(),
        clock.clone(),
        PlannerSettings::default(),
    );

    let tenant_id = Uuid::new_v4();
    store.insert_user(tenant_id, "owner@example.com", tier);

    TestEnv {
        store,
        clock,
        chat,
        worker,
        tenant_id,
    }
}

async fn seeded_endpoint(env: &TestEnv) -> Uuid {
    let endpoint = env
        .store
        .add_endpoint(CreateEndpointRequest {
            job_id: None,
            tenant_id: env.tenant_id,
            name: "orders-poll".to_string(),
            description: Some("Polls the orders API".to_string()),
            url: "https://example.com/orders".to_string(),
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
            next_run_at: Some(start_instant() + Duration::minutes(10)),
        })
        .await
        .unwrap();

    // A recent finished run makes the endpoint discoverable.
    let run = RunsRepo::create(
        &*env.store,
        NewRun {
            endpoint_id: endpoint.id,
            attempt: 1,
            source: Some(ScheduleSource::BaselineInterval),
            started_at: start_instant() - Duration::minutes(2),
        },
    )
    .await
    .unwrap();
    env.store
        .finish(
            run.id,
            FinishRun {
                status: RunStatus::Success,
                finished_at: start_instant() - Duration::minutes(2),
                duration_ms: 120,
                status_code: Some(200),
                response_body: Some(json!({"orders": 3})),
                error_message: None,
                error_details: None,
            },
        )
        .await
        .unwrap();

    endpoint.id
}

/// Records a finished run at `at` so discovery keeps seeing the endpoint.
async fn touch_run(env: &TestEnv, endpoint_id: Uuid, at: DateTime<Utc>) {
    let run = RunsRepo::create(
        &*env.store,
        NewRun {
            endpoint_id,
            attempt: 1,
            source: Some(ScheduleSource::BaselineInterval),
            started_at: at,
        },
    )
    .await
    .unwrap();
    env.store
        .finish(
            run.id,
            FinishRun {
                status: RunStatus::Success,
                finished_at: at,
                duration_ms: 80,
                status_code: Some(200),
                response_body: None,
                error_message: None,
                error_details: None,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn first_analysis_runs_the_tool_loop_and_persists_the_session() {
    let env = test_env("pro");
    let endpoint_id = seeded_endpoint(&env).await;

    env.chat
        .queue_tool_call("call-1", "get_latest_response", json!({}));
    env.chat.queue_tool_call(
        "call-2",
        "submit_analysis",
        json!({"reasoning": "healthy and steady", "next_analysis_in_ms": 600_000}),
    );

    let analyzed = env.worker.tick().await.unwrap();
    assert_eq!(analyzed, 1);

    let session = env
        .store
        .get_last_session(endpoint_id)
        .await
        .unwrap()
        .expect("session must be persisted");
    assert_eq!(session.reasoning, "healthy and steady");
    assert_eq!(session.token_usage, Some(2 * TOKENS_PER_TURN));
    assert_eq!(
        session.next_analysis_at,
        Some(session.analyzed_at + Duration::milliseconds(600_000))
    );
    assert_eq!(session.endpoint_failure_count, Some(0));

    let calls = session.tool_calls.as_array().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0]["tool"], "get_latest_response");
    assert_eq!(calls[0]["result"]["found"], true);
    assert_eq!(calls[1]["tool"], "submit_analysis");
}

#[tokio::test]
async fn endpoints_are_not_reanalyzed_before_their_schedule() {
    let env = test_env("pro");
    let endpoint_id = seeded_endpoint(&env).await;

    env.chat.queue_tool_call(
        "call-1",
        "submit_analysis",
        json!({"reasoning": "fine", "next_analysis_in_ms": 3_600_000}),
    );
    assert_eq!(env.worker.tick().await.unwrap(), 1);

    // Still within the requested window: nothing to do, and the model is
    // never consulted.
    let requests_before = env.chat.requests.lock().unwrap().len();
    env.clock.advance(Duration::minutes(5));
    touch_run(&env, endpoint_id, env.clock.now()).await;
    assert_eq!(env.worker.tick().await.unwrap(), 0);
    assert_eq!(env.chat.requests.lock().unwrap().len(), requests_before);

    // Past the window the endpoint is due again.
    env.chat.queue_tool_call(
        "call-2",
        "submit_analysis",
        json!({"reasoning": "still fine"}),
    );
    env.clock.advance(Duration::minutes(56));
    touch_run(&env, endpoint_id, env.clock.now()).await;
    assert_eq!(env.worker.tick().await.unwrap(), 1);
}

#[tokio::test]
async fn new_failures_trigger_reanalysis_before_the_schedule() {
    let env = test_env("pro");
    let endpoint_id = seeded_endpoint(&env).await;

    env.chat.queue_tool_call(
        "call-1",
        "submit_analysis",
        json!({"reasoning": "fine", "next_analysis_in_ms": 86_400_000}),
    );
    assert_eq!(env.worker.tick().await.unwrap(), 1);

    // A failed run bumps the failure count past the session snapshot.
    let now = env.clock.now();
    let run = RunsRepo::create(
        &*env.store,
        NewRun {
            endpoint_id,
            attempt: 1,
            source: Some(ScheduleSource::BaselineInterval),
            started_at: now,
        },
    )
    .await
    .unwrap();
    env.store
        .update_after_run(
            endpoint_id,
            AfterRunUpdate {
                run_id: run.id,
                finish: FinishRun {
                    status: RunStatus::Failed,
                    finished_at: now,
                    duration_ms: 30,
                    status_code: Some(500),
                    response_body: None,
                    error_message: Some("HTTP 500 Internal Server Error".to_string()),
                    error_details: None,
                },
                last_run_at: now,
                failure_count: 1,
                next_run_at: now + Duration::minutes(2),
                clear_hints: false,
            },
        )
        .await
        .unwrap();

    env.chat.queue_tool_call(
        "call-2",
        "submit_analysis",
        json!({"reasoning": "investigating new failures"}),
    );
    env.clock.advance(Duration::minutes(1));
    assert_eq!(env.worker.tick().await.unwrap(), 1);

    let session = env
        .store
        .get_last_session(endpoint_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.reasoning, "investigating new failures");
    assert_eq!(session.endpoint_failure_count, Some(1));
}

#[tokio::test]
async fn exhausted_quota_skips_analysis() {
    let env = test_env("free");
    let endpoint_id = seeded_endpoint(&env).await;

    // Burn the whole free budget on a sibling endpoint this month.
    let other = env
        .store
        .add_endpoint(CreateEndpointRequest {
            job_id: None,
            tenant_id: env.tenant_id,
            name: "expensive".to_string(),
            description: None,
            url: "https://example.com/other".to_string(),
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
            next_run_at: Some(start_instant()),
        })
        .await
        .unwrap();
    SessionsRepo::create(
        &*env.store,
        NewSession {
            endpoint_id: other.id,
            analyzed_at: start_instant() - Duration::hours(3),
            tool_calls: json!([]),
            reasoning: "burned the budget".to_string(),
            token_usage: Some(100_000),
            duration_ms: Some(100),
            next_analysis_at: None,
            endpoint_failure_count: Some(0),
        },
    )
    .await
    .unwrap();

    let analyzed = env.worker.tick().await.unwrap();
    assert_eq!(analyzed, 0);
    assert!(env.store.get_last_session(endpoint_id).await.unwrap().is_none());
    assert!(env.chat.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn write_tools_mutate_the_endpoint_and_each_hint_replaces_the_last() {
    let env = test_env("pro");
    let endpoint_id = seeded_endpoint(&env).await;

    env.chat.queue_tool_call(
        "call-1",
        "propose_interval",
        json!({"interval_ms": 120_000, "ttl_minutes": 60, "reason": "traffic is slow"}),
    );
    env.chat.queue_tool_call(
        "call-2",
        "submit_analysis",
        json!({"reasoning": "widened the interval"}),
    );
    assert_eq!(env.worker.tick().await.unwrap(), 1);

    let now = env.clock.now();
    let endpoint = env.store.get_endpoint(endpoint_id).await.unwrap();
    assert_eq!(endpoint.ai_hint_interval_ms, Some(120_000));
    assert_eq!(endpoint.ai_hint_expires_at, Some(now + Duration::minutes(60)));
    assert_eq!(endpoint.ai_hint_reason.as_deref(), Some("traffic is slow"));
    // The nudge pulled next_run_at from +10min to +2min.
    assert_eq!(endpoint.next_run_at, now + Duration::milliseconds(120_000));

    // A later one-shot hint replaces the whole quadruple.
    let oneshot_at = now + Duration::minutes(30);
    env.chat.queue_tool_call(
        "call-3",
        "propose_next_time",
        json!({
            "next_run_at_iso": oneshot_at.to_rfc3339(),
            "ttl_minutes": 10,
            "reason": "one spike expected"
        }),
    );
    env.chat.queue_tool_call(
        "call-4",
        "submit_analysis",
        json!({"reasoning": "scheduled a one-shot"}),
    );
    // Force re-analysis through the failure override.
    let run = RunsRepo::create(
        &*env.store,
        NewRun {
            endpoint_id,
            attempt: 1,
            source: None,
            started_at: now,
        },
    )
    .await
    .unwrap();
    env.store
        .update_after_run(
            endpoint_id,
            AfterRunUpdate {
                run_id: run.id,
                finish: FinishRun {
                    status: RunStatus::Failed,
                    finished_at: now,
                    duration_ms: 5,
                    status_code: Some(502),
                    response_body: None,
                    error_message: Some("HTTP 502 Bad Gateway".to_string()),
                    error_details: None,
                },
                last_run_at: now,
                failure_count: 1,
                next_run_at: now + Duration::minutes(2),
                clear_hints: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(env.worker.tick().await.unwrap(), 1);

    let endpoint = env.store.get_endpoint(endpoint_id).await.unwrap();
    assert_eq!(endpoint.ai_hint_interval_ms, None);
    assert_eq!(endpoint.ai_hint_next_run_at, Some(oneshot_at));
    assert_eq!(endpoint.ai_hint_reason.as_deref(), Some("one spike expected"));
}

#[tokio::test]
async fn missing_submit_analysis_persists_a_partial_session() {
    let env = test_env("pro");
    let endpoint_id = seeded_endpoint(&env).await;

    env.chat
        .queue_tool_call("call-1", "get_latest_response", json!({}));
    env.chat.queue_text("I looked at the data and it seems fine.");

    assert_eq!(env.worker.tick().await.unwrap(), 1);

    let session = env
        .store
        .get_last_session(endpoint_id)
        .await
        .unwrap()
        .expect("partial session must still be persisted");
    assert!(session.reasoning.contains("without submit_analysis"));
    assert!(session.next_analysis_at.is_none());
    assert_eq!(session.token_usage, Some(2 * TOKENS_PER_TURN));
}

#[tokio::test]
async fn out_of_range_reanalysis_window_is_clamped() {
    let env = test_env("pro");
    let endpoint_id = seeded_endpoint(&env).await;

    env.chat.queue_tool_call(
        "call-1",
        "submit_analysis",
        json!({"reasoning": "check back immediately", "next_analysis_in_ms": 1000}),
    );
    assert_eq!(env.worker.tick().await.unwrap(), 1);

    let session = env
        .store
        .get_last_session(endpoint_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        session.next_analysis_at,
        Some(session.analyzed_at + Duration::milliseconds(300_000))
    );
}

#[tokio::test]
async fn invalid_tool_arguments_are_reported_back_not_fatal() {
    let env = test_env("pro");
    let endpoint_id = seeded_endpoint(&env).await;

    env.chat.queue_tool_call(
        "call-1",
        "get_response_history",
        json!({"limit": 500}),
    );
    env.chat.queue_tool_call(
        "call-2",
        "submit_analysis",
        json!({"reasoning": "recovered from a bad call"}),
    );

    assert_eq!(env.worker.tick().await.unwrap(), 1);

    let session = env
        .store
        .get_last_session(endpoint_id)
        .await
        .unwrap()
        .unwrap();
    let calls = session.tool_calls.as_array().unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls[0]["result"]["error"]
        .as_str()
        .unwrap()
        .contains("limit"));
    assert_eq!(session.reasoning, "recovered from a bad call");
}
