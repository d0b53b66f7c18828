pub mod config;
pub mod database_setup;
pub mod planner;
pub mod scheduling;
pub mod secrets;

pub use config::Config;
pub use database_setup::DatabaseSetup;

// Re-export the scheduling core for convenience
pub use scheduling::{
    connection::create_pool, plan_next_run, Clock, Cron, DispatchOutcome, Dispatcher, Endpoint,
    HttpDispatcher, HttpMethod, InMemoryStore, Job, JobsRepo, ManualClock, MockDispatcher,
    PlannedRun, QuotaGuard, Run, RunStatus, RunsRepo, ScheduleSource, SchedulerError,
    SchedulerSettings, SchedulerWorker, Session, SessionsRepo, StandardCron, SystemClock,
};

// Re-export the planner surface
pub use planner::{
    analysis_is_due, ChatClient, LlmConfig, MockChatClient, OpenAiChatClient, PlannerSettings,
    PlannerWorker, ToolRegistry,
};

// Re-export secrets handling
pub use secrets::{HeaderCipher, SecretsError};
