//! The scheduling core: data model, governor, dispatcher, repositories,
//! and the scheduler worker that ties them together.

pub mod clock;
pub mod connection;
pub mod cron;
pub mod dispatcher;
pub mod error;
pub mod governor;
pub mod models;
pub mod repository;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::{Cron, StandardCron};
pub use dispatcher::{DispatchOutcome, Dispatcher, HttpDispatcher, MockDispatcher};
pub use error::{Result, SchedulerError};
pub use governor::{plan_next_run, PlannedRun};
pub use models::{Endpoint, HttpMethod, Job, JobStatus, Run, RunStatus, ScheduleSource, Session};
pub use repository::{InMemoryStore, JobsRepo, QuotaGuard, RunsRepo, SessionsRepo};
pub use worker::{SchedulerSettings, SchedulerWorker};
