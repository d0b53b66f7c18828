//! The scheduler worker: claims due endpoints under the pessimistic lock,
//! dispatches them, records runs, and advances endpoint state. Multiple
//! worker processes can run concurrently; the claim query is the only
//! arbitration between them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::cron::Cron;
use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::error::Result;
use super::governor::plan_next_run;
use super::models::{AfterRunUpdate, FinishRun, NewRun, RunStatus};
use super::repository::{JobsRepo, RunsRepo};
use crate::secrets::HeaderCipher;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub batch_size: i64,
    pub poll_interval_ms: u64,
    pub claim_horizon_ms: i64,
    pub cleanup_interval_ms: u64,
    pub zombie_run_threshold_ms: i64,
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval_ms: 5000,
            claim_horizon_ms: 10_000,
            cleanup_interval_ms: 300_000,
            zombie_run_threshold_ms: 3_600_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

#[derive(Clone)]
pub struct SchedulerWorker {
    jobs: Arc<dyn JobsRepo>,
    runs: Arc<dyn RunsRepo>,
    dispatcher: Arc<dyn Dispatcher>,
    cipher: Arc<HeaderCipher>,
    clock: Arc<dyn Clock>,
    cron: Arc<dyn Cron>,
    settings: SchedulerSettings,
}

impl SchedulerWorker {
    pub fn new(
        jobs: Arc<dyn JobsRepo>,
        runs: Arc<dyn RunsRepo>,
        dispatcher: Arc<dyn Dispatcher>,
        cipher: Arc<HeaderCipher>,
        clock: Arc<dyn Clock>,
        cron: Arc<dyn Cron>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            jobs,
            runs,
            dispatcher,
            cipher,
            clock,
            cron,
            settings,
        }
    }

    /// Tick and cleanup loops until the shutdown signal arrives. The
    /// in-flight tick always completes; the caller bounds the join with
    /// `shutdown_timeout_ms`.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.settings.poll_interval_ms,
            batch_size = self.settings.batch_size,
            "Scheduler worker started"
        );

        let mut poll = tokio::time::interval(Duration::from_millis(self.settings.poll_interval_ms));
        let mut cleanup =
            tokio::time::interval(Duration::from_millis(self.settings.cleanup_interval_ms));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Scheduler worker shutting down");
                    break;
                }
                _ = poll.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.run_cleanup().await {
                        error!(error = %e, "Zombie cleanup failed");
                    }
                }
            }
        }
    }

    /// One scheduling pass: claim a batch, dispatch every claimed endpoint
    /// concurrently, and wait for all of them. Returns how many endpoints
    /// were processed.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let claimed = self
            .jobs
            .claim_due_endpoints(now, self.settings.batch_size, self.settings.claim_horizon_ms)
            .await?;

        if claimed.is_empty() {
            return Ok(0);
        }
        debug!(count = claimed.len(), "Processing claimed endpoints");

        // The claim batch is capped at batch_size, which is also the bound
        // on concurrent dispatches.
        let mut in_flight = JoinSet::new();
        for endpoint_id in claimed {
            let worker = self.clone();
            in_flight.spawn(async move {
                if let Err(e) = worker.process_endpoint(endpoint_id).await {
                    error!(endpoint_id = %endpoint_id, error = %e, "Endpoint processing failed");
                }
            });
        }

        let mut processed = 0;
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Dispatch task panicked");
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Fails runs abandoned by crashed or stuck workers. Endpoint state is
    /// not touched; the next claim reconciles it once the lock expires.
    pub async fn run_cleanup(&self) -> Result<u64> {
        let now = self.clock.now();
        let reaped = self
            .runs
            .cleanup_zombie_runs(now, self.settings.zombie_run_threshold_ms)
            .await?;
        if reaped > 0 {
            warn!(count = reaped, "Reaped zombie runs");
        }
        Ok(reaped)
    }

    /// Dispatches one claimed endpoint and commits run-finish plus
    /// endpoint-advance as a single repository transaction.
    async fn process_endpoint(&self, endpoint_id: Uuid) -> Result<()> {
        let endpoint = self.jobs.get_endpoint(endpoint_id).await?;
        let now = self.clock.now();

        // The tag stored on the run is re-derived from the snapshot and
        // records which rule made the run due now.
        let source = plan_next_run(now, &endpoint, self.cron.as_ref()).source;

        let run = self
            .runs
            .create(NewRun {
                endpoint_id,
                attempt: endpoint.failure_count + 1,
                source: Some(source),
                started_at: now,
            })
            .await?;

        let outcome = match self.cipher.open(endpoint.headers.as_deref()) {
            Ok(headers) => self.dispatcher.execute(&endpoint, headers.as_ref()).await,
            Err(e) => {
                error!(endpoint_id = %endpoint_id, error = %e, "Header decryption failed");
                DispatchOutcome::failed(0, format!("header decryption failed: {e}"))
            }
        };

        let finished_at = self.clock.now();
        let failure_count = if outcome.status == RunStatus::Success {
            0
        } else {
            endpoint.failure_count + 1
        };

        let mut advanced = endpoint.clone();
        advanced.last_run_at = Some(finished_at);
        advanced.failure_count = failure_count;
        let clear_hints = matches!(endpoint.ai_hint_expires_at, Some(expires) if expires <= finished_at);
        if clear_hints {
            advanced.ai_hint_interval_ms = None;
            advanced.ai_hint_next_run_at = None;
            advanced.ai_hint_expires_at = None;
            advanced.ai_hint_reason = None;
        }

        let planned = plan_next_run(finished_at, &advanced, self.cron.as_ref());

        debug!(
            endpoint_id = %endpoint_id,
            run_id = %run.id,
            status = %outcome.status,
            duration_ms = outcome.duration_ms,
            next_run_at = %planned.next_run_at,
            next_source = %planned.source,
            "Run finished"
        );

        self.jobs
            .update_after_run(
                endpoint_id,
                AfterRunUpdate {
                    run_id: run.id,
                    finish: FinishRun {
                        status: outcome.status,
                        finished_at,
                        duration_ms: outcome.duration_ms,
                        status_code: outcome.status_code,
                        response_body: outcome.response_body,
                        error_message: outcome.error_message,
                        error_details: None,
                    },
                    last_run_at: finished_at,
                    failure_count,
                    next_run_at: planned.next_run_at,
                    clear_hints,
                },
            )
            .await?;

        Ok(())
    }
}
