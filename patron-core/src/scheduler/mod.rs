//! The scheduled job runner.
//!
//! A leader-election-free design: every job is spawned as its own named
//! task ticking on its cadence, and each tick acquires a short Redis lease
//! (`job:{name}`) before the body runs, so any number of instances can run
//! the scheduler concurrently. Job bodies catch per-item errors and return
//! an aggregate [`JobSummary`]; a job only counts as failed when the body
//! itself errored. After every run the outcome is recorded to a Redis key
//! with a 30-day TTL, which the health endpoint reads to flag staleness.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use common::{
    api::models::JobHealth,
    constants::JOB_HEALTH_TTL,
    shutdown::ShutdownChannel,
    task::PtTask,
    time::TimestampMs,
};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{context::Ctx, locks, traits::Cache};

pub mod billing;
pub mod cancellations;
pub mod cleanup;
pub mod dunning;
pub mod payroll;
pub mod reconciliation;
pub mod reminders;
pub mod retries;
pub mod stats;
pub mod sync_balances;
pub mod transfers;

/// Aggregate result of one job run. Per-item failures land in `errors`
/// without failing the run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct JobSummary {
    pub processed: usize,
    pub sent: usize,
    pub errors: Vec<String>,
}

impl JobSummary {
    pub fn record_error(&mut self, context: &str, err: impl ToString) {
        self.errors.push(format!("{context}: {}", err.to_string()));
    }
}

/// One scheduled job.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Tick cadence.
    fn cadence(&self) -> Duration;

    /// Interval the health endpoint expects between successful runs.
    /// Defaults to the cadence; day-gated jobs override it.
    fn expected_interval(&self) -> Duration {
        self.cadence()
    }

    /// Day/hour gating on top of the cadence (e.g. payroll on the 1st and
    /// 16th). Ungated jobs run on every tick.
    fn due(&self, _now: TimestampMs) -> bool {
        true
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary>;
}

/// All jobs, in the order they are spawned.
pub fn all_jobs() -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(billing::BillingJob),
        Arc::new(retries::RetriesJob),
        Arc::new(payroll::PayrollJob),
        Arc::new(dunning::DunningJob),
        Arc::new(cancellations::CancellationsJob),
        Arc::new(reminders::RemindersJob),
        Arc::new(transfers::TransfersJob),
        Arc::new(reconciliation::ReconciliationJob),
        Arc::new(cleanup::CleanupJob),
        Arc::new(sync_balances::SyncBalancesJob),
        Arc::new(stats::StatsAggregateJob),
    ]
}

/// Spawn one ticking task per job. Tasks exit on shutdown.
pub fn spawn_all(ctx: Ctx, shutdown: ShutdownChannel) -> Vec<PtTask<()>> {
    all_jobs()
        .into_iter()
        .map(|job| spawn_job(ctx.clone(), job, shutdown.clone()))
        .collect()
}

fn spawn_job(
    ctx: Ctx,
    job: Arc<dyn Job>,
    shutdown: ShutdownChannel,
) -> PtTask<()> {
    PtTask::spawn_named(job.name(), async move {
        let mut timer = interval(job.cadence());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    run_once(&ctx, job.as_ref()).await;
                }
                () = shutdown.recv() => {
                    info!("Job '{}' shutting down", job.name());
                    break;
                }
            }
        }
    })
}

/// One gated, leased, recorded run. Public so tests and admin triggers can
/// execute a job body outside its timer.
pub async fn run_once(ctx: &Ctx, job: &dyn Job) {
    let now = TimestampMs::now();
    if !job.due(now) {
        return;
    }

    // The lease keeps concurrent instances from double-running a body;
    // disabled under `test` so paused-clock tests don't need Redis.
    let lease = if ctx.env.job_leases_enabled() {
        match locks::try_acquire(
            &ctx.cache,
            &locks::job_key(job.name()),
            job.cadence().min(Duration::from_secs(15 * 60)),
        )
        .await
        {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => {
                info!("Job '{}' leased elsewhere; skipping", job.name());
                return;
            }
            Err(e) => {
                warn!(
                    "Job '{}' lease check failed ({e:#}); running anyway",
                    job.name()
                );
                None
            }
        }
    } else {
        None
    };

    let started = TimestampMs::now();
    let result = job.run(ctx).await;
    let duration = TimestampMs::now().abs_diff(started);

    match &result {
        Ok(summary) => {
            if summary.errors.is_empty() {
                info!(
                    job = job.name(),
                    processed = summary.processed,
                    sent = summary.sent,
                    "Job finished"
                );
            } else {
                warn!(
                    job = job.name(),
                    processed = summary.processed,
                    errors = summary.errors.len(),
                    "Job finished with item errors: {:?}",
                    summary.errors
                );
            }
        }
        Err(e) => error!(job = job.name(), "Job failed: {e:#}"),
    }

    record_health(
        &ctx.cache,
        job.name(),
        HealthRecord {
            last_run_at: started,
            duration_ms: duration.as_millis() as i64,
            success: result.is_ok(),
        },
    )
    .await;

    if let Some(guard) = lease {
        guard.release().await;
    }
}

// --- Job health --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
struct HealthRecord {
    last_run_at: TimestampMs,
    duration_ms: i64,
    success: bool,
}

fn health_key(name: &str) -> String {
    format!("job_health:{name}")
}

async fn record_health(
    cache: &Arc<dyn Cache>,
    name: &str,
    record: HealthRecord,
) {
    let json = serde_json::to_string(&record)
        .expect("HealthRecord serialization is infallible");
    if let Err(e) = cache
        .set_px(&health_key(name), &json, JOB_HEALTH_TTL)
        .await
    {
        warn!("Failed to record job health for '{name}': {e:#}");
    }
}

/// Read every job's recorded health; `stale` when the last run is older
/// than twice the expected interval (or missing entirely).
pub async fn read_health(
    cache: &Arc<dyn Cache>,
    now: TimestampMs,
) -> Vec<JobHealth> {
    let mut out = Vec::new();
    for job in all_jobs() {
        let record = match cache.get(&health_key(job.name())).await {
            Ok(Some(json)) => {
                serde_json::from_str::<HealthRecord>(&json).ok()
            }
            _ => None,
        };
        let stale = match &record {
            Some(r) => r
                .last_run_at
                .is_older_than(now, job.expected_interval() * 2),
            None => true,
        };
        out.push(JobHealth {
            name: job.name().to_owned(),
            last_run_at: record.as_ref().map(|r| r.last_run_at),
            duration_ms: record.as_ref().map(|r| r.duration_ms),
            success: record.as_ref().map(|r| r.success),
            stale,
        });
    }
    out
}

pub(crate) const HOURLY: Duration = Duration::from_secs(60 * 60);
pub(crate) const DAILY: Duration = Duration::from_secs(24 * 60 * 60);
pub(crate) const HALF_HOURLY: Duration = Duration::from_secs(30 * 60);
