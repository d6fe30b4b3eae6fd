//! Daily reporting snapshots.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::time::TimestampMs;
use tracing::info;

use crate::context::Ctx;

use super::{Job, JobSummary, DAILY};

pub struct StatsAggregateJob;

#[async_trait]
impl Job for StatsAggregateJob {
    fn name(&self) -> &'static str {
        "stats-aggregate"
    }

    fn cadence(&self) -> std::time::Duration {
        DAILY
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        // Aggregate the previous UTC day.
        let now = TimestampMs::now().to_datetime();
        let today_midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("Midnight exists")
            .and_utc();
        let start = TimestampMs::from_datetime(today_midnight)
            .saturating_sub(Duration::from_secs(24 * 3600));
        let end = TimestampMs::from_datetime(today_midnight);
        let day = start.to_datetime().format("%Y-%m-%d").to_string();

        let stats = ctx.store.daily_stats(start, end).await?;
        ctx.store.insert_stats_snapshot(&day, &stats).await?;
        info!(
            %day,
            charges = stats.charge_count,
            gross_usd_cents = stats.gross_usd_cents,
            "Stats snapshot recorded"
        );

        Ok(JobSummary {
            processed: stats.charge_count as usize,
            sent: 1,
            errors: Vec::new(),
        })
    }
}
