//! Semi-monthly payroll for service-purpose creators.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Datelike;
use common::time::TimestampMs;
use tracing::info;

use crate::{context::Ctx, payout};

use super::{Job, JobSummary, HOURLY};

pub struct PayrollJob;

#[async_trait]
impl Job for PayrollJob {
    fn name(&self) -> &'static str {
        "payroll"
    }

    fn cadence(&self) -> std::time::Duration {
        HOURLY
    }

    // Two runs a month; anything older than ~17 days is stale.
    fn expected_interval(&self) -> Duration {
        Duration::from_secs(17 * 24 * 3600)
    }

    /// Payouts are cut on the 1st and the 16th.
    fn due(&self, now: TimestampMs) -> bool {
        let day = now.to_datetime().day();
        day == 1 || day == 16
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        let mut summary = JobSummary::default();
        let now = TimestampMs::now();

        // The hourly tick re-fires all day on payroll days; one payroll
        // per date is enough.
        let date = now.to_datetime().format("%Y-%m-%d").to_string();
        let fresh = ctx
            .cache
            .set_nx_px(
                &format!("payroll_ran:{date}"),
                "1",
                Duration::from_secs(2 * 24 * 3600),
            )
            .await?;
        if !fresh {
            return Ok(summary);
        }

        let creators = ctx.store.list_service_creators().await?;
        for creator in creators {
            summary.processed += 1;
            match payout::initiate_creator_payout(ctx, &creator).await {
                Ok(Some(payout_id)) => {
                    info!(%payout_id, creator_id = %creator.id, "Payout cut");
                    summary.sent += 1;
                }
                Ok(None) => (),
                Err(e) => summary.record_error(&creator.id.to_string(), e),
            }
        }
        Ok(summary)
    }
}
