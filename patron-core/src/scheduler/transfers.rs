//! Stuck-transfer monitor.
//!
//! Payouts sitting in `otp_pending` for more than an hour need a human
//! with an OTP; the monitor raises an alert naming how many and how old.
//! It also watches the rolling payout failure rate and alerts when more
//! than 20% of the recent sample failed.

use anyhow::Result;
use async_trait::async_trait;
use common::{constants::STUCK_TRANSFER_AGE, time::TimestampMs};
use tracing::warn;

use crate::{
    context::Ctx,
    models::PaymentStatus,
    payout,
    traits::OpsAlert,
};

use super::{Job, JobSummary, HOURLY};

const FAILURE_RATE_SAMPLE: u32 = 20;
const FAILURE_RATE_MIN_SAMPLES: usize = 5;
const FAILURE_RATE_ALERT_PCT: u32 = 20;

pub struct TransfersJob;

#[async_trait]
impl Job for TransfersJob {
    fn name(&self) -> &'static str {
        "transfers"
    }

    fn cadence(&self) -> std::time::Duration {
        HOURLY
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        let now = TimestampMs::now();
        let mut summary = JobSummary::default();

        // Stuck OTP transfers.
        let otp_pending = ctx.store.list_otp_pending_payouts().await?;
        let stuck: Vec<_> = otp_pending
            .iter()
            .filter(|p| payout::otp_pending_age(p, now) > STUCK_TRANSFER_AGE)
            .collect();
        summary.processed = otp_pending.len();

        if !stuck.is_empty() {
            let oldest_age_secs = stuck
                .iter()
                .map(|p| payout::otp_pending_age(p, now).as_secs())
                .max()
                .unwrap_or(0);
            warn!(
                stuck = stuck.len(),
                oldest_age_secs, "Stuck OTP transfers detected"
            );
            ctx.alerts
                .raise(OpsAlert::StuckTransfers {
                    count: stuck.len(),
                    oldest_age_secs,
                })
                .await?;
            summary.sent += 1;
        }

        // Rolling failure rate.
        let outcomes = ctx
            .store
            .recent_payout_outcomes(FAILURE_RATE_SAMPLE)
            .await?;
        let terminal: Vec<PaymentStatus> = outcomes
            .into_iter()
            .filter(|s| {
                matches!(
                    s,
                    PaymentStatus::Succeeded | PaymentStatus::Failed
                )
            })
            .collect();
        if terminal.len() >= FAILURE_RATE_MIN_SAMPLES {
            let failed = terminal
                .iter()
                .filter(|s| **s == PaymentStatus::Failed)
                .count();
            let rate_pct = (failed * 100 / terminal.len()) as u32;
            if rate_pct > FAILURE_RATE_ALERT_PCT {
                warn!(rate_pct, samples = terminal.len(), "Payout failure rate high");
                ctx.alerts
                    .raise(OpsAlert::HighTransferFailureRate {
                        failure_rate_pct: rate_pct,
                        samples: terminal.len(),
                    })
                    .await?;
                summary.sent += 1;
            }
        }

        Ok(summary)
    }
}
