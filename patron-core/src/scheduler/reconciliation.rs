//! Nightly reconciliation sweep.

use anyhow::Result;
use async_trait::async_trait;

use crate::{context::Ctx, reconcile};

use super::{Job, JobSummary, DAILY};

/// Trailing window each nightly run covers. Generous overlap with the
/// previous run; the heal path is idempotent so re-covering ground is
/// free.
const WINDOW_HOURS: u32 = 48;

pub struct ReconciliationJob;

#[async_trait]
impl Job for ReconciliationJob {
    fn name(&self) -> &'static str {
        "reconciliation"
    }

    fn cadence(&self) -> std::time::Duration {
        DAILY
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        let report = reconcile::run(ctx, WINDOW_HOURS, true)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let mut summary = JobSummary {
            processed: report.provider_transactions,
            sent: report.healed,
            errors: Vec::new(),
        };
        for reference in &report.unattributable {
            summary
                .record_error(reference, "settled but unattributable");
        }
        Ok(summary)
    }
}
