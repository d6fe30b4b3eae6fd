//! Creator balance cache refresh.

use anyhow::Result;
use async_trait::async_trait;
use common::{api::models::Provider, time::TimestampMs};

use crate::context::Ctx;

use super::{Job, JobSummary, HALF_HOURLY};

pub struct SyncBalancesJob;

#[async_trait]
impl Job for SyncBalancesJob {
    fn name(&self) -> &'static str {
        "sync-balances"
    }

    fn cadence(&self) -> std::time::Duration {
        HALF_HOURLY
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        let now = TimestampMs::now();
        let creators = ctx.store.list_creators().await?;
        let mut summary = JobSummary::default();

        for creator in creators {
            if let Some(account_id) = creator.stripe_account_id.as_deref()
            {
                summary.processed += 1;
                match ctx.stripe.fetch_balance(account_id).await {
                    Ok(balance) => {
                        ctx.store
                            .set_creator_balance_cache(
                                creator.id,
                                Provider::Stripe,
                                balance.available_cents,
                                &balance.currency,
                                now,
                            )
                            .await?;
                    }
                    Err(e) => summary
                        .record_error(&creator.id.to_string(), e),
                }
            }
            if creator.has_paystack() {
                summary.processed += 1;
                // The regional processor's balance is platform-level; a
                // creator's available balance is what we owe them.
                let owed = ctx
                    .store
                    .creator_unpaid_net_cents(creator.id)
                    .await?;
                ctx.store
                    .set_creator_balance_cache(
                        creator.id,
                        Provider::Paystack,
                        owed,
                        &creator.currency,
                        now,
                    )
                    .await?;
            }
        }
        Ok(summary)
    }
}
