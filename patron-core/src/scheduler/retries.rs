//! Past-due retry sweep.
//!
//! Regional subscriptions in `past_due` are re-charged on the 1d/3d/5d
//! schedule; once the schedule is exhausted the subscription cancels with
//! reason `payment_failed`. Card-processor subscriptions are excluded:
//! their provider runs its own retry machinery and reports outcomes via
//! webhooks.

use anyhow::Result;
use async_trait::async_trait;
use common::{api::models::Provider, time::TimestampMs};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    context::Ctx,
    locks,
    models::{Activity, ActivityKind, CancelReason, SubscriptionStatus},
};

use super::{billing, Job, JobSummary, HOURLY};

pub struct RetriesJob;

#[async_trait]
impl Job for RetriesJob {
    fn name(&self) -> &'static str {
        "retries"
    }

    fn cadence(&self) -> std::time::Duration {
        HOURLY
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        let now = TimestampMs::now();
        let past_due = ctx.store.list_past_due_subscriptions().await?;
        let mut summary = JobSummary::default();

        for sub in past_due {
            if sub.provider == Provider::Stripe {
                continue;
            }
            summary.processed += 1;
            if let Err(e) = retry_subscription(ctx, sub.id, now).await {
                summary.record_error(&sub.id.to_string(), e);
            }
        }
        Ok(summary)
    }
}

#[instrument(skip_all, fields(subscription_id = %subscription_id))]
async fn retry_subscription(
    ctx: &Ctx,
    subscription_id: Uuid,
    now: TimestampMs,
) -> Result<()> {
    let key = subscription_id.to_string();
    let Some(guard) = locks::lock_subscription(&ctx.cache, &key).await?
    else {
        return Ok(());
    };
    let result = retry_locked(ctx, subscription_id, now).await;
    guard.release().await;
    result
}

async fn retry_locked(
    ctx: &Ctx,
    subscription_id: Uuid,
    now: TimestampMs,
) -> Result<()> {
    let Some(mut sub) =
        ctx.store.get_subscription(subscription_id).await?
    else {
        return Ok(());
    };
    if sub.status != SubscriptionStatus::PastDue {
        return Ok(());
    }

    if sub.retries_exhausted(now) {
        sub.cancel_now(CancelReason::PaymentFailed, now);
        ctx.store.update_subscription(&sub).await?;
        ctx.store
            .append_activity(&Activity {
                id: Uuid::new_v4(),
                user_id: sub.subscriber_id,
                kind: ActivityKind::SubscriptionCanceled {
                    subscription_id: sub.id,
                    reason: CancelReason::PaymentFailed,
                },
                occurred_at: now,
            })
            .await?;
        info!("Retries exhausted; subscription canceled");
        return Ok(());
    }

    let attempt = sub.retry_count.max(0) as usize;
    if !sub.retry_due(attempt, now) {
        return Ok(());
    }

    match billing::charge_stored_authorization(ctx, &sub, now).await? {
        billing::BillOutcome::Charged(payment_id) => {
            // The applier restored the subscription to active.
            info!(%payment_id, "Retry charge succeeded");
        }
        billing::BillOutcome::Declined(reason) => {
            info!(%reason, attempt, "Retry charge declined");
            sub.retry_count += 1;
            sub.updated_at = now;
            ctx.store.update_subscription(&sub).await?;
        }
        billing::BillOutcome::Skipped => (),
    }
    Ok(())
}
