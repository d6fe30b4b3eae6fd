//! Dunning: email subscribers whose renewal failed in the trailing day.
//!
//! Idempotent per failed payment via the `payment_failed_{payment_id}`
//! notification-log key, which is checked *inside* the notification lock
//! to close the check-then-send race between concurrent instances.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::time::TimestampMs;
use tracing::warn;

use crate::{
    context::Ctx,
    locks,
    models::Payment,
    traits::Notification,
};

use super::{Job, JobSummary, DAILY};

const LOOKBACK: Duration = Duration::from_secs(24 * 3600);
const NOTIFICATION_LOCK_TTL: Duration = Duration::from_secs(30);

pub struct DunningJob;

#[async_trait]
impl Job for DunningJob {
    fn name(&self) -> &'static str {
        "dunning"
    }

    fn cadence(&self) -> std::time::Duration {
        DAILY
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        let now = TimestampMs::now();
        let since = now.saturating_sub(LOOKBACK);
        let failed = ctx.store.list_failed_charges_since(since).await?;
        let mut summary = JobSummary::default();

        for payment in failed {
            summary.processed += 1;
            match notify_failed_payment(ctx, &payment, now).await {
                Ok(true) => summary.sent += 1,
                Ok(false) => (),
                Err(e) => summary.record_error(&payment.id.to_string(), e),
            }
        }
        Ok(summary)
    }
}

async fn notify_failed_payment(
    ctx: &Ctx,
    payment: &Payment,
    now: TimestampMs,
) -> Result<bool> {
    let Some(subscription_id) = payment.subscription_id else {
        return Ok(false);
    };
    let Some(subscriber_id) = payment.subscriber_id else {
        return Ok(false);
    };
    let kind = format!("payment_failed_{}", payment.id);

    let Some(guard) = locks::try_acquire(
        &ctx.cache,
        &locks::notification_key(subscription_id, &kind),
        NOTIFICATION_LOCK_TTL,
    )
    .await?
    else {
        return Ok(false);
    };

    let result = async {
        // In-lock recheck of the durable log.
        let fresh = ctx
            .store
            .try_record_notification(subscription_id, &kind, now)
            .await?;
        if !fresh {
            return Ok(false);
        }

        let Some(subscriber) =
            ctx.store.get_subscriber(subscriber_id).await?
        else {
            return Ok(false);
        };
        if let Err(e) = ctx
            .notifier
            .send(Notification::PaymentFailed {
                subscription_id,
                subscriber_email: subscriber.email,
                amount_cents: payment.amount_cents,
                currency: payment.currency.clone(),
            })
            .await
        {
            // Logged as sent; the provider-side failure is operator
            // territory, not grounds for double-sending later.
            warn!("Dunning send failed: {e:#}");
        }
        Ok(true)
    }
    .await;

    guard.release().await;
    result
}
