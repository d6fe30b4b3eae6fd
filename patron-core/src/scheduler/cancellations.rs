//! Cancellation emails for subscriptions canceled in the trailing day.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::time::TimestampMs;
use tracing::warn;

use crate::{
    context::Ctx,
    locks,
    models::Subscription,
    traits::Notification,
};

use super::{Job, JobSummary, DAILY};

const LOOKBACK: Duration = Duration::from_secs(24 * 3600);
const NOTIFICATION_LOCK_TTL: Duration = Duration::from_secs(30);
const KIND: &str = "subscription_canceled";

pub struct CancellationsJob;

#[async_trait]
impl Job for CancellationsJob {
    fn name(&self) -> &'static str {
        "cancellations"
    }

    fn cadence(&self) -> std::time::Duration {
        DAILY
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        let now = TimestampMs::now();
        let since = now.saturating_sub(LOOKBACK);
        let canceled =
            ctx.store.list_subscriptions_canceled_since(since).await?;
        let mut summary = JobSummary::default();

        for sub in canceled {
            summary.processed += 1;
            match notify_canceled(ctx, &sub, now).await {
                Ok(true) => summary.sent += 1,
                Ok(false) => (),
                Err(e) => summary.record_error(&sub.id.to_string(), e),
            }
        }
        Ok(summary)
    }
}

async fn notify_canceled(
    ctx: &Ctx,
    sub: &Subscription,
    now: TimestampMs,
) -> Result<bool> {
    let Some(guard) = locks::try_acquire(
        &ctx.cache,
        &locks::notification_key(sub.id, KIND),
        NOTIFICATION_LOCK_TTL,
    )
    .await?
    else {
        return Ok(false);
    };

    let result = async {
        let fresh = ctx
            .store
            .try_record_notification(sub.id, KIND, now)
            .await?;
        if !fresh {
            return Ok(false);
        }
        let Some(subscriber) =
            ctx.store.get_subscriber(sub.subscriber_id).await?
        else {
            return Ok(false);
        };
        if let Err(e) = ctx
            .notifier
            .send(Notification::SubscriptionCanceled {
                subscription_id: sub.id,
                subscriber_email: subscriber.email,
            })
            .await
        {
            warn!("Cancellation send failed: {e:#}");
        }
        Ok(true)
    }
    .await;

    guard.release().await;
    result
}
