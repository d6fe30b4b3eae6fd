//! Renewal reminders at 7, 3, and 1 days before the period end.
//!
//! Scheduler-driven; idempotent per `(subscription, period, offset)` via
//! the notification log, so the hourly tick can re-scan the whole window
//! without double-sending.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::time::TimestampMs;
use tracing::warn;

use crate::{context::Ctx, models::Subscription, traits::Notification};

use super::{Job, JobSummary, HOURLY};

const OFFSETS_DAYS: [u8; 3] = [7, 3, 1];

pub struct RemindersJob;

#[async_trait]
impl Job for RemindersJob {
    fn name(&self) -> &'static str {
        "reminders"
    }

    fn cadence(&self) -> std::time::Duration {
        HOURLY
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        let now = TimestampMs::now();
        let window_end =
            now.saturating_add(Duration::from_secs(8 * 24 * 3600));
        let upcoming = ctx
            .store
            .list_subscriptions_renewing_between(now, window_end)
            .await?;
        let mut summary = JobSummary::default();

        for sub in upcoming {
            if sub.cancel_at_period_end {
                continue;
            }
            summary.processed += 1;
            match remind(ctx, &sub, now).await {
                Ok(sent) => summary.sent += sent,
                Err(e) => summary.record_error(&sub.id.to_string(), e),
            }
        }
        Ok(summary)
    }
}

async fn remind(
    ctx: &Ctx,
    sub: &Subscription,
    now: TimestampMs,
) -> Result<usize> {
    let Some(period_end) = sub.current_period_end else {
        return Ok(0);
    };
    let mut sent = 0;

    for days in OFFSETS_DAYS {
        let offset = Duration::from_secs(u64::from(days) * 24 * 3600);
        let window_floor = offset.saturating_sub(HOURLY * 2);
        let until_renewal = period_end.abs_diff(now);
        // Inside the offset's band: [offset - 2h, offset].
        if period_end <= now
            || until_renewal > offset
            || until_renewal <= window_floor
        {
            continue;
        }

        let kind = format!(
            "renewal_reminder_{days}d_{}",
            period_end.as_ms()
        );
        let fresh = ctx
            .store
            .try_record_notification(sub.id, &kind, now)
            .await?;
        if !fresh {
            continue;
        }
        let Some(subscriber) =
            ctx.store.get_subscriber(sub.subscriber_id).await?
        else {
            continue;
        };
        if let Err(e) = ctx
            .notifier
            .send(Notification::RenewalReminder {
                subscription_id: sub.id,
                subscriber_email: subscriber.email,
                days_before: days,
                renews_at: period_end,
            })
            .await
        {
            warn!("Reminder send failed: {e:#}");
        }
        sent += 1;
    }
    Ok(sent)
}
