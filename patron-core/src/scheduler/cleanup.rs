//! Daily cleanup sweep.
//!
//! Expires checkout sessions and magic-link tokens, prunes old page
//! views, marks overdue requests expired, cancels subscriptions stuck in
//! `pending` past the grace window, and clears abandoned onboarding
//! state.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::{
    constants::PENDING_SUBSCRIPTION_MAX_AGE,
    time::TimestampMs,
};
use tracing::info;
use uuid::Uuid;

use crate::{
    context::Ctx,
    locks,
    models::{Activity, ActivityKind, CancelReason, SubscriptionStatus},
};

use super::{Job, JobSummary, DAILY};

const PAGE_VIEW_RETENTION: Duration = Duration::from_secs(90 * 24 * 3600);
const ONBOARDING_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

pub struct CleanupJob;

#[async_trait]
impl Job for CleanupJob {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn cadence(&self) -> std::time::Duration {
        DAILY
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        let now = TimestampMs::now();
        let mut summary = JobSummary::default();

        let session_cutoff =
            now.saturating_sub(PENDING_SUBSCRIPTION_MAX_AGE);
        let expired_sessions =
            ctx.store.expire_checkout_sessions(session_cutoff).await?;
        let expired_links =
            ctx.store.delete_expired_magic_links(now).await?;
        let pruned_views = ctx
            .store
            .delete_page_views_before(
                now.saturating_sub(PAGE_VIEW_RETENTION),
            )
            .await?;
        let expired_requests =
            ctx.store.expire_overdue_requests(now).await?;
        let cleared_onboarding = ctx
            .store
            .clear_abandoned_onboarding(
                now.saturating_sub(ONBOARDING_RETENTION),
            )
            .await?;

        // Subscriptions that never saw a successful charge.
        let stale_pending = ctx
            .store
            .list_pending_subscriptions_older_than(session_cutoff)
            .await?;
        for sub in stale_pending {
            match cancel_stale_pending(ctx, sub.id, now).await {
                Ok(true) => summary.sent += 1,
                Ok(false) => (),
                Err(e) => summary.record_error(&sub.id.to_string(), e),
            }
        }

        summary.processed = (expired_sessions
            + expired_links
            + pruned_views
            + expired_requests
            + cleared_onboarding) as usize
            + summary.sent;
        info!(
            expired_sessions,
            expired_links,
            pruned_views,
            expired_requests,
            cleared_onboarding,
            canceled_pending = summary.sent,
            "Cleanup finished"
        );
        Ok(summary)
    }
}

async fn cancel_stale_pending(
    ctx: &Ctx,
    subscription_id: Uuid,
    now: TimestampMs,
) -> Result<bool> {
    let key = subscription_id.to_string();
    let Some(guard) = locks::lock_subscription(&ctx.cache, &key).await?
    else {
        return Ok(false);
    };
    let result = async {
        let Some(mut sub) =
            ctx.store.get_subscription(subscription_id).await?
        else {
            return Ok(false);
        };
        if sub.status != SubscriptionStatus::Pending {
            return Ok(false);
        }
        sub.cancel_now(CancelReason::PendingPaymentTimeout, now);
        ctx.store.update_subscription(&sub).await?;
        ctx.store
            .append_activity(&Activity {
                id: Uuid::new_v4(),
                user_id: sub.subscriber_id,
                kind: ActivityKind::SubscriptionCanceled {
                    subscription_id: sub.id,
                    reason: CancelReason::PendingPaymentTimeout,
                },
                occurred_at: now,
            })
            .await?;
        Ok(true)
    }
    .await;
    guard.release().await;
    result
}
