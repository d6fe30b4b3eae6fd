//! Recurring billing.
//!
//! The card processor drives its own renewals (our ledger hears about them
//! via `invoice.paid` webhooks), so this job only charges regional
//! subscriptions whose period has lapsed, using the stored authorization.
//! Each subscription is billed at most once per period via the
//! `(subscription_id, period_key)` idempotency log, under its subject
//! lock, in its own short transaction: a crash mid-job loses at most one
//! item.

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{api::models::{BillingInterval, Provider}, time::TimestampMs};
use secrecy::Secret;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    apply,
    context::Ctx,
    locks,
    models::{Activity, ActivityKind, CancelReason, Subscription},
    subscription::PaymentFailedOutcome,
    traits::{ChargeAuthorizationRequest, ChargeOutcome},
    webhook::event::ChargeSucceeded,
};

use super::{Job, JobSummary, DAILY};

pub struct BillingJob;

#[async_trait]
impl Job for BillingJob {
    fn name(&self) -> &'static str {
        "billing"
    }

    fn cadence(&self) -> std::time::Duration {
        DAILY
    }

    async fn run(&self, ctx: &Ctx) -> Result<JobSummary> {
        let now = TimestampMs::now();
        let due = ctx.store.list_due_paystack_subscriptions(now).await?;
        let mut summary = JobSummary::default();

        for sub in due {
            summary.processed += 1;
            match bill_subscription(ctx, sub.id, now).await {
                Ok(BillOutcome::Charged(_)) => summary.sent += 1,
                Ok(_) => (),
                Err(e) => summary.record_error(&sub.id.to_string(), e),
            }
        }
        Ok(summary)
    }
}

/// What one billing pass over a subscription did.
#[derive(Clone, Debug, PartialEq)]
pub enum BillOutcome {
    /// Charged and applied; payment id attached.
    Charged(Uuid),
    /// The charge was declined; the subscription is now past due.
    Declined(String),
    /// Period already billed, subscription canceled meanwhile, or a
    /// pending end-of-period cancellation was honored.
    Skipped,
}

/// Bill one subscription for its lapsed period. Safe to call concurrently
/// and repeatedly; shared by the billing and retries jobs.
#[instrument(skip_all, fields(subscription_id = %subscription_id))]
pub async fn bill_subscription(
    ctx: &Ctx,
    subscription_id: Uuid,
    now: TimestampMs,
) -> Result<BillOutcome> {
    let key = subscription_id.to_string();
    let Some(guard) = locks::lock_subscription(&ctx.cache, &key)
        .await
        .context("Lock acquisition failed")?
    else {
        info!("Subscription is locked elsewhere; skipping");
        return Ok(BillOutcome::Skipped);
    };
    let result = bill_locked(ctx, subscription_id, now).await;
    guard.release().await;
    result
}

async fn bill_locked(
    ctx: &Ctx,
    subscription_id: Uuid,
    now: TimestampMs,
) -> Result<BillOutcome> {
    // Reload under the lock; a webhook may have advanced state since the
    // job listed this row.
    let Some(mut sub) =
        ctx.store.get_subscription(subscription_id).await?
    else {
        return Ok(BillOutcome::Skipped);
    };
    if sub.status != crate::models::SubscriptionStatus::Active
        && sub.status != crate::models::SubscriptionStatus::PastDue
    {
        return Ok(BillOutcome::Skipped);
    }
    let period_lapsed = sub
        .current_period_end
        .map(|end| end <= now)
        .unwrap_or(false);
    if !period_lapsed {
        return Ok(BillOutcome::Skipped);
    }

    // Honor a pending end-of-period cancellation instead of charging.
    if sub.cancel_at_period_end {
        sub.cancel_now(CancelReason::SubscriberRequest, now);
        ctx.store.update_subscription(&sub).await?;
        info!("Honored end-of-period cancellation");
        return Ok(BillOutcome::Skipped);
    }

    // At most one charge per (subscription, period).
    let period_key = sub.period_key();
    let fresh = ctx
        .store
        .try_record_notification(
            sub.id,
            &format!("billing_{period_key}"),
            now,
        )
        .await?;
    if !fresh {
        return Ok(BillOutcome::Skipped);
    }

    let outcome = charge_stored_authorization(ctx, &sub, now).await?;
    if let BillOutcome::Declined(reason) = &outcome {
        warn!(%reason, "Renewal charge declined");
        let failed_outcome =
            sub.apply_payment_failed(sub.current_period_end, now);
        ctx.store.update_subscription(&sub).await?;
        if failed_outcome == PaymentFailedOutcome::MarkedPastDue {
            ctx.store
                .append_activity(&Activity {
                    id: Uuid::new_v4(),
                    user_id: sub.subscriber_id,
                    kind: ActivityKind::SubscriptionPastDue {
                        subscription_id: sub.id,
                    },
                    occurred_at: now,
                })
                .await?;
        }
        record_failed_attempt(ctx, &sub, now).await?;
    }
    Ok(outcome)
}

/// A failed-attempt row, keyed off by the dunning job.
async fn record_failed_attempt(
    ctx: &Ctx,
    sub: &Subscription,
    now: TimestampMs,
) -> Result<()> {
    use crate::models::{
        Payment, PaymentStatus, PaymentType, Reporting,
        ReportingRateSource,
    };
    let failed = Payment {
        id: Uuid::new_v4(),
        subscription_id: Some(sub.id),
        creator_id: sub.creator_id,
        subscriber_id: Some(sub.subscriber_id),
        amount_cents: sub.amount_cents,
        currency: sub.currency.clone(),
        gross_cents: sub.amount_cents,
        fee_cents: 0,
        net_cents: sub.amount_cents,
        creator_fee_cents: None,
        subscriber_fee_cents: None,
        fee_model: sub.fee_model,
        payment_type: PaymentType::Recurring,
        status: PaymentStatus::Failed,
        provider: Provider::Paystack,
        provider_event_id: None,
        provider_charge_ref: None,
        paystack_transfer_code: None,
        occurred_at: now,
        reporting: Reporting {
            currency: common::money::CurrencyCode::usd(),
            gross_cents: 0,
            fee_cents: 0,
            net_cents: 0,
            exchange_rate: rust_decimal::Decimal::ONE,
            rate_source: ReportingRateSource::CurrentRate,
            rate_timestamp: now,
            is_estimated: true,
        },
        fee_delta_cents: None,
        created_at: now,
    };
    ctx.store.insert_payment(&failed).await?;
    Ok(())
}

/// Charge the stored authorization and, on success, push the result
/// through the regular charge applier with a synthesized `manual_` event
/// id, so the ledger write is identical to the webhook path (and the
/// eventual `charge.success` webhook short-circuits on the reference).
pub async fn charge_stored_authorization(
    ctx: &Ctx,
    sub: &Subscription,
    now: TimestampMs,
) -> Result<BillOutcome> {
    let auth_blob = sub
        .paystack_authorization_enc
        .as_deref()
        .context("Subscription has no stored authorization")?;
    let authorization_code: Secret<String> = ctx
        .pii
        .decrypt(auth_blob)
        .context("Authorization decryption failed")?;

    let subscriber = ctx
        .store
        .get_subscriber(sub.subscriber_id)
        .await?
        .context("Subscriber vanished")?;
    if subscriber.blocked_reason.is_some() {
        return Ok(BillOutcome::Skipped);
    }

    let reference = format!("bill_{}", Uuid::new_v4().simple());
    let outcome = ctx
        .paystack
        .charge_authorization(&ChargeAuthorizationRequest {
            authorization_code,
            email: subscriber.email.clone(),
            amount_cents: sub.amount_cents,
            currency: sub.currency.clone(),
            reference: reference.clone(),
            subscription_id: sub.id,
        })
        .await?;

    match outcome {
        ChargeOutcome::Success { reference } => {
            let synthesized = ChargeSucceeded {
                provider: Provider::Paystack,
                charge_ref: reference.clone(),
                amount_cents: sub.amount_cents,
                currency: sub.currency.clone(),
                interval: BillingInterval::Month,
                creator_id: Some(sub.creator_id),
                tier_id: None,
                subscriber_email: Some(subscriber.email),
                stripe_subscription_id: None,
                stripe_customer_id: None,
                paystack_authorization_code: None,
                checkout_ref: None,
                period_end: None,
                provider_fee_cents: None,
                provider_exchange_rate: None,
                occurred_at: now,
            };
            let event_key = format!("manual_{reference}");
            let payment_id =
                apply::apply_charge_success(ctx, &synthesized, &event_key)
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(BillOutcome::Charged(payment_id))
        }
        ChargeOutcome::Failed { reason, .. } => {
            Ok(BillOutcome::Declined(reason))
        }
    }
}
