//! Subscription lifecycle and provider account events.

use common::{api::error::CoreApiError, time::TimestampMs};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    context::Ctx,
    locks,
    models::{
        Activity, ActivityKind, CancelReason, Payment, PaymentStatus,
        PayoutAccountStatus, Reporting, ReportingRateSource,
    },
    subscription::PaymentFailedOutcome,
    webhook::event::{
        AccountUpdated, PaymentFailed, SubscriptionDeleted,
        SubscriptionUpdated,
    },
};

use super::Applied;

/// A renewal attempt failed. Demotes `active -> past_due` (period-guarded)
/// and records a failed payment row that the dunning job keys off.
#[instrument(skip_all)]
pub async fn apply_payment_failed(
    ctx: &Ctx,
    ev: &PaymentFailed,
    event_key: &str,
) -> Result<Applied, CoreApiError> {
    if let Some(existing) =
        ctx.store.find_payment_by_event_id(event_key).await?
    {
        return Ok(Applied::Payment(existing.id));
    }

    let Some(stripe_id) = ev.stripe_subscription_id.as_deref() else {
        // Regional renewals are platform-driven; their failures are
        // recorded synchronously by the billing job.
        info!("payment_failed without subscription binding; skipping");
        return Ok(Applied::Skipped);
    };
    if ctx
        .store
        .find_subscription_by_stripe_id(stripe_id)
        .await?
        .is_none()
    {
        warn!(%stripe_id, "payment_failed for unknown subscription");
        return Ok(Applied::Skipped);
    }

    let guard = locks::lock_subscription(&ctx.cache, stripe_id)
        .await?
        .ok_or_else(|| {
            CoreApiError::provider_unavailable(format!(
                "Subject {stripe_id} is locked"
            ))
        })?;

    // Reload under the lock; a competing charge may have advanced state.
    let sub = ctx
        .store
        .find_subscription_by_stripe_id(stripe_id)
        .await
        .map_err(CoreApiError::from);
    let mut sub = match sub {
        Ok(Some(sub)) => sub,
        Ok(None) => {
            guard.release().await;
            return Ok(Applied::Skipped);
        }
        Err(e) => {
            guard.release().await;
            return Err(e);
        }
    };

    let now = TimestampMs::now();
    let outcome = sub.apply_payment_failed(ev.period_end, now);
    let result = async {
        match outcome {
            PaymentFailedOutcome::MarkedPastDue => {
                ctx.store.update_subscription(&sub).await?;
                ctx.store
                    .append_activity(&Activity {
                        id: Uuid::new_v4(),
                        user_id: sub.subscriber_id,
                        kind: ActivityKind::SubscriptionPastDue {
                            subscription_id: sub.id,
                        },
                        occurred_at: ev.occurred_at,
                    })
                    .await?;
            }
            PaymentFailedOutcome::Historical => {
                info!(
                    subscription_id = %sub.id,
                    "Late payment_failed for an already-renewed period"
                );
            }
            PaymentFailedOutcome::NoChange => (),
        }

        // The failed attempt row. No funds moved; the attempted amount is
        // kept (fee zero) so dunning emails can surface it.
        let amount = ev.amount_cents.unwrap_or(sub.amount_cents);
        let currency =
            ev.currency.clone().unwrap_or_else(|| sub.currency.clone());
        let failed = Payment {
            id: Uuid::new_v4(),
            subscription_id: Some(sub.id),
            creator_id: sub.creator_id,
            subscriber_id: Some(sub.subscriber_id),
            amount_cents: amount,
            currency,
            gross_cents: amount,
            fee_cents: 0,
            net_cents: amount,
            creator_fee_cents: None,
            subscriber_fee_cents: None,
            fee_model: sub.fee_model,
            payment_type: crate::models::PaymentType::Recurring,
            status: PaymentStatus::Failed,
            provider: ev.provider,
            provider_event_id: Some(event_key.to_owned()),
            provider_charge_ref: ev.charge_ref.clone(),
            paystack_transfer_code: None,
            occurred_at: ev.occurred_at,
            reporting: Reporting {
                currency: common::money::CurrencyCode::usd(),
                gross_cents: 0,
                fee_cents: 0,
                net_cents: 0,
                exchange_rate: rust_decimal::Decimal::ONE,
                rate_source: ReportingRateSource::CurrentRate,
                rate_timestamp: ev.occurred_at,
                is_estimated: true,
            },
            fee_delta_cents: None,
            created_at: now,
        };
        let failed_id = failed.id;
        ctx.store.insert_payment(&failed).await?;
        Ok(Applied::Payment(failed_id))
    }
    .await;

    guard.release().await;
    result
}

/// Mirror provider-side subscription mutations (cancel-at-period-end
/// toggles, provider-driven cancellation).
#[instrument(skip_all, fields(stripe_id = %ev.stripe_subscription_id))]
pub async fn apply_subscription_updated(
    ctx: &Ctx,
    ev: &SubscriptionUpdated,
) -> Result<(), CoreApiError> {
    let Some(mut sub) = ctx
        .store
        .find_subscription_by_stripe_id(&ev.stripe_subscription_id)
        .await?
    else {
        // Update for a subscription we haven't bound yet (first charge
        // hasn't landed); there is nothing local to mirror.
        return Ok(());
    };

    let now = TimestampMs::now();
    if ev.provider_status == "canceled" {
        sub.cancel_now(CancelReason::ProviderCanceled, now);
    } else {
        sub.cancel_at_period_end = ev.cancel_at_period_end;
        if let (Some(new_end), Some(cur)) =
            (ev.current_period_end, sub.current_period_end)
        {
            if new_end > cur {
                sub.current_period_end = Some(new_end);
            }
        }
        sub.updated_at = now;
    }
    ctx.store.update_subscription(&sub).await?;
    Ok(())
}

#[instrument(skip_all, fields(stripe_id = %ev.stripe_subscription_id))]
pub async fn apply_subscription_deleted(
    ctx: &Ctx,
    ev: &SubscriptionDeleted,
) -> Result<(), CoreApiError> {
    let Some(mut sub) = ctx
        .store
        .find_subscription_by_stripe_id(&ev.stripe_subscription_id)
        .await?
    else {
        return Ok(());
    };

    let was_canceled =
        sub.status == crate::models::SubscriptionStatus::Canceled;
    sub.cancel_now(CancelReason::ProviderCanceled, TimestampMs::now());
    ctx.store.update_subscription(&sub).await?;
    if !was_canceled {
        ctx.store
            .append_activity(&Activity {
                id: Uuid::new_v4(),
                user_id: sub.subscriber_id,
                kind: ActivityKind::SubscriptionCanceled {
                    subscription_id: sub.id,
                    reason: CancelReason::ProviderCanceled,
                },
                occurred_at: ev.occurred_at,
            })
            .await?;
    }
    Ok(())
}

/// Mirror connected-account capability changes onto the creator's payout
/// status.
#[instrument(skip_all, fields(account_id = %ev.stripe_account_id))]
pub async fn apply_account_updated(
    ctx: &Ctx,
    ev: &AccountUpdated,
) -> Result<(), CoreApiError> {
    let Some(creator) = ctx
        .store
        .find_creator_by_stripe_account(&ev.stripe_account_id)
        .await?
    else {
        warn!("account.updated for unknown connected account");
        return Ok(());
    };

    let status = if ev.disabled_reason.is_some() {
        PayoutAccountStatus::Disabled
    } else if ev.charges_enabled && ev.payouts_enabled {
        PayoutAccountStatus::Active
    } else {
        PayoutAccountStatus::Restricted
    };
    ctx.store
        .set_creator_payout_status(creator.id, status)
        .await?;
    Ok(())
}
