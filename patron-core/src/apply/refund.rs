//! Refund, chargeback, and dispute application.

use common::{api::error::CoreApiError, money::UsdRate, time::TimestampMs};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    context::Ctx,
    fees,
    locks,
    models::{
        Activity, ActivityKind, Payment, PaymentStatus, PaymentType,
        ReportingRateSource,
    },
    traits::CheckedRefund,
    webhook::event::{ChargeRefunded, DisputeClosed, DisputeOpened},
};

use super::Applied;

/// Apply a processed refund: a new negative payment row, proportional fee
/// reversal, clamped LTV decrement, and the original's status flip.
#[instrument(skip_all, fields(charge_ref = %ev.charge_ref))]
pub async fn apply_refund(
    ctx: &Ctx,
    ev: &ChargeRefunded,
    event_key: &str,
) -> Result<Uuid, CoreApiError> {
    if let Some(existing) =
        ctx.store.find_payment_by_event_id(event_key).await?
    {
        return Ok(existing.id);
    }

    let original = require_original(ctx, ev.provider, &ev.charge_ref).await?;

    let subject = original
        .subscription_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| ev.charge_ref.clone());
    let guard = locks::lock_subscription(&ctx.cache, &subject)
        .await?
        .ok_or_else(|| {
            CoreApiError::provider_unavailable(format!(
                "Subject {subject} is locked"
            ))
        })?;
    let result = refund_locked(
        ctx,
        ev.refund_amount_cents,
        ev.refund_ref.as_deref(),
        ev.occurred_at,
        original,
        event_key,
        PaymentStatus::Refunded,
    )
    .await;
    guard.release().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn refund_locked(
    ctx: &Ctx,
    refund_amount_cents: i64,
    refund_ref: Option<&str>,
    occurred_at: TimestampMs,
    original: Payment,
    event_key: &str,
    original_new_status: PaymentStatus,
) -> Result<Uuid, CoreApiError> {
    if let Some(existing) =
        ctx.store.find_payment_by_event_id(event_key).await?
    {
        return Ok(existing.id);
    }

    if refund_amount_cents <= 0
        || refund_amount_cents > original.gross_cents
    {
        return Err(CoreApiError::provider_permanent(format!(
            "Refund amount {refund_amount_cents} out of range for gross {}",
            original.gross_cents
        )));
    }

    let breakdown = fees::refund_breakdown(
        original.gross_cents,
        original.fee_cents,
        original.creator_fee_cents,
        refund_amount_cents,
    );

    // Reuse the original payment's rate so the USD shadow cancels exactly;
    // a zero legacy rate falls back to the current rate, flagged estimated.
    let reporting = match UsdRate::new(original.reporting.exchange_rate) {
        Ok(rate) => super::reporting_at_rate(
            breakdown.amount_cents,
            breakdown.fee_cents,
            breakdown.net_cents,
            &original.currency,
            rate,
            ReportingRateSource::OriginalPayment,
            original.reporting.rate_timestamp,
            false,
        ),
        Err(_) => {
            warn!(
                payment_id = %original.id,
                "Original payment has no usable rate; estimating"
            );
            let rate = ctx.fx.usd_rate(&original.currency).await?;
            super::reporting_at_rate(
                breakdown.amount_cents,
                breakdown.fee_cents,
                breakdown.net_cents,
                &original.currency,
                rate,
                ReportingRateSource::CurrentRate,
                occurred_at,
                true,
            )
        }
    };

    let now = TimestampMs::now();
    let refund = Payment {
        id: Uuid::new_v4(),
        subscription_id: original.subscription_id,
        creator_id: original.creator_id,
        subscriber_id: original.subscriber_id,
        amount_cents: breakdown.amount_cents,
        currency: original.currency.clone(),
        gross_cents: breakdown.amount_cents,
        fee_cents: breakdown.fee_cents,
        net_cents: breakdown.net_cents,
        creator_fee_cents: breakdown.creator_fee_cents,
        subscriber_fee_cents: breakdown.subscriber_fee_cents,
        fee_model: original.fee_model,
        payment_type: original.payment_type,
        status: PaymentStatus::Refunded,
        provider: original.provider,
        provider_event_id: Some(event_key.to_owned()),
        provider_charge_ref: refund_ref
            .map(str::to_owned)
            .or_else(|| original.provider_charge_ref.clone()),
        paystack_transfer_code: None,
        occurred_at,
        reporting,
        fee_delta_cents: None,
        created_at: now,
    };
    if cfg!(debug_assertions) {
        refund.assert_invariants();
    }

    let activities = vec![Activity {
        id: Uuid::new_v4(),
        user_id: original.creator_id,
        kind: ActivityKind::PaymentRefunded {
            payment_id: refund.id,
            amount_cents: refund.amount_cents,
            currency: refund.currency.clone(),
        },
        occurred_at,
    }];

    let refund_id = refund.id;
    ctx.store
        .persist_refund(CheckedRefund {
            refund,
            original_payment_id: original.id,
            original_new_status,
            subscription_id: original.subscription_id,
            ltv_decrement_cents: breakdown.net_cents.abs(),
            activities,
        })
        .await?;

    info!(%refund_id, original_id = %original.id, "Applied refund");
    Ok(refund_id)
}

/// A dispute was opened: flag the original payment and the subscriber. No
/// money moves until the dispute closes.
#[instrument(skip_all, fields(charge_ref = %ev.charge_ref))]
pub async fn apply_dispute_opened(
    ctx: &Ctx,
    ev: &DisputeOpened,
) -> Result<(), CoreApiError> {
    let original = require_original(ctx, ev.provider, &ev.charge_ref).await?;
    if original.status != PaymentStatus::Succeeded {
        // Already disputed/refunded; replay or race, nothing to do.
        return Ok(());
    }

    ctx.store
        .update_payment_status(original.id, PaymentStatus::Disputed, None)
        .await?;
    if let Some(subscriber_id) = original.subscriber_id {
        let disputes =
            ctx.store.increment_dispute_count(subscriber_id).await?;
        if disputes >= 2 {
            ctx.store
                .set_subscriber_blocked(
                    subscriber_id,
                    Some("repeat_disputes".to_owned()),
                )
                .await?;
        }
    }
    ctx.store
        .append_activity(&Activity {
            id: Uuid::new_v4(),
            user_id: original.creator_id,
            kind: ActivityKind::DisputeOpened {
                payment_id: original.id,
            },
            occurred_at: ev.occurred_at,
        })
        .await?;
    Ok(())
}

/// A dispute closed. Won: status flip only. Lost: the provider clawed the
/// funds back, so a full-amount reversal row is written too.
#[instrument(skip_all, fields(charge_ref = %ev.charge_ref))]
pub async fn apply_dispute_closed(
    ctx: &Ctx,
    ev: &DisputeClosed,
    event_key: &str,
) -> Result<Applied, CoreApiError> {
    let original = require_original(ctx, ev.provider, &ev.charge_ref).await?;

    if ev.won {
        ctx.store
            .update_payment_status(
                original.id,
                PaymentStatus::DisputeWon,
                None,
            )
            .await?;
        return Ok(Applied::StateChanged);
    }

    let subject = original
        .subscription_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| ev.charge_ref.clone());
    let guard = locks::lock_subscription(&ctx.cache, &subject)
        .await?
        .ok_or_else(|| {
            CoreApiError::provider_unavailable(format!(
                "Subject {subject} is locked"
            ))
        })?;
    let gross = original.gross_cents;
    let result = refund_locked(
        ctx,
        gross,
        None,
        ev.occurred_at,
        original,
        event_key,
        PaymentStatus::DisputeLost,
    )
    .await;
    guard.release().await;
    result.map(Applied::Payment)
}

async fn require_original(
    ctx: &Ctx,
    provider: common::api::models::Provider,
    charge_ref: &str,
) -> Result<Payment, CoreApiError> {
    let payment = ctx
        .store
        .find_payment_by_charge_ref(provider, charge_ref)
        .await?
        .ok_or_else(|| {
            CoreApiError::provider_permanent(format!(
                "No payment with charge ref {charge_ref}"
            ))
        })?;
    if payment.payment_type == PaymentType::Payout {
        return Err(CoreApiError::provider_permanent(
            "Refund events cannot target payout rows",
        ));
    }
    Ok(payment)
}
