//! Charge-success application: one-time checkouts and recurring renewals.

use std::time::Duration;

use chrono::Months;
use common::{
    api::{
        error::CoreApiError,
        models::{BillingInterval, Provider},
    },
    time::TimestampMs,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    context::Ctx,
    fees,
    locks,
    models::{
        Activity, ActivityKind, Creator, Payment, PaymentStatus,
        PaymentType, Subscription,
    },
    traits::CheckedCharge,
    webhook::event::ChargeSucceeded,
};

/// Apply a settled charge. Returns the id of the (new or pre-existing)
/// payment row.
///
/// Locking: `subscription:{provider_ref}` where the ref is the Stripe
/// subscription id when bound, else the checkout/charge reference. The
/// lock spans resolve, fee math, and the transactional persist.
#[instrument(skip_all, fields(charge_ref = %ev.charge_ref))]
pub async fn apply_charge_success(
    ctx: &Ctx,
    ev: &ChargeSucceeded,
    event_key: &str,
) -> Result<Uuid, CoreApiError> {
    // Replays of an already-applied event are success, not work.
    if let Some(existing) =
        ctx.store.find_payment_by_event_id(event_key).await?
    {
        return Ok(existing.id);
    }

    let subject = ev
        .stripe_subscription_id
        .as_deref()
        .unwrap_or(ev.charge_ref.as_str());
    let guard = locks::lock_subscription(&ctx.cache, subject)
        .await?
        .ok_or_else(|| {
            // Another worker holds the subject; back off and retry.
            CoreApiError::provider_unavailable(format!(
                "Subject {subject} is locked"
            ))
        })?;

    let result = apply_locked(ctx, ev, event_key).await;
    guard.release().await;
    result
}

async fn apply_locked(
    ctx: &Ctx,
    ev: &ChargeSucceeded,
    event_key: &str,
) -> Result<Uuid, CoreApiError> {
    // Re-check under the lock: a competing worker may have applied this
    // charge between our first check and lock acquisition.
    if let Some(existing) =
        ctx.store.find_payment_by_event_id(event_key).await?
    {
        return Ok(existing.id);
    }
    if let Some(existing) = ctx
        .store
        .find_payment_by_charge_ref(ev.provider, &ev.charge_ref)
        .await?
    {
        if existing.payment_type.is_charge() {
            return Ok(existing.id);
        }
    }

    let now = TimestampMs::now();
    let creator = resolve_creator(ctx, ev).await?;

    let subscriber_email = ev.subscriber_email.as_deref().ok_or_else(|| {
        CoreApiError::provider_permanent(
            "Charge event carries no subscriber email",
        )
    })?;
    let subscriber =
        ctx.store.get_or_create_subscriber(subscriber_email).await?;

    // Resolve-or-create the subscription and bind provider identifiers.
    let (mut sub, is_new) =
        resolve_subscription(ctx, ev, &creator, subscriber.id, now).await?;

    // Recompute the fee breakdown from the event amount. The provider's
    // gross/net are authoritative; our fee is stored alongside with the
    // delta kept for debugging.
    let cross_border = creator.is_cross_border();
    let fees = fees::breakdown_from_gross(
        ev.amount_cents,
        sub.fee_model,
        sub.fee_mode,
        cross_border,
    );
    let fee_delta = ev.provider_fee_cents.map(|provider_fee| {
        let delta = provider_fee - fees.fee_cents;
        if delta != 0 {
            warn!(
                provider_fee,
                our_fee = fees.fee_cents,
                delta,
                "Provider fee differs from recomputed fee"
            );
        }
        delta
    });

    let reporting = super::compute_reporting(
        ctx,
        fees.gross_cents,
        fees.fee_cents,
        fees.net_cents,
        &ev.currency,
        ev.provider_exchange_rate,
        ev.occurred_at,
    )
    .await?;

    // Advance the FSM. A charge on a canceled subscription is real money
    // with nowhere to go; keep the row, leave the tombstone alone.
    let period_end = effective_period_end(ev);
    let mut ltv_increment = fees.net_cents;
    match sub.apply_charge_success(period_end, now) {
        Ok(()) => (),
        Err(e) => {
            warn!(
                subscription_id = %sub.id,
                "Charge for canceled subscription recorded without \
                 state change: {e:#}"
            );
            ltv_increment = 0;
        }
    }

    let payment = Payment {
        id: Uuid::new_v4(),
        subscription_id: Some(sub.id),
        creator_id: creator.id,
        subscriber_id: Some(subscriber.id),
        amount_cents: fees.gross_cents,
        currency: ev.currency.clone(),
        gross_cents: fees.gross_cents,
        fee_cents: fees.fee_cents,
        net_cents: fees.net_cents,
        creator_fee_cents: fees.creator_fee_cents,
        subscriber_fee_cents: fees.subscriber_fee_cents,
        fee_model: fees.fee_model,
        payment_type: match ev.interval {
            BillingInterval::Month => PaymentType::Recurring,
            BillingInterval::OneTime => PaymentType::OneTime,
        },
        status: PaymentStatus::Succeeded,
        provider: ev.provider,
        provider_event_id: Some(event_key.to_owned()),
        provider_charge_ref: Some(ev.charge_ref.clone()),
        paystack_transfer_code: None,
        occurred_at: ev.occurred_at,
        reporting,
        fee_delta_cents: fee_delta,
        created_at: now,
    };
    if cfg!(debug_assertions) {
        payment.assert_invariants();
    }

    let mut activities = vec![
        Activity {
            id: Uuid::new_v4(),
            user_id: creator.id,
            kind: ActivityKind::PaymentReceived {
                payment_id: payment.id,
                amount_cents: payment.net_cents,
                currency: payment.currency.clone(),
            },
            occurred_at: ev.occurred_at,
        },
    ];
    if is_new {
        activities.push(Activity {
            id: Uuid::new_v4(),
            user_id: subscriber.id,
            kind: ActivityKind::SubscriptionStarted {
                subscription_id: sub.id,
            },
            occurred_at: ev.occurred_at,
        });
    }

    let payment_id = payment.id;
    let subscription_id = sub.id;
    ctx.store
        .persist_charge(CheckedCharge {
            payment,
            subscription: sub,
            subscription_is_new: is_new,
            ltv_increment_cents: ltv_increment,
            activities,
        })
        .await?;

    if let Some(checkout_ref) = ev.checkout_ref.as_deref() {
        ctx.store
            .link_checkout_session(checkout_ref, subscription_id)
            .await?;
    }

    info!(%payment_id, %subscription_id, "Applied charge");
    Ok(payment_id)
}

/// Creators are attributed via event metadata, or through the existing
/// subscription binding for renewals that carry none.
async fn resolve_creator(
    ctx: &Ctx,
    ev: &ChargeSucceeded,
) -> Result<Creator, CoreApiError> {
    let creator_id = match ev.creator_id {
        Some(id) => Some(id),
        None => match ev.stripe_subscription_id.as_deref() {
            Some(stripe_id) => ctx
                .store
                .find_subscription_by_stripe_id(stripe_id)
                .await?
                .map(|sub| sub.creator_id),
            None => None,
        },
    };
    let creator_id = creator_id.ok_or_else(|| {
        CoreApiError::provider_permanent(
            "Charge event is not attributable to a creator",
        )
    })?;
    ctx.store.get_creator(creator_id).await?.ok_or_else(|| {
        CoreApiError::provider_permanent(format!(
            "Unknown creator {creator_id}"
        ))
    })
}

async fn resolve_subscription(
    ctx: &Ctx,
    ev: &ChargeSucceeded,
    creator: &Creator,
    subscriber_id: Uuid,
    now: TimestampMs,
) -> Result<(Subscription, bool), CoreApiError> {
    // Prefer the provider-side binding; fall back to the unique
    // (creator, subscriber, interval) tuple.
    if let Some(stripe_id) = ev.stripe_subscription_id.as_deref() {
        if let Some(sub) =
            ctx.store.find_subscription_by_stripe_id(stripe_id).await?
        {
            return Ok((sub, false));
        }
    }
    if let Some(sub) = ctx
        .store
        .find_subscription(creator.id, subscriber_id, ev.interval)
        .await?
    {
        return Ok((sub, false));
    }

    let mut sub = Subscription::new_active(
        creator.id,
        subscriber_id,
        ev.amount_cents,
        ev.currency.clone(),
        ev.interval,
        ev.provider,
        creator.fee_mode,
        effective_period_end(ev),
        now,
    );
    match ev.provider {
        Provider::Stripe => {
            sub.stripe_subscription_id = ev.stripe_subscription_id.clone();
            sub.stripe_customer_id = ev.stripe_customer_id.clone();
        }
        Provider::Paystack => {
            sub.paystack_authorization_enc = ev
                .paystack_authorization_code
                .as_deref()
                .map(|code| ctx.pii.encrypt(code));
        }
    }
    if cfg!(debug_assertions) {
        sub.assert_invariants();
    }
    Ok((sub, true))
}

/// Provider-reported period end when available; else one calendar month
/// from the event for recurring charges (the regional processor reports no
/// period).
fn effective_period_end(ev: &ChargeSucceeded) -> Option<TimestampMs> {
    match ev.interval {
        BillingInterval::OneTime => None,
        BillingInterval::Month => ev.period_end.or_else(|| {
            let dt = ev.occurred_at.to_datetime();
            dt.checked_add_months(Months::new(1))
                .map(TimestampMs::from_datetime)
                // Fallback: 30 flat days, only reachable near the end of
                // chrono's representable range.
                .or_else(|| {
                    Some(
                        ev.occurred_at.saturating_add(Duration::from_secs(
                            30 * 24 * 3600,
                        )),
                    )
                })
        }),
    }
}
