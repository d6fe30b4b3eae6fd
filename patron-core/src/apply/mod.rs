//! The event applier: the only writer that turns provider events into
//! financial facts.
//!
//! Invoked once per decoded event, inside the `charge:{event_id}` lock that
//! serializes competing webhook retries. Every handler is idempotent: the
//! first thing each does is look for a payment row already carrying its
//! event key, and every multi-row write goes through a single-transaction
//! `Store` method. `Conflict` outcomes mean "already done" and are
//! reported as success.

use common::{api::error::CoreApiError, money, time::TimestampMs};
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    context::Ctx,
    models::{Reporting, ReportingRateSource},
    webhook::event::{BillingEvent, DecodedEvent},
};

mod charge;
mod lifecycle;
mod refund;
mod transfer;

pub use charge::apply_charge_success;
pub use refund::{apply_dispute_closed, apply_dispute_opened, apply_refund};

/// What applying an event did, reported back to the webhook pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    /// A payment row was created or transitioned.
    Payment(Uuid),
    /// The event mutated non-payment state (subscription lifecycle,
    /// creator account).
    StateChanged,
    /// Unknown or inapplicable event; stored and acknowledged only.
    Skipped,
}

impl Applied {
    pub fn payment_id(&self) -> Option<Uuid> {
        match self {
            Self::Payment(id) => Some(*id),
            _ => None,
        }
    }
}

/// Apply one decoded event. Callers hold the `charge:{event_id}` lock.
#[instrument(skip_all, fields(event_key = %decoded.event_key))]
pub async fn apply_event(
    ctx: &Ctx,
    decoded: &DecodedEvent,
) -> Result<Applied, CoreApiError> {
    match &decoded.event {
        BillingEvent::ChargeSucceeded(ev) => {
            apply_charge_success(ctx, ev, &decoded.event_key)
                .await
                .map(Applied::Payment)
        }
        BillingEvent::ChargeRefunded(ev) => {
            apply_refund(ctx, ev, &decoded.event_key)
                .await
                .map(Applied::Payment)
        }
        BillingEvent::DisputeOpened(ev) => {
            apply_dispute_opened(ctx, ev).await.map(|_| {
                Applied::StateChanged
            })
        }
        BillingEvent::DisputeClosed(ev) => {
            apply_dispute_closed(ctx, ev, &decoded.event_key).await
        }
        BillingEvent::PaymentFailed(ev) => {
            lifecycle::apply_payment_failed(ctx, ev, &decoded.event_key)
                .await
        }
        BillingEvent::SubscriptionUpdated(ev) => {
            lifecycle::apply_subscription_updated(ctx, ev)
                .await
                .map(|_| Applied::StateChanged)
        }
        BillingEvent::SubscriptionDeleted(ev) => {
            lifecycle::apply_subscription_deleted(ctx, ev)
                .await
                .map(|_| Applied::StateChanged)
        }
        BillingEvent::TransferRequiresOtp(ev) => {
            transfer::apply_transfer_requires_otp(ctx, ev)
                .await
                .map(Applied::Payment)
        }
        BillingEvent::TransferSucceeded(ev) => {
            transfer::apply_transfer_succeeded(ctx, ev)
                .await
                .map(Applied::Payment)
        }
        BillingEvent::TransferFailed(ev) => {
            transfer::apply_transfer_failed(ctx, ev)
                .await
                .map(Applied::Payment)
        }
        BillingEvent::AccountUpdated(ev) => {
            lifecycle::apply_account_updated(ctx, ev)
                .await
                .map(|_| Applied::StateChanged)
        }
        BillingEvent::Unknown { event_type } => {
            info!(%event_type, "Skipping unknown event type");
            Ok(Applied::Skipped)
        }
    }
}

/// Compute the USD reporting shadow for a charge.
///
/// Provider-reported settlement rates win; otherwise the FX service is
/// consulted; USD short-circuits to the identity rate. FX unavailability
/// bubbles so the retry scheduler backs off rather than persisting a bogus
/// rate.
pub(crate) async fn compute_reporting(
    ctx: &Ctx,
    gross_cents: i64,
    fee_cents: i64,
    net_cents: i64,
    currency: &money::CurrencyCode,
    provider_rate: Option<Decimal>,
    occurred_at: TimestampMs,
) -> Result<Reporting, CoreApiError> {
    let (rate, rate_source) = if currency.is_usd() {
        (money::UsdRate::ONE, ReportingRateSource::CurrentRate)
    } else if let Some(reported) = provider_rate {
        match money::UsdRate::new(reported) {
            Ok(rate) => (rate, ReportingRateSource::StripeReported),
            Err(_) => {
                warn!(%reported, "Ignoring non-positive provider rate");
                let rate = ctx.fx.usd_rate(currency).await?;
                (rate, ReportingRateSource::CurrentRate)
            }
        }
    } else {
        let rate = ctx.fx.usd_rate(currency).await?;
        (rate, ReportingRateSource::CurrentRate)
    };

    Ok(reporting_at_rate(
        gross_cents,
        fee_cents,
        net_cents,
        currency,
        rate,
        rate_source,
        occurred_at,
        false,
    ))
}

/// Build the reporting shadow at a known rate. Used directly by refunds,
/// which copy the original payment's rate so USD totals cancel exactly.
#[allow(clippy::too_many_arguments)]
pub(crate) fn reporting_at_rate(
    gross_cents: i64,
    fee_cents: i64,
    net_cents: i64,
    currency: &money::CurrencyCode,
    rate: money::UsdRate,
    rate_source: ReportingRateSource,
    rate_timestamp: TimestampMs,
    is_estimated: bool,
) -> Reporting {
    let to_usd = |cents: i64| {
        money::local_minor_to_usd_cents(cents, rate, currency)
            .unwrap_or(cents)
    };
    Reporting {
        currency: money::CurrencyCode::usd(),
        gross_cents: to_usd(gross_cents),
        fee_cents: to_usd(fee_cents),
        net_cents: to_usd(net_cents),
        exchange_rate: rate.as_decimal(),
        rate_source,
        rate_timestamp,
        is_estimated,
    }
}
