//! Provider vs. ledger diffing and repair.
//!
//! Nightly (and on demand from the admin surface), over a sliding window:
//! every settled provider transaction must have a matching payment row.
//! Misses attributable to a known creator are reported, and healed when
//! `auto_fix` is set by pushing a synthesized event (id `manual_{ref}`)
//! through the regular charge applier, which keeps this path idempotent
//! and keeps the applier the only financial writer.

use std::time::Duration;

use common::{
    api::{error::CoreApiError, models::{BillingInterval, Provider}},
    time::TimestampMs,
};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{
    apply,
    context::Ctx,
    traits::{OpsAlert, ProviderTransaction},
    webhook::event::ChargeSucceeded,
};

/// Outcome of one reconciliation run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub window_hours: u32,
    pub provider_transactions: usize,
    /// Settled provider transactions with no local payment row.
    pub discrepancies: Vec<String>,
    /// How many of those were healed this run.
    pub healed: usize,
    /// Settled transactions we cannot attribute to any creator; these need
    /// a human.
    pub unattributable: Vec<String>,
}

/// Run reconciliation over the trailing `window_hours`.
#[instrument(skip_all, fields(window_hours, auto_fix))]
pub async fn run(
    ctx: &Ctx,
    window_hours: u32,
    auto_fix: bool,
) -> Result<ReconcileReport, CoreApiError> {
    let since = TimestampMs::now()
        .saturating_sub(Duration::from_secs(u64::from(window_hours) * 3600));

    let mut report = ReconcileReport {
        window_hours,
        ..Default::default()
    };

    let stripe_txs = ctx.stripe.list_transactions_since(since).await?;
    reconcile_provider(ctx, Provider::Stripe, stripe_txs, auto_fix, &mut report)
        .await?;

    let paystack_txs = ctx.paystack.list_transactions_since(since).await?;
    reconcile_provider(
        ctx,
        Provider::Paystack,
        paystack_txs,
        auto_fix,
        &mut report,
    )
    .await?;

    if !report.discrepancies.is_empty() {
        ctx.alerts
            .raise(OpsAlert::ReconciliationDiscrepancies {
                count: report.discrepancies.len(),
                auto_fixed: report.healed,
            })
            .await
            .ok();
    }
    info!(
        transactions = report.provider_transactions,
        discrepancies = report.discrepancies.len(),
        healed = report.healed,
        "Reconciliation finished"
    );
    Ok(report)
}

async fn reconcile_provider(
    ctx: &Ctx,
    provider: Provider,
    transactions: Vec<ProviderTransaction>,
    auto_fix: bool,
    report: &mut ReconcileReport,
) -> Result<(), CoreApiError> {
    for tx in transactions {
        report.provider_transactions += 1;
        if !tx.is_settled() {
            continue;
        }
        if ctx
            .store
            .find_payment_by_charge_ref(provider, &tx.reference)
            .await?
            .is_some()
        {
            continue;
        }

        let Some(creator_id) = tx.creator_id else {
            report.unattributable.push(tx.reference.clone());
            continue;
        };
        if ctx.store.get_creator(creator_id).await?.is_none() {
            report.unattributable.push(tx.reference.clone());
            continue;
        }

        report.discrepancies.push(tx.reference.clone());
        if !auto_fix {
            continue;
        }

        match heal(ctx, provider, &tx, creator_id).await {
            Ok(()) => report.healed += 1,
            Err(e) => {
                warn!(
                    reference = %tx.reference,
                    "Failed to heal discrepancy: {e}"
                );
            }
        }
    }
    Ok(())
}

/// Replay the missed charge through the applier with a synthesized event
/// id. A second run finds the payment row and does nothing.
async fn heal(
    ctx: &Ctx,
    provider: Provider,
    tx: &ProviderTransaction,
    creator_id: uuid::Uuid,
) -> Result<(), CoreApiError> {
    // A monthly subscription between this pair means the miss was most
    // likely a renewal; otherwise book it as one-time.
    let interval = match tx.subscriber_email.as_deref() {
        Some(email) => {
            let subscriber =
                ctx.store.get_or_create_subscriber(email).await?;
            ctx.store
                .find_subscription(
                    creator_id,
                    subscriber.id,
                    BillingInterval::Month,
                )
                .await?
                .map(|_| BillingInterval::Month)
                .unwrap_or(BillingInterval::OneTime)
        }
        None => BillingInterval::OneTime,
    };

    let synthesized = ChargeSucceeded {
        provider,
        charge_ref: tx.reference.clone(),
        amount_cents: tx.amount_cents,
        currency: tx.currency.clone(),
        interval,
        creator_id: Some(creator_id),
        tier_id: None,
        subscriber_email: tx.subscriber_email.clone(),
        stripe_subscription_id: None,
        stripe_customer_id: None,
        paystack_authorization_code: None,
        checkout_ref: None,
        period_end: None,
        provider_fee_cents: None,
        provider_exchange_rate: None,
        occurred_at: tx.occurred_at,
    };
    let event_key = format!("manual_{}", tx.reference);
    let payment_id =
        apply::apply_charge_success(ctx, &synthesized, &event_key).await?;
    info!(%payment_id, reference = %tx.reference, "Healed missed charge");
    Ok(())
}
