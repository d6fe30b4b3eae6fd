//! Transfer (payout) event application.
//!
//! Payout rows are created by the payout engine *before* the transfer is
//! initiated, so every transfer event is a state transition on an existing
//! row; these handlers are never short-circuited at ingest.

use common::{api::error::CoreApiError, time::TimestampMs};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    context::Ctx,
    models::{Activity, ActivityKind, Payment, PaymentStatus, PayoutAccountStatus},
    traits::Notification,
    webhook::event::{TransferEvent, TransferFailed},
};

/// The provider wants an operator OTP before moving money.
#[instrument(skip_all, fields(transfer_ref = %ev.transfer_ref))]
pub async fn apply_transfer_requires_otp(
    ctx: &Ctx,
    ev: &TransferEvent,
) -> Result<Uuid, CoreApiError> {
    let payout = require_payout(ctx, &ev.transfer_ref).await?;
    match payout.status {
        PaymentStatus::Pending => (),
        PaymentStatus::OtpPending => return Ok(payout.id),
        // A success/failure already landed; OTP request arrived late.
        _ => {
            info!(
                status = %payout.status,
                "Ignoring requires_otp on settled payout"
            );
            return Ok(payout.id);
        }
    }

    ctx.store
        .update_payment_status(payout.id, PaymentStatus::OtpPending, None)
        .await?;
    if let Some(code) = ev.transfer_code.as_deref() {
        ctx.store.set_payment_transfer_code(payout.id, code).await?;
    }
    Ok(payout.id)
}

/// The transfer settled; the creator has been paid.
#[instrument(skip_all, fields(transfer_ref = %ev.transfer_ref))]
pub async fn apply_transfer_succeeded(
    ctx: &Ctx,
    ev: &TransferEvent,
) -> Result<Uuid, CoreApiError> {
    let payout = require_payout(ctx, &ev.transfer_ref).await?;
    if payout.status == PaymentStatus::Succeeded {
        return Ok(payout.id);
    }

    let occurred_at = ev.paid_at.unwrap_or(ev.occurred_at);
    ctx.store
        .update_payment_status(
            payout.id,
            PaymentStatus::Succeeded,
            Some(occurred_at),
        )
        .await?;
    ctx.store
        .append_activity(&Activity {
            id: Uuid::new_v4(),
            user_id: payout.creator_id,
            kind: ActivityKind::PayoutCompleted {
                payment_id: payout.id,
                amount_cents: payout.amount_cents.abs(),
            },
            occurred_at,
        })
        .await?;
    if let Err(e) = ctx
        .notifier
        .send(Notification::PayoutCompleted {
            creator_id: payout.creator_id,
            amount_cents: payout.amount_cents.abs(),
            currency: payout.currency.clone(),
        })
        .await
    {
        // Notification failures never block financial state.
        warn!("Failed to send payout-completed notification: {e:#}");
    }
    info!(payout_id = %payout.id, "Payout succeeded");
    Ok(payout.id)
}

/// The transfer failed. Account-level failures restrict the creator until
/// they fix their bank details.
#[instrument(skip_all, fields(transfer_ref = %ev.transfer_ref))]
pub async fn apply_transfer_failed(
    ctx: &Ctx,
    ev: &TransferFailed,
) -> Result<Uuid, CoreApiError> {
    let payout = require_payout(ctx, &ev.transfer_ref).await?;
    if payout.status == PaymentStatus::Failed {
        return Ok(payout.id);
    }
    if payout.status == PaymentStatus::Succeeded {
        // A reversal after success would need manual review; don't silently
        // flip settled money.
        warn!(
            payout_id = %payout.id,
            reason = %ev.reason,
            "transfer.failed after success; leaving status untouched"
        );
        return Ok(payout.id);
    }

    ctx.store
        .update_payment_status(payout.id, PaymentStatus::Failed, None)
        .await?;
    ctx.store
        .append_activity(&Activity {
            id: Uuid::new_v4(),
            user_id: payout.creator_id,
            kind: ActivityKind::PayoutFailed {
                payment_id: payout.id,
            },
            occurred_at: ev.occurred_at,
        })
        .await?;
    if ev.account_level {
        ctx.store
            .set_creator_payout_status(
                payout.creator_id,
                PayoutAccountStatus::Restricted,
            )
            .await?;
    }
    if let Err(e) = ctx
        .notifier
        .send(Notification::PayoutFailed {
            creator_id: payout.creator_id,
            payment_id: payout.id,
        })
        .await
    {
        warn!("Failed to send payout-failed notification: {e:#}");
    }
    Ok(payout.id)
}

async fn require_payout(
    ctx: &Ctx,
    transfer_ref: &str,
) -> Result<Payment, CoreApiError> {
    ctx.store
        .find_payout_by_transfer_ref(transfer_ref)
        .await?
        .ok_or_else(|| {
            // The payout row is written before the transfer call, so a
            // missing row means the event belongs to another system.
            CoreApiError::provider_permanent(format!(
                "No payout with transfer ref {transfer_ref}"
            ))
        })
}
