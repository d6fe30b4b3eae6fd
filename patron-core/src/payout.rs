//! Payout initiation and OTP finalization (regional processor).
//!
//! The payout `Payment` row is created *before* the transfer call, so a
//! crash between the call and its acknowledgement is recoverable: the row
//! sits in `pending` and reconciliation / the stuck-transfer monitor pick
//! it up. Status then advances from transfer webhooks (§ the transfer
//! applier), not from the synchronous API response, except for the
//! OTP-pending transition which the response reports directly.

use common::{
    api::{error::CoreApiError, models::Provider},
    time::TimestampMs,
};
use secrecy::Secret;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    apply::reporting_at_rate,
    context::Ctx,
    models::{
        Activity, ActivityKind, Creator, Payment, PaymentStatus,
        PaymentType, PayoutAccountStatus, ReportingRateSource,
    },
    traits::{Notification, RecipientRequest, TransferInit,
        TransferInitStatus, TransferRequest},
};

/// Smallest net balance worth paying out, in minor units of the creator's
/// currency.
const MIN_PAYOUT_MINOR: i64 = 1_000;

/// Cut a payout for everything the creator is owed. Returns the payout
/// payment id, or `None` when there is nothing (or too little) to pay.
#[instrument(skip_all, fields(creator_id = %creator.id))]
pub async fn initiate_creator_payout(
    ctx: &Ctx,
    creator: &Creator,
) -> Result<Option<Uuid>, CoreApiError> {
    if creator.payout_status != PayoutAccountStatus::Active {
        info!(
            status = ?creator.payout_status,
            "Skipping payout for non-active account"
        );
        return Ok(None);
    }
    if !creator.has_paystack() {
        // Card-processor creators are paid out by the provider directly.
        return Ok(None);
    }

    let owed_cents =
        ctx.store.creator_unpaid_net_cents(creator.id).await?;
    if owed_cents < MIN_PAYOUT_MINOR {
        return Ok(None);
    }

    let now = TimestampMs::now();
    let payout_id = Uuid::new_v4();
    let reference = format!("po_{}", payout_id.simple());

    // Reporting shadow for the outbound row; estimated until settlement.
    let rate = if creator.currency.is_usd() {
        common::money::UsdRate::ONE
    } else {
        ctx.fx.usd_rate(&creator.currency).await?
    };
    let reporting = reporting_at_rate(
        owed_cents,
        0,
        owed_cents,
        &creator.currency,
        rate,
        ReportingRateSource::CurrentRate,
        now,
        true,
    );

    let payout = Payment {
        id: payout_id,
        subscription_id: None,
        creator_id: creator.id,
        subscriber_id: None,
        amount_cents: owed_cents,
        currency: creator.currency.clone(),
        gross_cents: owed_cents,
        fee_cents: 0,
        net_cents: owed_cents,
        creator_fee_cents: None,
        subscriber_fee_cents: None,
        fee_model: crate::models::FeeModel::SplitV1,
        payment_type: PaymentType::Payout,
        status: PaymentStatus::Pending,
        provider: Provider::Paystack,
        provider_event_id: None,
        provider_charge_ref: Some(reference.clone()),
        paystack_transfer_code: None,
        occurred_at: now,
        reporting,
        fee_delta_cents: None,
        created_at: now,
    };
    ctx.store.insert_payment(&payout).await?;
    ctx.store
        .append_activity(&Activity {
            id: Uuid::new_v4(),
            user_id: creator.id,
            kind: ActivityKind::PayoutInitiated {
                payment_id: payout_id,
                amount_cents: owed_cents,
            },
            occurred_at: now,
        })
        .await?;

    let recipient_code = resolve_recipient(ctx, creator).await?;
    let init = ctx
        .paystack
        .initiate_transfer(&TransferRequest {
            recipient_code,
            amount_cents: owed_cents,
            currency: creator.currency.clone(),
            reference,
            reason: format!("Creator payout {payout_id}"),
        })
        .await;

    match init {
        Ok(TransferInit {
            transfer_code,
            status,
        }) => {
            ctx.store
                .set_payment_transfer_code(payout_id, &transfer_code)
                .await?;
            match status {
                TransferInitStatus::RequiresOtp => {
                    ctx.store
                        .update_payment_status(
                            payout_id,
                            PaymentStatus::OtpPending,
                            None,
                        )
                        .await?;
                    info!(%payout_id, "Transfer awaiting OTP");
                }
                // Pending or synchronously successful: the transfer
                // webhook is authoritative for settlement either way.
                TransferInitStatus::Pending
                | TransferInitStatus::Success => (),
            }
            Ok(Some(payout_id))
        }
        Err(err) if err.is_retryable() => {
            // The transfer may or may not exist provider-side; leave the
            // row pending for reconciliation to settle.
            warn!(%payout_id, "Transfer initiation unconfirmed: {err}");
            Err(err.into())
        }
        Err(err) => {
            ctx.store
                .update_payment_status(
                    payout_id,
                    PaymentStatus::Failed,
                    None,
                )
                .await?;
            if let Err(e) = ctx
                .notifier
                .send(Notification::PayoutFailed {
                    creator_id: creator.id,
                    payment_id: payout_id,
                })
                .await
            {
                warn!("Failed to send payout-failed notification: {e:#}");
            }
            Err(err.into())
        }
    }
}

/// Submit the operator OTP for an `otp_pending` payout. On success the row
/// returns to `pending`; the transfer webhook settles it.
#[instrument(skip_all, fields(payment_id = %payment_id))]
pub async fn finalize_otp(
    ctx: &Ctx,
    payment_id: Uuid,
    otp: &str,
) -> Result<(), CoreApiError> {
    let payout = ctx
        .store
        .get_payment(payment_id)
        .await?
        .ok_or_else(|| CoreApiError::not_found("Unknown payment"))?;
    if payout.payment_type != PaymentType::Payout {
        return Err(CoreApiError::invalid_request("Not a payout"));
    }
    if payout.status != PaymentStatus::OtpPending {
        return Err(CoreApiError::conflict(format!(
            "Payout is {}, not otp_pending",
            payout.status
        )));
    }
    let transfer_code =
        payout.paystack_transfer_code.as_deref().ok_or_else(|| {
            CoreApiError::internal("otp_pending payout has no transfer code")
        })?;

    ctx.paystack.finalize_transfer(transfer_code, otp).await?;
    ctx.store
        .update_payment_status(payment_id, PaymentStatus::Pending, None)
        .await?;
    info!("OTP accepted; awaiting transfer settlement");
    Ok(())
}

/// Resolve (or create and cache) the transfer recipient for a creator,
/// keyed by their bank details.
async fn resolve_recipient(
    ctx: &Ctx,
    creator: &Creator,
) -> Result<String, CoreApiError> {
    if let Some(code) = creator.paystack_recipient_code.as_deref() {
        return Ok(code.to_owned());
    }

    let bank_code = creator.bank_code.as_deref().ok_or_else(|| {
        CoreApiError::invalid_request("Creator has no bank on file")
    })?;
    let account_number: Secret<String> = creator
        .bank_account_enc
        .as_deref()
        .ok_or_else(|| {
            CoreApiError::invalid_request("Creator has no bank on file")
        })
        .and_then(|blob| {
            ctx.pii.decrypt(blob).map_err(|e| {
                CoreApiError::internal(format!(
                    "Bank account decryption failed: {e}"
                ))
            })
        })?;

    let code = ctx
        .paystack
        .create_transfer_recipient(&RecipientRequest {
            name: creator.display_name.clone(),
            account_number,
            bank_code: bank_code.to_owned(),
            currency: creator.currency.clone(),
        })
        .await?;
    ctx.store
        .set_creator_recipient_code(creator.id, &code)
        .await?;
    Ok(code)
}

/// Age of an `otp_pending` payout, measured from its creation.
pub fn otp_pending_age(
    payout: &Payment,
    now: TimestampMs,
) -> std::time::Duration {
    now.abs_diff(payout.created_at)
}
