//! Admin operations: thin wrappers over the core, role-gated, with
//! fresh-session checks on anything destructive.

use axum::{
    extract::{Path, State},
    Json,
};
use common::{
    api::{
        error::CoreApiError,
        models::{
            FinalizeOtpRequest, ReconcileRequest, RefundRequest,
            ResolveSubscriberRequest, WebhookAck,
        },
    },
    api::models::Provider,
    time::TimestampMs,
};
use patron_core::{
    models::{Payment, PaymentStatus, PaymentType},
    payout,
    reconcile::{self, ReconcileReport},
    webhook,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::Admin;

use super::{ApiError, AppState};

/// Re-run a failed or dead-lettered webhook event.
pub async fn retry_webhook(
    State(state): State<AppState>,
    admin: Admin,
    Path(event_id): Path<String>,
) -> Result<Json<WebhookAck>, ApiError> {
    admin.require_fresh(TimestampMs::now())?;
    let ack = webhook::retry_event(&state.ctx, &event_id).await?;
    Ok(Json(ack))
}

#[derive(Serialize)]
pub struct StuckPayout {
    pub payment_id: Uuid,
    pub creator_id: Uuid,
    pub amount_cents: i64,
    pub age_secs: u64,
    pub transfer_code: Option<String>,
}

/// List payouts awaiting an OTP, oldest first.
pub async fn stuck_payouts(
    State(state): State<AppState>,
    _admin: Admin,
) -> Result<Json<Vec<StuckPayout>>, ApiError> {
    let now = TimestampMs::now();
    let mut payouts = state
        .ctx
        .store
        .list_otp_pending_payouts()
        .await
        .map_err(CoreApiError::from)?;
    payouts.sort_by_key(|p| p.created_at);

    Ok(Json(
        payouts
            .iter()
            .map(|p| StuckPayout {
                payment_id: p.id,
                creator_id: p.creator_id,
                amount_cents: p.amount_cents,
                age_secs: payout::otp_pending_age(p, now).as_secs(),
                transfer_code: p.paystack_transfer_code.clone(),
            })
            .collect(),
    ))
}

/// Submit the OTP for a pending transfer.
pub async fn finalize_otp(
    State(state): State<AppState>,
    admin: Admin,
    Json(req): Json<FinalizeOtpRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    admin.require_fresh(TimestampMs::now())?;
    payout::finalize_otp(&state.ctx, req.payment_id, &req.otp).await?;
    Ok(Json(json!({ "finalized": true })))
}

/// Trigger a reconciliation run.
pub async fn reconcile(
    State(state): State<AppState>,
    _admin: Admin,
    Json(req): Json<ReconcileRequest>,
) -> Result<Json<ReconcileReport>, ApiError> {
    let window_hours = req.window_hours.unwrap_or(48);
    let report =
        reconcile::run(&state.ctx, window_hours, req.auto_fix).await?;
    Ok(Json(report))
}

/// Lift a subscriber's block.
pub async fn resolve_subscriber(
    State(state): State<AppState>,
    _admin: Admin,
    Json(req): Json<ResolveSubscriberRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .ctx
        .store
        .set_subscriber_blocked(req.subscriber_id, None)
        .await
        .map_err(CoreApiError::from)?;
    Ok(Json(json!({ "resolved": true })))
}

/// Issue a refund at the provider. The ledger rows are written when the
/// provider's refund webhook comes back through the applier, keeping a
/// single financial write path.
pub async fn refund(
    State(state): State<AppState>,
    admin: Admin,
    Json(req): Json<RefundRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    admin.require_fresh(TimestampMs::now())?;

    let payment = state
        .ctx
        .store
        .get_payment(req.payment_id)
        .await
        .map_err(CoreApiError::from)?
        .ok_or_else(|| CoreApiError::not_found("Unknown payment"))?;
    validate_refundable(&payment, req.amount_cents)?;

    let charge_ref =
        payment.provider_charge_ref.as_deref().ok_or_else(|| {
            CoreApiError::invalid_request(
                "Payment has no provider reference",
            )
        })?;

    let refund_ref = match payment.provider {
        Provider::Stripe => {
            state
                .ctx
                .stripe
                .create_refund(charge_ref, req.amount_cents)
                .await?
        }
        Provider::Paystack => {
            state
                .ctx
                .paystack
                .create_refund(charge_ref, req.amount_cents)
                .await?
        }
    };
    Ok(Json(json!({ "refund_ref": refund_ref })))
}

fn validate_refundable(
    payment: &Payment,
    amount_cents: Option<i64>,
) -> Result<(), ApiError> {
    if payment.payment_type == PaymentType::Payout {
        return Err(ApiError(CoreApiError::invalid_request(
            "Payouts cannot be refunded",
        )));
    }
    if payment.status != PaymentStatus::Succeeded {
        return Err(ApiError(CoreApiError::conflict(format!(
            "Payment is {}, not succeeded",
            payment.status
        ))));
    }
    if let Some(amount) = amount_cents {
        if amount <= 0 || amount > payment.gross_cents {
            return Err(ApiError(CoreApiError::invalid_request(
                "Refund amount out of range",
            )));
        }
    }
    Ok(())
}
