//! Token-gated subscription management.
//!
//! Manage links embedded in subscriber emails grant one-click access
//! without login: the token is HMAC-signed over the subscription id with a
//! 30-day TTL and verified constant-time.

use axum::{
    extract::{Path, State},
    Json,
};
use common::{
    api::error::CoreApiError,
    money::CurrencyCode,
    time::TimestampMs,
    tokens,
};
use patron_core::models::Subscription;
use serde::Serialize;
use uuid::Uuid;

use super::{ApiError, AppState};

#[derive(Serialize)]
pub struct ManageView {
    pub subscription_id: Uuid,
    pub status: String,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub current_period_end: Option<TimestampMs>,
    pub cancel_at_period_end: bool,
}

impl From<&Subscription> for ManageView {
    fn from(sub: &Subscription) -> Self {
        Self {
            subscription_id: sub.id,
            status: sub.status.as_str().to_owned(),
            amount_cents: sub.amount_cents,
            currency: sub.currency.clone(),
            current_period_end: sub.current_period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
        }
    }
}

async fn subscription_for_token(
    state: &AppState,
    token: &str,
) -> Result<Subscription, ApiError> {
    let subscription_id = tokens::verify_manage_token(
        &state.ctx.session_secret,
        token,
        TimestampMs::now(),
    )
    .map_err(|e| CoreApiError::unauthorized(e.to_string()))?;

    state
        .ctx
        .store
        .get_subscription(subscription_id)
        .await
        .map_err(CoreApiError::from)?
        .ok_or_else(|| {
            ApiError(CoreApiError::not_found("Unknown subscription"))
        })
}

pub async fn view(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ManageView>, ApiError> {
    let sub = subscription_for_token(&state, &token).await?;
    Ok(Json(ManageView::from(&sub)))
}

/// End-of-period cancellation: the subscription stays live until the paid
/// period lapses, mirroring the provider-side state for card processor
/// subscriptions.
pub async fn unsubscribe(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ManageView>, ApiError> {
    let mut sub = subscription_for_token(&state, &token).await?;
    let now = TimestampMs::now();

    sub.request_cancel_at_period_end(now)
        .map_err(|e| CoreApiError::conflict(format!("{e:#}")))?;

    if let Some(stripe_id) = sub.stripe_subscription_id.as_deref() {
        state.ctx.stripe.cancel_subscription(stripe_id, true).await?;
    }
    state
        .ctx
        .store
        .update_subscription(&sub)
        .await
        .map_err(CoreApiError::from)?;

    Ok(Json(ManageView::from(&sub)))
}
