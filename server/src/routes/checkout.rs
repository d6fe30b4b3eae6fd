//! Checkout session endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use common::{
    api::{
        error::CoreApiError,
        models::{
            CheckoutRequest, CheckoutResponse, CheckoutVerifyResponse,
            CreatorMinimumResponse,
        },
    },
    money::UsdRate,
};
use patron_core::{checkout, fees};
use rust_decimal::prelude::ToPrimitive;

use crate::auth::CreatorId;

use super::{ApiError, AppState};

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let resp = checkout::create_checkout_session(&state.ctx, &req).await?;
    Ok(Json(resp))
}

pub async fn verify_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<CheckoutVerifyResponse>, ApiError> {
    let resp =
        checkout::verify_checkout_session(&state.ctx, &session_id).await?;
    Ok(Json(resp))
}

/// The dynamic minimum for the authenticated creator.
pub async fn my_minimum(
    State(state): State<AppState>,
    CreatorId(creator_id): CreatorId,
) -> Result<Json<CreatorMinimumResponse>, ApiError> {
    let creator = state
        .ctx
        .store
        .get_creator(creator_id)
        .await
        .map_err(CoreApiError::from)?
        .ok_or_else(|| CoreApiError::not_found("Unknown creator"))?;

    let rate = if creator.currency.is_usd() {
        UsdRate::ONE
    } else {
        state.ctx.fx.usd_rate(&creator.currency).await?
    };
    let subscriber_count = state
        .ctx
        .store
        .count_active_subscribers(creator_id)
        .await
        .map_err(CoreApiError::from)?;
    let minimum = fees::creator_minimum(
        &creator.country,
        &creator.currency,
        subscriber_count,
        rate,
    );
    Ok(Json(CreatorMinimumResponse {
        minimum_usd: minimum.minimum_usd_cents,
        minimum_local: minimum.minimum_local_cents,
        currency: minimum.currency,
        net_margin_rate: minimum
            .net_margin_rate
            .to_f64()
            .unwrap_or_default(),
        fixed_cents: minimum.fixed_cents,
    }))
}
