//! Webhook ingestion endpoints.
//!
//! Bodies are taken raw: signature verification must see the exact bytes
//! the provider signed, so JSON extraction happens inside the core after
//! the MAC checks out.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use common::api::models::{Provider, WebhookAck};
use patron_core::webhook;

use super::{ApiError, AppState};

pub async fn stripe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    ingest(state, Provider::Stripe, "stripe-signature", headers, body)
        .await
}

pub async fn paystack(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    ingest(
        state,
        Provider::Paystack,
        "x-paystack-signature",
        headers,
        body,
    )
    .await
}

async fn ingest(
    state: AppState,
    provider: Provider,
    header_name: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get(header_name)
        .and_then(|value| value.to_str().ok());
    let ack = webhook::ingest(
        &state.ctx,
        state.queue.as_ref(),
        provider,
        signature,
        &body,
    )
    .await?;
    Ok(Json(ack))
}
