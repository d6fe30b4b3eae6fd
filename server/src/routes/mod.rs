//! Routes and handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::api::error::{CoreApiError, ErrorResponse, ToHttpStatus};
use patron_core::{context::Ctx, webhook::processor::QueueHandle};

/// Admin operations.
pub mod admin;
/// Checkout session endpoints.
pub mod checkout;
/// Job health.
pub mod health;
/// Token-gated subscription management.
pub mod manage;
/// Webhook ingestion endpoints.
pub mod webhooks;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Ctx,
    /// Async webhook queue; absent under `test`, where ingestion runs
    /// inline.
    pub queue: Option<QueueHandle>,
}

/// Wrapper giving [`CoreApiError`] an axum [`IntoResponse`] impl.
#[derive(Debug)]
pub struct ApiError(pub CoreApiError);

impl From<CoreApiError> for ApiError {
    fn from(err: CoreApiError) -> Self {
        Self(err)
    }
}

impl From<patron_core::traits::ProviderError> for ApiError {
    fn from(err: patron_core::traits::ProviderError) -> Self {
        Self(err.into())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.to_http_status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(ErrorResponse::from(self.0));
        (status, body).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Webhooks
        .route("/webhooks/stripe", post(webhooks::stripe))
        .route("/webhooks/paystack", post(webhooks::paystack))
        // Checkout
        .route("/checkout/session", post(checkout::create_session))
        .route(
            "/checkout/session/{id}/verify",
            get(checkout::verify_session),
        )
        .route("/config/my-minimum", get(checkout::my_minimum))
        // Subscriber self-service
        .route("/subscription/manage/{token}", get(manage::view))
        .route("/unsubscribe/{token}", post(manage::unsubscribe))
        // Ops
        .route("/health/jobs", get(health::jobs))
        .route(
            "/admin/webhooks/{event_id}/retry",
            post(admin::retry_webhook),
        )
        .route("/admin/payouts/stuck", get(admin::stuck_payouts))
        .route(
            "/admin/payouts/finalize-otp",
            post(admin::finalize_otp),
        )
        .route("/admin/reconcile", post(admin::reconcile))
        .route(
            "/admin/subscribers/resolve",
            post(admin::resolve_subscriber),
        )
        .route("/admin/refunds", post(admin::refund))
        .with_state(state)
}
