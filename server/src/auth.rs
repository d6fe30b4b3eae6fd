//! Admin session extraction.
//!
//! The broader auth middleware (creator login, sessions, roles) lives in
//! the platform gateway; this module only enforces what the core's admin
//! surface needs: a valid role-bearing session token, with fresh-session
//! gating on destructive operations.

use axum::{extract::FromRequestParts, http::request::Parts};
use common::{
    api::error::CoreApiError,
    time::TimestampMs,
    tokens::{self, AdminSession},
};
use uuid::Uuid;

use crate::routes::{ApiError, AppState};

/// Extracts and verifies the `x-admin-token` header.
pub struct Admin(pub AdminSession);

impl Admin {
    /// Gate for destructive operations (refunds, OTP finalize, dead-letter
    /// retry): the session must have been issued recently.
    pub fn require_fresh(&self, now: TimestampMs) -> Result<(), ApiError> {
        if self.0.is_fresh(now) {
            Ok(())
        } else {
            Err(ApiError(CoreApiError::unauthorized(
                "A fresh admin session is required for this operation",
            )))
        }
    }
}

impl FromRequestParts<AppState> for Admin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("x-admin-token")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError(CoreApiError::unauthorized(
                    "Missing admin token",
                ))
            })?;
        let session = tokens::verify_admin_token(
            &state.ctx.session_secret,
            token,
            TimestampMs::now(),
        )
        .map_err(|e| {
            ApiError(CoreApiError::unauthorized(e.to_string()))
        })?;
        Ok(Admin(session))
    }
}

/// The authenticated creator id, injected by the upstream auth middleware
/// as `x-creator-id`.
pub struct CreatorId(pub Uuid);

impl FromRequestParts<AppState> for CreatorId {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-creator-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(CreatorId)
            .ok_or_else(|| {
                ApiError(CoreApiError::unauthorized(
                    "Missing creator identity",
                ))
            })
    }
}
