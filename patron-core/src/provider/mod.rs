//! Provider REST adapters.
//!
//! Each provider is isolated behind its trait in [`crate::traits`]; these
//! modules are the production implementations, thin `reqwest` clients
//! exposing only the calls the core consumes. Every request runs under the
//! shared 10-second timeout, and HTTP status classes map onto
//! [`ProviderError`]: 5xx/429/transport are `Unavailable` (retryable),
//! other 4xx are `Permanent`.
//!
//! [`ProviderError`]: crate::traits::ProviderError

use common::constants::PROVIDER_HTTP_TIMEOUT;
use reqwest::StatusCode;

use crate::traits::ProviderError;

/// Stripe adapter.
pub mod stripe;

/// Paystack adapter.
pub mod paystack;

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PROVIDER_HTTP_TIMEOUT)
        .build()
        .expect("Failed to build reqwest Client")
}

/// Classify a non-success response status plus body into a
/// [`ProviderError`].
fn classify_status(status: StatusCode, body: String) -> ProviderError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Unavailable(format!("{status}: {body}"))
    } else {
        ProviderError::Permanent(format!("{status}: {body}"))
    }
}
