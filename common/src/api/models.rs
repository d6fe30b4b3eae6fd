//! Structs sent across the wire.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{money::CurrencyCode, time::TimestampMs};

/// The payment providers a creator can connect.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum Provider {
    Stripe,
    Paystack,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Paystack => "paystack",
        }
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "paystack" => Ok(Self::Paystack),
            _ => Err(anyhow::anyhow!("Unknown provider: {s}")),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How often a subscriber is charged.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum BillingInterval {
    Month,
    OneTime,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::OneTime => "one_time",
        }
    }
}

impl FromStr for BillingInterval {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "month" => Ok(Self::Month),
            "one_time" => Ok(Self::OneTime),
            _ => Err(anyhow::anyhow!("Unknown billing interval: {s}")),
        }
    }
}

/// `POST /checkout/session` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub creator_id: Uuid,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub interval: BillingInterval,
    /// Required for Paystack checkouts; optional for Stripe (Stripe collects
    /// the email in its hosted page).
    pub subscriber_email: Option<String>,
    /// Untrusted, client-supplied ISO 3166-1 alpha-2 country. Spoofing only
    /// degrades the payer's own experience.
    pub payer_country: Option<String>,
    pub tier_id: Option<Uuid>,
}

/// `POST /checkout/session` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub url: String,
    pub provider: Provider,
    pub session_id: String,
}

/// `GET /checkout/session/:id/verify` response, polled by the client after
/// the provider redirect.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutVerifyResponse {
    pub status: String,
    pub subscription_id: Option<Uuid>,
}

/// Webhook acknowledgement; returned for accepted events, duplicates
/// included.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// `GET /config/my-minimum` response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreatorMinimumResponse {
    pub minimum_usd: i64,
    pub minimum_local: i64,
    pub currency: CurrencyCode,
    pub net_margin_rate: f64,
    pub fixed_cents: i64,
}

/// Health record for one scheduled job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobHealth {
    pub name: String,
    pub last_run_at: Option<TimestampMs>,
    pub duration_ms: Option<i64>,
    pub success: Option<bool>,
    /// True when `last_run_at` is older than 2x the job's expected interval.
    pub stale: bool,
}

/// `GET /health/jobs` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobHealthReport {
    pub jobs: Vec<JobHealth>,
}

/// Admin request to refund a payment, fully (no amount) or partially.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundRequest {
    pub payment_id: Uuid,
    pub amount_cents: Option<i64>,
    pub reason: Option<String>,
}

/// Admin request to finalize an OTP-gated transfer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizeOtpRequest {
    pub payment_id: Uuid,
    pub otp: String,
}

/// Admin request to lift a subscriber block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolveSubscriberRequest {
    pub subscriber_id: Uuid,
    pub note: Option<String>,
}

/// Admin request to re-run reconciliation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub window_hours: Option<u32>,
    pub auto_fix: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::roundtrip;

    #[test]
    fn provider_serde_matches_as_str() {
        for p in [Provider::Stripe, Provider::Paystack] {
            let json = serde_json::to_string(&p).unwrap();
            assert_eq!(json, format!("\"{}\"", p.as_str()));
            assert_eq!(Provider::from_str(p.as_str()).unwrap(), p);
        }
    }

    #[test]
    fn billing_interval_roundtrip() {
        roundtrip::json_value_canonical_proptest::<BillingInterval>();
        assert_eq!(
            serde_json::to_string(&BillingInterval::OneTime).unwrap(),
            "\"one_time\""
        );
    }
}
