//! Entities and status enums for the orchestration core.
//!
//! These are semantic types, not wire or schema types: the Postgres store
//! maps them to rows, the in-memory store holds them directly, and the
//! appliers operate on them. `Payment` rows are append-only with a sign
//! convention: positive `amount_cents` for inbound funds, negative for
//! refunds; `|fee| + |net| == |gross|` always holds, with signs matching
//! `amount_cents`.

use std::{fmt, str::FromStr};

use common::{
    api::models::{BillingInterval, Provider},
    money::CurrencyCode,
    time::TimestampMs,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Creator --- //

/// Why a creator is on the platform; service-purpose creators are paid out
/// on the payroll schedule instead of on demand.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatorPurpose {
    Personal,
    Service,
}

/// Whether the platform may pay this creator out.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutAccountStatus {
    Pending,
    Active,
    Restricted,
    Disabled,
}

impl PayoutAccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Restricted => "restricted",
            Self::Disabled => "disabled",
        }
    }
}

impl FromStr for PayoutAccountStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "restricted" => Ok(Self::Restricted),
            "disabled" => Ok(Self::Disabled),
            _ => Err(anyhow::anyhow!("Unknown payout account status: {s}")),
        }
    }
}

/// A configured price tier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub id: Uuid,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub name: String,
}

/// A creator account with its connected provider handles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Creator {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    /// ISO 3166-1 alpha-2.
    pub country: String,
    /// Payout currency.
    pub currency: CurrencyCode,
    pub purpose: CreatorPurpose,
    pub default_provider: Option<Provider>,
    pub stripe_account_id: Option<String>,
    pub paystack_subaccount_code: Option<String>,
    /// Cached transfer recipient, reused across payouts.
    pub paystack_recipient_code: Option<String>,
    pub bank_code: Option<String>,
    /// AES-GCM blob; only the last 4 digits ever surface.
    pub bank_account_enc: Option<String>,
    pub fee_mode: FeeMode,
    pub payout_status: PayoutAccountStatus,
    /// Configured single price, if the creator doesn't use tiers.
    pub price_cents: Option<i64>,
    pub tiers: Vec<PriceTier>,
    pub created_at: TimestampMs,
}

impl Creator {
    pub fn has_stripe(&self) -> bool {
        self.stripe_account_id.is_some()
    }

    pub fn has_paystack(&self) -> bool {
        self.paystack_subaccount_code.is_some()
    }

    /// Whether the regional processor must route this creator's funds
    /// through an extra FX/correspondent step.
    pub fn is_cross_border(&self) -> bool {
        common::money::CROSS_BORDER_COUNTRIES
            .contains(&self.country.as_str())
    }
}

// --- Subscriber --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: Uuid,
    /// Unique.
    pub email: String,
    pub dispute_count: i32,
    pub blocked_reason: Option<String>,
    pub created_at: TimestampMs,
}

// --- Subscription --- //

/// Which formula produced a Payment's fee.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeModel {
    /// Single percentage with absorb or pass semantics. Stays selectable
    /// for backward compatibility on old subscriptions.
    Legacy,
    /// Equal split between subscriber and creator; all new subscriptions.
    SplitV1,
}

impl FeeModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::SplitV1 => "split_v1",
        }
    }
}

impl FromStr for FeeModel {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "legacy" => Ok(Self::Legacy),
            "split_v1" => Ok(Self::SplitV1),
            _ => Err(anyhow::anyhow!("Unknown fee model: {s}")),
        }
    }
}

/// Who bears the platform fee.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeMode {
    Absorb,
    PassToSubscriber,
    Split,
}

impl FeeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absorb => "absorb",
            Self::PassToSubscriber => "pass_to_subscriber",
            Self::Split => "split",
        }
    }
}

impl FromStr for FeeMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "absorb" => Ok(Self::Absorb),
            "pass_to_subscriber" => Ok(Self::PassToSubscriber),
            "split" => Ok(Self::Split),
            _ => Err(anyhow::anyhow!("Unknown fee mode: {s}")),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            _ => Err(anyhow::anyhow!("Unknown subscription status: {s}")),
        }
    }
}

/// Why a subscription was canceled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    SubscriberRequest,
    CreatorRequest,
    PaymentFailed,
    PendingPaymentTimeout,
    ProviderCanceled,
}

/// Exactly one provider binding may be set at a time: a Stripe subscription
/// id or a Paystack authorization code. Never both.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub subscriber_id: Uuid,
    /// Minor units in `currency`.
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub fee_model: FeeModel,
    pub fee_mode: FeeMode,
    pub provider: Provider,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    /// AES-GCM blob; decrypted only at charge time.
    pub paystack_authorization_enc: Option<String>,
    pub current_period_end: Option<TimestampMs>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<TimestampMs>,
    pub cancel_reason: Option<CancelReason>,
    /// Lifetime creator net from this subscription. Never negative.
    pub ltv_cents: i64,
    /// Bumped to invalidate previously minted manage tokens.
    pub manage_token_nonce: i64,
    /// Billing retries attempted since entering `past_due`.
    pub retry_count: i32,
    pub past_due_since: Option<TimestampMs>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl Subscription {
    /// Check the single-provider-binding invariant.
    pub fn assert_invariants(&self) {
        let stripe_bound = self.stripe_subscription_id.is_some();
        let paystack_bound = self.paystack_authorization_enc.is_some();
        assert!(
            !(stripe_bound && paystack_bound),
            "Subscription {} is bound to both providers",
            self.id
        );
        assert!(self.ltv_cents >= 0, "ltv went negative");
    }
}

// --- Payment --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Recurring,
    OneTime,
    Payout,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recurring => "recurring",
            Self::OneTime => "one_time",
            Self::Payout => "payout",
        }
    }

    /// Whether this row represents subscriber funds coming in (as opposed
    /// to a creator payout going out).
    pub fn is_charge(&self) -> bool {
        matches!(self, Self::Recurring | Self::OneTime)
    }
}

impl FromStr for PaymentType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "recurring" => Ok(Self::Recurring),
            "one_time" => Ok(Self::OneTime),
            "payout" => Ok(Self::Payout),
            _ => Err(anyhow::anyhow!("Unknown payment type: {s}")),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    /// Transfer initiated but awaiting an operator OTP (Paystack payouts).
    OtpPending,
    Succeeded,
    Failed,
    Refunded,
    Disputed,
    DisputeWon,
    DisputeLost,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::OtpPending => "otp_pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
            Self::DisputeWon => "dispute_won",
            Self::DisputeLost => "dispute_lost",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "otp_pending" => Ok(Self::OtpPending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            "disputed" => Ok(Self::Disputed),
            "dispute_won" => Ok(Self::DisputeWon),
            "dispute_lost" => Ok(Self::DisputeLost),
            _ => Err(anyhow::anyhow!("Unknown payment status: {s}")),
        }
    }
}

/// Where a payment's USD reporting rate came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingRateSource {
    /// Refund rows copy the original payment's rate so USD totals cancel
    /// exactly.
    OriginalPayment,
    /// Fetched from the FX service at apply time.
    CurrentRate,
    /// The provider reported its own settlement rate.
    StripeReported,
}

impl ReportingRateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OriginalPayment => "original_payment",
            Self::CurrentRate => "current_rate",
            Self::StripeReported => "stripe_reported",
        }
    }
}

impl FromStr for ReportingRateSource {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "original_payment" => Ok(Self::OriginalPayment),
            "current_rate" => Ok(Self::CurrentRate),
            "stripe_reported" => Ok(Self::StripeReported),
            _ => Err(anyhow::anyhow!("Unknown reporting rate source: {s}")),
        }
    }
}

/// USD shadow amounts stored alongside native amounts so analytics can
/// aggregate across currencies without FX at query time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reporting {
    pub currency: CurrencyCode,
    pub gross_cents: i64,
    pub fee_cents: i64,
    pub net_cents: i64,
    pub exchange_rate: Decimal,
    pub rate_source: ReportingRateSource,
    pub rate_timestamp: TimestampMs,
    pub is_estimated: bool,
}

/// An immutable financial event. Refunds and disputes add new rows with
/// negative amounts; the original is never mutated except for its status
/// field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub creator_id: Uuid,
    pub subscriber_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub gross_cents: i64,
    pub fee_cents: i64,
    /// Creator share.
    pub net_cents: i64,
    pub creator_fee_cents: Option<i64>,
    pub subscriber_fee_cents: Option<i64>,
    pub fee_model: FeeModel,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub provider: Provider,
    pub provider_event_id: Option<String>,
    /// Charge / transaction / transfer reference on the provider side.
    pub provider_charge_ref: Option<String>,
    pub paystack_transfer_code: Option<String>,
    /// Provider-reported time; authoritative for reporting windows.
    /// `created_at` is for audit only.
    pub occurred_at: TimestampMs,
    pub reporting: Reporting,
    /// Delta between provider-reported fee and our recomputed fee, kept for
    /// debugging rounding mismatches.
    pub fee_delta_cents: Option<i64>,
    pub created_at: TimestampMs,
}

impl Payment {
    pub fn assert_invariants(&self) {
        assert_eq!(
            self.fee_cents.abs() + self.net_cents.abs(),
            self.gross_cents.abs(),
            "fee + net != gross for payment {}",
            self.id
        );
        assert!(
            self.fee_cents.signum() * self.amount_cents.signum() >= 0,
            "fee sign does not match amount sign for payment {}",
            self.id
        );
        if let (Some(cf), Some(sf)) =
            (self.creator_fee_cents, self.subscriber_fee_cents)
        {
            assert_eq!(cf + sf, self.fee_cents, "split fee mismatch");
        }
    }
}

// --- WebhookEvent --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Received,
    Processed,
    Skipped,
    Failed,
    DeadLetter,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processed => "processed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl FromStr for WebhookEventStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "received" => Ok(Self::Received),
            "processed" => Ok(Self::Processed),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(anyhow::anyhow!("Unknown webhook event status: {s}")),
        }
    }
}

/// A durably recorded provider event. Lives forever; the DLQ sweep marks
/// `dead_letter` after max retries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider: Provider,
    /// Deduplication key. Stripe event id as-is; Paystack keys embed the
    /// event type since one reference emits multiple lifecycle events.
    pub event_id: String,
    pub event_type: String,
    pub status: WebhookEventStatus,
    pub retry_count: i32,
    /// Backref set after a successful apply.
    pub payment_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub failure_reason: Option<String>,
    pub processed_at: Option<TimestampMs>,
    pub created_at: TimestampMs,
}

// --- Activity --- //

/// Append-only log entry; drives notifications and dashboards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: ActivityKind,
    pub occurred_at: TimestampMs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    PaymentReceived {
        payment_id: Uuid,
        amount_cents: i64,
        currency: CurrencyCode,
    },
    PaymentRefunded {
        payment_id: Uuid,
        amount_cents: i64,
        currency: CurrencyCode,
    },
    SubscriptionStarted {
        subscription_id: Uuid,
    },
    SubscriptionPastDue {
        subscription_id: Uuid,
    },
    SubscriptionCanceled {
        subscription_id: Uuid,
        reason: CancelReason,
    },
    PayoutInitiated {
        payment_id: Uuid,
        amount_cents: i64,
    },
    PayoutCompleted {
        payment_id: Uuid,
        amount_cents: i64,
    },
    PayoutFailed {
        payment_id: Uuid,
    },
    DisputeOpened {
        payment_id: Uuid,
    },
}

// --- CheckoutSession --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutSessionStatus {
    Pending,
    Completed,
    Expired,
}

impl CheckoutSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for CheckoutSessionStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            _ => Err(anyhow::anyhow!("Unknown checkout session status: {s}")),
        }
    }
}

/// A provider checkout session we initiated. Local Subscription rows are
/// only created once the first charge webhook lands; pending abandonment
/// accumulates here instead and is swept by cleanup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Provider session id (Stripe) or transaction reference (Paystack).
    pub session_id: String,
    pub provider: Provider,
    pub creator_id: Uuid,
    pub subscriber_email: Option<String>,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub interval: BillingInterval,
    pub url: String,
    pub status: CheckoutSessionStatus,
    /// Backfilled by the event applier once the first charge lands.
    pub subscription_id: Option<Uuid>,
    pub created_at: TimestampMs,
}

// --- DailyStats --- //

/// One reporting snapshot, aggregated in USD reporting amounts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub charge_count: u64,
    pub gross_usd_cents: i64,
    pub fee_usd_cents: i64,
    pub net_usd_cents: i64,
    pub refund_count: u64,
    pub refunded_usd_cents: i64,
    pub payout_count: u64,
    pub new_subscriptions: u64,
    pub canceled_subscriptions: u64,
}

// --- NotificationLog --- //

/// `(subscription_id, notification_type)` idempotency keys for outbound
/// email.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationLog {
    pub subscription_id: Uuid,
    pub notification_type: String,
    pub sent_at: TimestampMs,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for WebhookEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_strings_roundtrip() {
        for s in [
            "pending",
            "otp_pending",
            "succeeded",
            "failed",
            "refunded",
            "disputed",
            "dispute_won",
            "dispute_lost",
        ] {
            assert_eq!(PaymentStatus::from_str(s).unwrap().as_str(), s);
        }
        for s in ["pending", "active", "past_due", "canceled"] {
            assert_eq!(SubscriptionStatus::from_str(s).unwrap().as_str(), s);
        }
        for s in ["received", "processed", "skipped", "failed", "dead_letter"]
        {
            assert_eq!(WebhookEventStatus::from_str(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn serde_uses_snake_case_statuses() {
        assert_eq!(
            serde_json::to_string(&PaymentStatus::DisputeWon).unwrap(),
            "\"dispute_won\""
        );
        assert_eq!(
            serde_json::to_string(&ReportingRateSource::StripeReported)
                .unwrap(),
            "\"stripe_reported\""
        );
    }
}
