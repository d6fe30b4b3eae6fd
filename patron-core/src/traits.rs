//! Trait seams between the orchestration core and the outside world.
//!
//! The core never talks to Postgres, Redis, or a provider SDK directly; it
//! goes through these traits so that every applier, job, and route can be
//! exercised against in-memory fakes. The production implementations live
//! in [`crate::store`], [`crate::locks`], [`crate::provider`], and
//! [`crate::fx`].

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::{
    api::models::{BillingInterval, Provider},
    money::{CurrencyCode, UsdRate},
    time::TimestampMs,
};
use serde_json::Value as Json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Activity, CheckoutSession, Creator, DailyStats, Payment, PaymentStatus,
    PayoutAccountStatus, Subscriber, Subscription, WebhookEvent,
    WebhookEventStatus,
};

// --- Provider adapter error --- //

/// Classifies adapter failures into the two classes the core cares about:
/// transient (retry) and permanent (stop).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Timeouts, connection failures, 5xx, rate limits.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
    /// The provider rejected the request and a retry cannot succeed
    /// (e.g. `resource_missing`, invalid bank details).
    #[error("Provider rejected request: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        // Anything that didn't come back as an HTTP response is transient.
        Self::Unavailable(format!("{err}"))
    }
}

impl From<ProviderError> for common::api::error::CoreApiError {
    fn from(err: ProviderError) -> Self {
        use common::api::error::CoreApiError;
        match err {
            ProviderError::Unavailable(msg) => {
                CoreApiError::provider_unavailable(msg)
            }
            ProviderError::Permanent(msg) => {
                CoreApiError::provider_permanent(msg)
            }
        }
    }
}

// --- Adapter IO structs --- //

/// A hosted checkout session created on a provider.
#[derive(Clone, Debug)]
pub struct ProviderSession {
    pub session_id: String,
    pub url: String,
    pub provider: Provider,
}

#[derive(Clone, Debug)]
pub struct StripeSessionRequest {
    pub connected_account_id: String,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub interval: BillingInterval,
    pub subscriber_email: Option<String>,
    pub application_fee_cents: i64,
    pub creator_id: Uuid,
    pub tier_id: Option<Uuid>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Clone, Debug)]
pub struct PaystackInitRequest {
    pub email: String,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub subaccount_code: Option<String>,
    pub reference: String,
    pub callback_url: String,
    pub creator_id: Uuid,
    pub tier_id: Option<Uuid>,
}

/// A charge against a stored authorization.
#[derive(Clone, Debug)]
pub struct ChargeAuthorizationRequest {
    pub authorization_code: secrecy::Secret<String>,
    pub email: String,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub reference: String,
    pub subscription_id: Uuid,
}

#[derive(Clone, Debug)]
pub enum ChargeOutcome {
    Success { reference: String },
    Failed { reference: String, reason: String },
}

#[derive(Clone, Debug)]
pub struct RecipientRequest {
    pub name: String,
    pub account_number: secrecy::Secret<String>,
    pub bank_code: String,
    pub currency: CurrencyCode,
}

#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub recipient_code: String,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub reference: String,
    pub reason: String,
}

/// Outcome of initiating a transfer.
#[derive(Clone, Debug)]
pub struct TransferInit {
    pub transfer_code: String,
    pub status: TransferInitStatus,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum TransferInitStatus {
    /// Queued on the provider; a webhook will report the outcome.
    #[default]
    Pending,
    /// The provider wants an operator OTP before it moves money.
    RequiresOtp,
    /// Completed synchronously.
    Success,
}

#[derive(Clone, Debug)]
pub struct Bank {
    pub name: String,
    pub code: String,
}

#[derive(Clone, Debug)]
pub struct ResolvedAccount {
    pub account_name: String,
    pub account_number_last4: String,
}

#[derive(Clone, Debug)]
pub struct SubaccountRequest {
    pub business_name: String,
    pub bank_code: String,
    pub account_number: secrecy::Secret<String>,
    pub percentage_charge: f64,
}

#[derive(Clone, Debug)]
pub struct StripeAccount {
    pub account_id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub disabled_reason: Option<String>,
}

#[derive(Clone, Debug)]
pub struct StripeInvoice {
    pub invoice_id: String,
    pub subscription_id: Option<String>,
    pub charge_ref: Option<String>,
}

/// A transaction as reported by a provider's list API; the reconciliation
/// input.
#[derive(Clone, Debug)]
pub struct ProviderTransaction {
    pub reference: String,
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    /// Raw provider status, normalized to lowercase.
    pub status: String,
    /// Creator attribution recovered from transaction metadata, when the
    /// provider echoes it back.
    pub creator_id: Option<Uuid>,
    pub subscriber_email: Option<String>,
    pub occurred_at: TimestampMs,
}

impl ProviderTransaction {
    /// Providers spell success differently; reconciliation only cares about
    /// settled funds.
    pub fn is_settled(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "success")
    }
}

#[derive(Clone, Debug)]
pub struct ProviderBalance {
    pub available_cents: i64,
    pub currency: CurrencyCode,
}

// --- Provider adapters --- //

/// The global card processor, exposed to the core as exactly the calls the
/// checkout/applier/reconciliation paths consume.
#[async_trait]
pub trait StripeApi: Send + Sync {
    async fn create_checkout_session(
        &self,
        req: &StripeSessionRequest,
    ) -> Result<ProviderSession, ProviderError>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<(), ProviderError>;

    /// Undo a pending at-period-end cancellation.
    async fn reactivate_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<(), ProviderError>;

    async fn retrieve_account(
        &self,
        account_id: &str,
    ) -> Result<StripeAccount, ProviderError>;

    /// Refund flows look up the owning subscription through the invoice.
    async fn retrieve_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<StripeInvoice, ProviderError>;

    /// Returns the provider-side refund reference.
    async fn create_refund(
        &self,
        charge_ref: &str,
        amount_cents: Option<i64>,
    ) -> Result<String, ProviderError>;

    async fn list_transactions_since(
        &self,
        since: TimestampMs,
    ) -> Result<Vec<ProviderTransaction>, ProviderError>;

    async fn fetch_balance(
        &self,
        account_id: &str,
    ) -> Result<ProviderBalance, ProviderError>;
}

/// The regional processor.
#[async_trait]
pub trait PaystackApi: Send + Sync {
    async fn initialize_transaction(
        &self,
        req: &PaystackInitRequest,
    ) -> Result<ProviderSession, ProviderError>;

    async fn verify_transaction(
        &self,
        reference: &str,
    ) -> Result<ProviderTransaction, ProviderError>;

    async fn charge_authorization(
        &self,
        req: &ChargeAuthorizationRequest,
    ) -> Result<ChargeOutcome, ProviderError>;

    async fn list_banks(
        &self,
        country: &str,
    ) -> Result<Vec<Bank>, ProviderError>;

    async fn resolve_account(
        &self,
        account_number: &secrecy::Secret<String>,
        bank_code: &str,
    ) -> Result<ResolvedAccount, ProviderError>;

    /// Returns the subaccount code.
    async fn create_subaccount(
        &self,
        req: &SubaccountRequest,
    ) -> Result<String, ProviderError>;

    /// Returns the recipient code, cached on the creator for reuse.
    async fn create_transfer_recipient(
        &self,
        req: &RecipientRequest,
    ) -> Result<String, ProviderError>;

    async fn initiate_transfer(
        &self,
        req: &TransferRequest,
    ) -> Result<TransferInit, ProviderError>;

    async fn finalize_transfer(
        &self,
        transfer_code: &str,
        otp: &str,
    ) -> Result<(), ProviderError>;

    /// Returns the provider-side refund reference.
    async fn create_refund(
        &self,
        reference: &str,
        amount_cents: Option<i64>,
    ) -> Result<String, ProviderError>;

    async fn list_transactions_since(
        &self,
        since: TimestampMs,
    ) -> Result<Vec<ProviderTransaction>, ProviderError>;

    async fn fetch_balance(&self) -> Result<ProviderBalance, ProviderError>;
}

/// External FX rate source. Rates are fetched, never computed.
#[async_trait]
pub trait FxApi: Send + Sync {
    /// Local major units per one USD for the given currency.
    async fn usd_rate(
        &self,
        currency: &CurrencyCode,
    ) -> Result<UsdRate, ProviderError>;
}

// --- Cache (Redis) --- //

/// Advisory key-value operations backed by Redis: locks, dedupe keys, job
/// health. The database stays authoritative; losing Redis loses only
/// double-click dedupe and lease exclusivity.
#[async_trait]
pub trait Cache: Send + Sync {
    /// `SET key value NX PX ttl`. Returns whether the key was set.
    async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// `SET key value PX ttl` (unconditional).
    async fn set_px(&self, key: &str, value: &str, ttl: Duration)
        -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key` only if its current value matches `value` (fencing
    /// token compare-and-delete). Returns whether a deletion happened.
    async fn del_if_match(&self, key: &str, value: &str) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;
}

// --- Notifications & alerts --- //

/// Outbound subscriber/creator notifications. Template rendering and
/// transport live outside the core; this is the seam it pushes through.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    PaymentFailed {
        subscription_id: Uuid,
        subscriber_email: String,
        amount_cents: i64,
        currency: CurrencyCode,
    },
    SubscriptionCanceled {
        subscription_id: Uuid,
        subscriber_email: String,
    },
    RenewalReminder {
        subscription_id: Uuid,
        subscriber_email: String,
        days_before: u8,
        renews_at: TimestampMs,
    },
    PayoutCompleted {
        creator_id: Uuid,
        amount_cents: i64,
        currency: CurrencyCode,
    },
    PayoutFailed {
        creator_id: Uuid,
        payment_id: Uuid,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<()>;
}

/// Operator-facing alerts raised by monitors and reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub enum OpsAlert {
    StuckTransfers {
        count: usize,
        oldest_age_secs: u64,
    },
    HighTransferFailureRate {
        failure_rate_pct: u32,
        samples: usize,
    },
    ReconciliationDiscrepancies {
        count: usize,
        auto_fixed: usize,
    },
    WebhookDeadLettered {
        event_id: String,
    },
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: OpsAlert) -> Result<()>;
}

// --- Store --- //

/// Outcome of the webhook event upsert.
#[derive(Clone, Debug)]
pub struct WebhookUpsert {
    pub event: WebhookEvent,
    /// True when the event key already existed (retry_count was bumped).
    pub was_duplicate: bool,
}

/// All rows written when a charge event is applied. Persisted in a single
/// transaction.
#[derive(Clone, Debug)]
pub struct CheckedCharge {
    pub payment: Payment,
    pub subscription: Subscription,
    pub subscription_is_new: bool,
    /// Net increment applied to the subscription's lifetime value.
    pub ltv_increment_cents: i64,
    pub activities: Vec<Activity>,
}

/// All rows written when a refund/dispute event is applied. Persisted in a
/// single transaction.
#[derive(Clone, Debug)]
pub struct CheckedRefund {
    pub refund: Payment,
    pub original_payment_id: Uuid,
    pub original_new_status: PaymentStatus,
    pub subscription_id: Option<Uuid>,
    /// Positive; the store clamps the subscription LTV at zero.
    pub ltv_decrement_cents: i64,
    pub activities: Vec<Activity>,
}

/// The relational store. Every multi-row write the appliers need is a
/// single method so implementations can run it in one transaction.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Creators --- //

    async fn get_creator(&self, id: Uuid) -> Result<Option<Creator>>;
    async fn find_creator_by_stripe_account(
        &self,
        stripe_account_id: &str,
    ) -> Result<Option<Creator>>;
    async fn list_service_creators(&self) -> Result<Vec<Creator>>;
    async fn list_creators(&self) -> Result<Vec<Creator>>;
    async fn set_creator_recipient_code(
        &self,
        id: Uuid,
        recipient_code: &str,
    ) -> Result<()>;
    async fn set_creator_payout_status(
        &self,
        id: Uuid,
        status: PayoutAccountStatus,
    ) -> Result<()>;
    async fn set_creator_balance_cache(
        &self,
        id: Uuid,
        provider: Provider,
        available_cents: i64,
        currency: &CurrencyCode,
        as_of: TimestampMs,
    ) -> Result<()>;

    // --- Subscribers --- //

    async fn get_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>>;
    async fn get_or_create_subscriber(
        &self,
        email: &str,
    ) -> Result<Subscriber>;
    async fn set_subscriber_blocked(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<()>;
    async fn increment_dispute_count(&self, id: Uuid) -> Result<i32>;

    // --- Subscriptions --- //

    async fn get_subscription(
        &self,
        id: Uuid,
    ) -> Result<Option<Subscription>>;
    async fn find_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>>;
    async fn find_subscription(
        &self,
        creator_id: Uuid,
        subscriber_id: Uuid,
        interval: BillingInterval,
    ) -> Result<Option<Subscription>>;
    /// Full-row update; callers hold the subscription's subject lock.
    async fn update_subscription(&self, sub: &Subscription) -> Result<()>;
    /// Distinct subscribers with an active subscription to this creator;
    /// feeds the creator-minimum amortization.
    async fn count_active_subscribers(&self, creator_id: Uuid)
        -> Result<u32>;
    async fn list_due_paystack_subscriptions(
        &self,
        now: TimestampMs,
    ) -> Result<Vec<Subscription>>;
    async fn list_past_due_subscriptions(&self)
        -> Result<Vec<Subscription>>;
    async fn list_pending_subscriptions_older_than(
        &self,
        cutoff: TimestampMs,
    ) -> Result<Vec<Subscription>>;
    async fn list_subscriptions_renewing_between(
        &self,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<Vec<Subscription>>;
    async fn list_subscriptions_canceled_since(
        &self,
        since: TimestampMs,
    ) -> Result<Vec<Subscription>>;

    // --- Payments --- //

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>>;
    async fn find_payment_by_charge_ref(
        &self,
        provider: Provider,
        charge_ref: &str,
    ) -> Result<Option<Payment>>;
    async fn find_payment_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<Payment>>;
    async fn find_payout_by_transfer_ref(
        &self,
        transfer_ref: &str,
    ) -> Result<Option<Payment>>;
    /// Insert a standalone row (payout rows; charge rows go through
    /// [`Store::persist_charge`]).
    async fn insert_payment(&self, payment: &Payment) -> Result<()>;
    async fn update_payment_status(
        &self,
        id: Uuid,
        status: PaymentStatus,
        occurred_at: Option<TimestampMs>,
    ) -> Result<()>;
    async fn set_payment_transfer_code(
        &self,
        id: Uuid,
        transfer_code: &str,
    ) -> Result<()>;
    /// Insert the payment, upsert the subscription (including its LTV
    /// increment), and append activities, atomically.
    async fn persist_charge(&self, checked: CheckedCharge) -> Result<()>;
    /// Insert the refund row, flip the original's status, clamp-decrement
    /// the subscription LTV, and append activities, atomically.
    async fn persist_refund(&self, checked: CheckedRefund) -> Result<()>;
    async fn list_failed_charges_since(
        &self,
        since: TimestampMs,
    ) -> Result<Vec<Payment>>;
    async fn list_otp_pending_payouts(&self) -> Result<Vec<Payment>>;
    /// Most recent payout outcomes (newest first), for failure-rate
    /// monitoring.
    async fn recent_payout_outcomes(
        &self,
        limit: u32,
    ) -> Result<Vec<PaymentStatus>>;
    /// Net charge revenue not yet covered by a payout row.
    async fn creator_unpaid_net_cents(&self, creator_id: Uuid)
        -> Result<i64>;
    async fn daily_stats(
        &self,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<DailyStats>;
    async fn insert_stats_snapshot(
        &self,
        day: &str,
        stats: &DailyStats,
    ) -> Result<()>;

    // --- Checkout sessions --- //

    async fn insert_checkout_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<()>;
    async fn get_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CheckoutSession>>;
    async fn link_checkout_session(
        &self,
        session_id: &str,
        subscription_id: Uuid,
    ) -> Result<()>;

    // --- Webhook events --- //

    /// Insert a new `received` event, or bump `retry_count` on a duplicate
    /// key.
    async fn upsert_webhook_event(
        &self,
        provider: Provider,
        event_id: &str,
        event_type: &str,
        payload: &Json,
    ) -> Result<WebhookUpsert>;
    async fn get_webhook_event(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEvent>>;
    async fn set_webhook_status(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        payment_id: Option<Uuid>,
        failure_reason: Option<String>,
    ) -> Result<()>;

    // --- Notification log --- //

    /// Record that a notification was sent. Returns false when the
    /// `(subscription_id, type)` key already exists; callers must check
    /// this inside the notification lock.
    async fn try_record_notification(
        &self,
        subscription_id: Uuid,
        notification_type: &str,
        now: TimestampMs,
    ) -> Result<bool>;

    // --- Activity --- //

    async fn append_activity(&self, activity: &Activity) -> Result<()>;

    // --- Cleanup --- //

    async fn expire_checkout_sessions(
        &self,
        cutoff: TimestampMs,
    ) -> Result<u64>;
    async fn delete_expired_magic_links(
        &self,
        now: TimestampMs,
    ) -> Result<u64>;
    async fn delete_page_views_before(
        &self,
        cutoff: TimestampMs,
    ) -> Result<u64>;
    async fn expire_overdue_requests(&self, now: TimestampMs)
        -> Result<u64>;
    async fn clear_abandoned_onboarding(
        &self,
        cutoff: TimestampMs,
    ) -> Result<u64>;
}
