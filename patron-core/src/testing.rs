//! In-memory fakes shared between unit, integration, and server tests.
//!
//! [`MemStore`] mirrors the Postgres store's semantics (unique keys,
//! clamped LTV, transactional no-op on event-id conflicts) over hash maps
//! so the appliers and jobs can be exercised hermetically. The provider
//! fakes record calls and serve programmable responses.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use common::{
    api::models::{BillingInterval, Provider},
    env::DeployEnv,
    money::{CurrencyCode, UsdRate},
    pii::PiiCipher,
    time::TimestampMs,
    Secret,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value as Json;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    context::Ctx,
    models::{
        Activity, CheckoutSession, CheckoutSessionStatus, Creator,
        CreatorPurpose, DailyStats, FeeMode, Payment, PaymentStatus,
        PaymentType, PayoutAccountStatus, Subscriber, Subscription,
        SubscriptionStatus, WebhookEvent, WebhookEventStatus,
    },
    traits::{
        AlertSink, Bank, Cache, ChargeAuthorizationRequest, ChargeOutcome,
        CheckedCharge, CheckedRefund, FxApi, Notification, Notifier,
        OpsAlert, PaystackApi, PaystackInitRequest, ProviderBalance,
        ProviderError, ProviderSession, ProviderTransaction,
        RecipientRequest, ResolvedAccount, Store, StripeAccount, StripeApi,
        StripeInvoice, StripeSessionRequest, SubaccountRequest,
        TransferInit, TransferInitStatus, TransferRequest, WebhookUpsert,
    },
};

// --- MemStore --- //

#[derive(Default)]
struct MemStoreInner {
    creators: HashMap<Uuid, Creator>,
    subscribers: HashMap<Uuid, Subscriber>,
    subscriptions: HashMap<Uuid, Subscription>,
    payments: HashMap<Uuid, Payment>,
    webhook_events: HashMap<String, WebhookEvent>,
    notification_log: HashSet<(Uuid, String)>,
    activities: Vec<Activity>,
    checkout_sessions: HashMap<String, CheckoutSession>,
    stats_snapshots: HashMap<String, DailyStats>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Test setup & inspection helpers --- //

    pub fn insert_creator(&self, creator: Creator) {
        self.inner
            .lock()
            .unwrap()
            .creators
            .insert(creator.id, creator);
    }

    pub fn insert_subscriber(&self, subscriber: Subscriber) {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .insert(subscriber.id, subscriber);
    }

    pub fn insert_subscription(&self, sub: Subscription) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .insert(sub.id, sub);
    }

    pub fn put_payment(&self, payment: Payment) {
        self.inner
            .lock()
            .unwrap()
            .payments
            .insert(payment.id, payment);
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.inner
            .lock()
            .unwrap()
            .payments
            .values()
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .cloned()
            .collect()
    }

    pub fn activities(&self) -> Vec<Activity> {
        self.inner.lock().unwrap().activities.clone()
    }

    pub fn webhook_events(&self) -> Vec<WebhookEvent> {
        self.inner
            .lock()
            .unwrap()
            .webhook_events
            .values()
            .cloned()
            .collect()
    }

    pub fn stats_snapshots(&self) -> HashMap<String, DailyStats> {
        self.inner.lock().unwrap().stats_snapshots.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_creator(&self, id: Uuid) -> Result<Option<Creator>> {
        Ok(self.inner.lock().unwrap().creators.get(&id).cloned())
    }

    async fn find_creator_by_stripe_account(
        &self,
        stripe_account_id: &str,
    ) -> Result<Option<Creator>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .creators
            .values()
            .find(|c| {
                c.stripe_account_id.as_deref() == Some(stripe_account_id)
            })
            .cloned())
    }

    async fn list_service_creators(&self) -> Result<Vec<Creator>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .creators
            .values()
            .filter(|c| c.purpose == CreatorPurpose::Service)
            .cloned()
            .collect())
    }

    async fn list_creators(&self) -> Result<Vec<Creator>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .creators
            .values()
            .cloned()
            .collect())
    }

    async fn set_creator_recipient_code(
        &self,
        id: Uuid,
        recipient_code: &str,
    ) -> Result<()> {
        if let Some(c) = self.inner.lock().unwrap().creators.get_mut(&id) {
            c.paystack_recipient_code = Some(recipient_code.to_owned());
        }
        Ok(())
    }

    async fn set_creator_payout_status(
        &self,
        id: Uuid,
        status: PayoutAccountStatus,
    ) -> Result<()> {
        if let Some(c) = self.inner.lock().unwrap().creators.get_mut(&id) {
            c.payout_status = status;
        }
        Ok(())
    }

    async fn set_creator_balance_cache(
        &self,
        _id: Uuid,
        _provider: Provider,
        _available_cents: i64,
        _currency: &CurrencyCode,
        _as_of: TimestampMs,
    ) -> Result<()> {
        Ok(())
    }

    async fn get_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>> {
        Ok(self.inner.lock().unwrap().subscribers.get(&id).cloned())
    }

    async fn get_or_create_subscriber(
        &self,
        email: &str,
    ) -> Result<Subscriber> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) =
            inner.subscribers.values().find(|s| s.email == email)
        {
            return Ok(existing.clone());
        }
        let subscriber = Subscriber {
            id: Uuid::new_v4(),
            email: email.to_owned(),
            dispute_count: 0,
            blocked_reason: None,
            created_at: TimestampMs::now(),
        };
        inner
            .subscribers
            .insert(subscriber.id, subscriber.clone());
        Ok(subscriber)
    }

    async fn set_subscriber_blocked(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<()> {
        if let Some(s) = self.inner.lock().unwrap().subscribers.get_mut(&id)
        {
            s.blocked_reason = reason;
        }
        Ok(())
    }

    async fn increment_dispute_count(&self, id: Uuid) -> Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        let s = inner
            .subscribers
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("No subscriber {id}"))?;
        s.dispute_count += 1;
        Ok(s.dispute_count)
    }

    async fn get_subscription(
        &self,
        id: Uuid,
    ) -> Result<Option<Subscription>> {
        Ok(self.inner.lock().unwrap().subscriptions.get(&id).cloned())
    }

    async fn find_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .find(|s| {
                s.stripe_subscription_id.as_deref()
                    == Some(stripe_subscription_id)
            })
            .cloned())
    }

    async fn find_subscription(
        &self,
        creator_id: Uuid,
        subscriber_id: Uuid,
        interval: BillingInterval,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .find(|s| {
                s.creator_id == creator_id
                    && s.subscriber_id == subscriber_id
                    && s.interval == interval
                    && s.status != SubscriptionStatus::Canceled
            })
            .cloned())
    }

    async fn update_subscription(&self, sub: &Subscription) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .insert(sub.id, sub.clone());
        Ok(())
    }

    async fn count_active_subscribers(
        &self,
        creator_id: Uuid,
    ) -> Result<u32> {
        let inner = self.inner.lock().unwrap();
        let subscribers: HashSet<Uuid> = inner
            .subscriptions
            .values()
            .filter(|s| {
                s.creator_id == creator_id
                    && s.status == SubscriptionStatus::Active
            })
            .map(|s| s.subscriber_id)
            .collect();
        Ok(subscribers.len() as u32)
    }

    async fn list_due_paystack_subscriptions(
        &self,
        now: TimestampMs,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| {
                s.provider == Provider::Paystack
                    && s.status == SubscriptionStatus::Active
                    && s.interval == BillingInterval::Month
                    && s.current_period_end
                        .map(|end| end <= now)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn list_past_due_subscriptions(
        &self,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::PastDue)
            .cloned()
            .collect())
    }

    async fn list_pending_subscriptions_older_than(
        &self,
        cutoff: TimestampMs,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Pending
                    && s.created_at < cutoff
            })
            .cloned()
            .collect())
    }

    async fn list_subscriptions_renewing_between(
        &self,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && s.interval == BillingInterval::Month
                    && s.current_period_end
                        .map(|e| e >= start && e < end)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn list_subscriptions_canceled_since(
        &self,
        since: TimestampMs,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Canceled
                    && s.canceled_at.map(|c| c >= since).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        Ok(self.inner.lock().unwrap().payments.get(&id).cloned())
    }

    async fn find_payment_by_charge_ref(
        &self,
        provider: Provider,
        charge_ref: &str,
    ) -> Result<Option<Payment>> {
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<&Payment> = inner
            .payments
            .values()
            .filter(|p| {
                p.provider == provider
                    && p.payment_type != PaymentType::Payout
                    && p.provider_charge_ref.as_deref() == Some(charge_ref)
            })
            .collect();
        matches.sort_by_key(|p| p.created_at);
        Ok(matches.first().map(|p| (*p).clone()))
    }

    async fn find_payment_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<Payment>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .payments
            .values()
            .find(|p| p.provider_event_id.as_deref() == Some(event_id))
            .cloned())
    }

    async fn find_payout_by_transfer_ref(
        &self,
        transfer_ref: &str,
    ) -> Result<Option<Payment>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .payments
            .values()
            .find(|p| {
                p.payment_type == PaymentType::Payout
                    && p.provider_charge_ref.as_deref()
                        == Some(transfer_ref)
            })
            .cloned())
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(event_id) = payment.provider_event_id.as_deref() {
            let duplicate = inner.payments.values().any(|p| {
                p.provider_event_id.as_deref() == Some(event_id)
            });
            if duplicate {
                return Ok(());
            }
        }
        inner.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        status: PaymentStatus,
        occurred_at: Option<TimestampMs>,
    ) -> Result<()> {
        if let Some(p) = self.inner.lock().unwrap().payments.get_mut(&id) {
            p.status = status;
            if let Some(occurred_at) = occurred_at {
                p.occurred_at = occurred_at;
            }
        }
        Ok(())
    }

    async fn set_payment_transfer_code(
        &self,
        id: Uuid,
        transfer_code: &str,
    ) -> Result<()> {
        if let Some(p) = self.inner.lock().unwrap().payments.get_mut(&id) {
            p.paystack_transfer_code = Some(transfer_code.to_owned());
        }
        Ok(())
    }

    async fn persist_charge(&self, checked: CheckedCharge) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        // Unique event id: competing application is a silent no-op, same
        // as the SQL ON CONFLICT DO NOTHING.
        if let Some(event_id) = checked.payment.provider_event_id.as_deref()
        {
            let duplicate = inner.payments.values().any(|p| {
                p.provider_event_id.as_deref() == Some(event_id)
            });
            if duplicate {
                return Ok(());
            }
        }
        inner
            .payments
            .insert(checked.payment.id, checked.payment.clone());

        let mut sub = checked.subscription;
        if checked.subscription_is_new {
            sub.ltv_cents = checked.ltv_increment_cents.max(0);
        } else {
            let prior = inner
                .subscriptions
                .get(&sub.id)
                .map(|s| s.ltv_cents)
                .unwrap_or(0);
            sub.ltv_cents = prior + checked.ltv_increment_cents;
        }
        inner.subscriptions.insert(sub.id, sub);
        inner.activities.extend(checked.activities);
        Ok(())
    }

    async fn persist_refund(&self, checked: CheckedRefund) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(event_id) = checked.refund.provider_event_id.as_deref()
        {
            let duplicate = inner.payments.values().any(|p| {
                p.provider_event_id.as_deref() == Some(event_id)
            });
            if duplicate {
                return Ok(());
            }
        }
        inner
            .payments
            .insert(checked.refund.id, checked.refund.clone());
        if let Some(original) =
            inner.payments.get_mut(&checked.original_payment_id)
        {
            original.status = checked.original_new_status;
        }
        if let Some(subscription_id) = checked.subscription_id {
            if let Some(sub) =
                inner.subscriptions.get_mut(&subscription_id)
            {
                sub.ltv_cents =
                    (sub.ltv_cents - checked.ltv_decrement_cents).max(0);
            }
        }
        inner.activities.extend(checked.activities);
        Ok(())
    }

    async fn list_failed_charges_since(
        &self,
        since: TimestampMs,
    ) -> Result<Vec<Payment>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .payments
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Failed
                    && p.payment_type != PaymentType::Payout
                    && p.occurred_at >= since
            })
            .cloned()
            .collect())
    }

    async fn list_otp_pending_payouts(&self) -> Result<Vec<Payment>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .payments
            .values()
            .filter(|p| {
                p.payment_type == PaymentType::Payout
                    && p.status == PaymentStatus::OtpPending
            })
            .cloned()
            .collect())
    }

    async fn recent_payout_outcomes(
        &self,
        limit: u32,
    ) -> Result<Vec<PaymentStatus>> {
        let inner = self.inner.lock().unwrap();
        let mut payouts: Vec<&Payment> = inner
            .payments
            .values()
            .filter(|p| p.payment_type == PaymentType::Payout)
            .collect();
        payouts.sort_by_key(|p| std::cmp::Reverse(p.created_at));
        Ok(payouts
            .iter()
            .take(limit as usize)
            .map(|p| p.status)
            .collect())
    }

    async fn creator_unpaid_net_cents(
        &self,
        creator_id: Uuid,
    ) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        let charges: i64 = inner
            .payments
            .values()
            .filter(|p| {
                p.creator_id == creator_id
                    && p.payment_type != PaymentType::Payout
                    && !matches!(
                        p.status,
                        PaymentStatus::Failed
                            | PaymentStatus::Pending
                            | PaymentStatus::OtpPending
                    )
            })
            .map(|p| p.net_cents)
            .sum();
        let payouts: i64 = inner
            .payments
            .values()
            .filter(|p| {
                p.creator_id == creator_id
                    && p.payment_type == PaymentType::Payout
                    && p.status != PaymentStatus::Failed
            })
            .map(|p| p.amount_cents)
            .sum();
        Ok(charges - payouts)
    }

    async fn daily_stats(
        &self,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<DailyStats> {
        let inner = self.inner.lock().unwrap();
        let mut stats = DailyStats::default();
        for p in inner.payments.values() {
            if p.occurred_at < start || p.occurred_at >= end {
                continue;
            }
            match p.payment_type {
                PaymentType::Payout => stats.payout_count += 1,
                _ if p.amount_cents < 0 => {
                    stats.refund_count += 1;
                    stats.refunded_usd_cents += -p.reporting.gross_cents;
                }
                _ if p.status != PaymentStatus::Failed => {
                    stats.charge_count += 1;
                    stats.gross_usd_cents += p.reporting.gross_cents;
                    stats.fee_usd_cents += p.reporting.fee_cents;
                    stats.net_usd_cents += p.reporting.net_cents;
                }
                _ => (),
            }
        }
        for s in inner.subscriptions.values() {
            if s.created_at >= start && s.created_at < end {
                stats.new_subscriptions += 1;
            }
            if s.canceled_at.map(|c| c >= start && c < end).unwrap_or(false)
            {
                stats.canceled_subscriptions += 1;
            }
        }
        Ok(stats)
    }

    async fn insert_stats_snapshot(
        &self,
        day: &str,
        stats: &DailyStats,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .stats_snapshots
            .insert(day.to_owned(), stats.clone());
        Ok(())
    }

    async fn insert_checkout_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .checkout_sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CheckoutSession>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .checkout_sessions
            .get(session_id)
            .cloned())
    }

    async fn link_checkout_session(
        &self,
        session_id: &str,
        subscription_id: Uuid,
    ) -> Result<()> {
        if let Some(session) = self
            .inner
            .lock()
            .unwrap()
            .checkout_sessions
            .get_mut(session_id)
        {
            session.subscription_id = Some(subscription_id);
            session.status = CheckoutSessionStatus::Completed;
        }
        Ok(())
    }

    async fn upsert_webhook_event(
        &self,
        provider: Provider,
        event_id: &str,
        event_type: &str,
        payload: &Json,
    ) -> Result<WebhookUpsert> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.webhook_events.get_mut(event_id) {
            existing.retry_count += 1;
            return Ok(WebhookUpsert {
                event: existing.clone(),
                was_duplicate: true,
            });
        }
        let event = WebhookEvent {
            id: Uuid::new_v4(),
            provider,
            event_id: event_id.to_owned(),
            event_type: event_type.to_owned(),
            status: WebhookEventStatus::Received,
            retry_count: 0,
            payment_id: None,
            payload: payload.clone(),
            failure_reason: None,
            processed_at: None,
            created_at: TimestampMs::now(),
        };
        inner
            .webhook_events
            .insert(event_id.to_owned(), event.clone());
        Ok(WebhookUpsert {
            event,
            was_duplicate: false,
        })
    }

    async fn get_webhook_event(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEvent>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .webhook_events
            .get(event_id)
            .cloned())
    }

    async fn set_webhook_status(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        payment_id: Option<Uuid>,
        failure_reason: Option<String>,
    ) -> Result<()> {
        if let Some(event) = self
            .inner
            .lock()
            .unwrap()
            .webhook_events
            .get_mut(event_id)
        {
            event.status = status;
            if payment_id.is_some() {
                event.payment_id = payment_id;
            }
            event.failure_reason = failure_reason;
            if matches!(
                status,
                WebhookEventStatus::Processed | WebhookEventStatus::Skipped
            ) {
                event.processed_at = Some(TimestampMs::now());
            }
        }
        Ok(())
    }

    async fn try_record_notification(
        &self,
        subscription_id: Uuid,
        notification_type: &str,
        _now: TimestampMs,
    ) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .notification_log
            .insert((subscription_id, notification_type.to_owned())))
    }

    async fn append_activity(&self, activity: &Activity) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .activities
            .push(activity.clone());
        Ok(())
    }

    async fn expire_checkout_sessions(
        &self,
        cutoff: TimestampMs,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut expired = 0;
        for session in inner.checkout_sessions.values_mut() {
            if session.status == CheckoutSessionStatus::Pending
                && session.created_at < cutoff
            {
                session.status = CheckoutSessionStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn delete_expired_magic_links(
        &self,
        _now: TimestampMs,
    ) -> Result<u64> {
        Ok(0)
    }

    async fn delete_page_views_before(
        &self,
        _cutoff: TimestampMs,
    ) -> Result<u64> {
        Ok(0)
    }

    async fn expire_overdue_requests(
        &self,
        _now: TimestampMs,
    ) -> Result<u64> {
        Ok(0)
    }

    async fn clear_abandoned_onboarding(
        &self,
        _cutoff: TimestampMs,
    ) -> Result<u64> {
        Ok(0)
    }
}

// --- MemCache --- //

/// In-memory [`Cache`] honoring TTLs against the tokio clock, so paused
/// time tests can expire locks deterministically.
#[derive(Default)]
pub struct MemCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemCache {
    async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let live = entries
            .get(key)
            .map(|(_, expires)| *expires > now)
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        entries.insert(key.to_owned(), (value.to_owned(), now + ttl));
        Ok(true)
    }

    async fn set_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<()> {
        self.entries.lock().unwrap().insert(
            key.to_owned(),
            (value.to_owned(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).and_then(|(value, expires)| {
            (*expires > Instant::now()).then(|| value.clone())
        }))
    }

    async fn del_if_match(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((current, expires))
                if current == value && *expires > Instant::now() =>
            {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

// --- Provider fakes --- //

#[derive(Default)]
pub struct FakeStripe {
    pub sessions_created: Mutex<Vec<StripeSessionRequest>>,
    pub cancels: Mutex<Vec<(String, bool)>>,
    pub refunds: Mutex<Vec<(String, Option<i64>)>>,
    pub transactions: Mutex<Vec<ProviderTransaction>>,
}

impl FakeStripe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_transactions(&self, txs: Vec<ProviderTransaction>) {
        *self.transactions.lock().unwrap() = txs;
    }
}

#[async_trait]
impl StripeApi for FakeStripe {
    async fn create_checkout_session(
        &self,
        req: &StripeSessionRequest,
    ) -> Result<ProviderSession, ProviderError> {
        let n = {
            let mut sessions = self.sessions_created.lock().unwrap();
            sessions.push(req.clone());
            sessions.len()
        };
        Ok(ProviderSession {
            session_id: format!("cs_test_{n}"),
            url: format!("https://checkout.stripe.test/cs_test_{n}"),
            provider: Provider::Stripe,
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<(), ProviderError> {
        self.cancels
            .lock()
            .unwrap()
            .push((subscription_id.to_owned(), at_period_end));
        Ok(())
    }

    async fn reactivate_subscription(
        &self,
        _subscription_id: &str,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn retrieve_account(
        &self,
        account_id: &str,
    ) -> Result<StripeAccount, ProviderError> {
        Ok(StripeAccount {
            account_id: account_id.to_owned(),
            charges_enabled: true,
            payouts_enabled: true,
            disabled_reason: None,
        })
    }

    async fn retrieve_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<StripeInvoice, ProviderError> {
        Ok(StripeInvoice {
            invoice_id: invoice_id.to_owned(),
            subscription_id: None,
            charge_ref: None,
        })
    }

    async fn create_refund(
        &self,
        charge_ref: &str,
        amount_cents: Option<i64>,
    ) -> Result<String, ProviderError> {
        self.refunds
            .lock()
            .unwrap()
            .push((charge_ref.to_owned(), amount_cents));
        Ok(format!("re_{charge_ref}"))
    }

    async fn list_transactions_since(
        &self,
        _since: TimestampMs,
    ) -> Result<Vec<ProviderTransaction>, ProviderError> {
        Ok(self.transactions.lock().unwrap().clone())
    }

    async fn fetch_balance(
        &self,
        _account_id: &str,
    ) -> Result<ProviderBalance, ProviderError> {
        Ok(ProviderBalance {
            available_cents: 123_456,
            currency: CurrencyCode::usd(),
        })
    }
}

#[derive(Default)]
pub struct FakePaystack {
    pub init_requests: Mutex<Vec<PaystackInitRequest>>,
    pub charge_requests: Mutex<Vec<ChargeAuthorizationRequest>>,
    /// Scripted charge outcomes, consumed front-to-back; empty = success.
    pub charge_script: Mutex<VecDeque<ChargeOutcome>>,
    pub transfer_requests: Mutex<Vec<TransferRequest>>,
    pub next_transfer_status: Mutex<TransferInitStatus>,
    pub finalized: Mutex<Vec<(String, String)>>,
    pub recipients_created: Mutex<Vec<RecipientRequest>>,
    pub transactions: Mutex<Vec<ProviderTransaction>>,
}

impl FakePaystack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_charge(&self, outcome: ChargeOutcome) {
        self.charge_script.lock().unwrap().push_back(outcome);
    }

    pub fn set_transfer_status(&self, status: TransferInitStatus) {
        *self.next_transfer_status.lock().unwrap() = status;
    }

    pub fn set_transactions(&self, txs: Vec<ProviderTransaction>) {
        *self.transactions.lock().unwrap() = txs;
    }
}

#[async_trait]
impl PaystackApi for FakePaystack {
    async fn initialize_transaction(
        &self,
        req: &PaystackInitRequest,
    ) -> Result<ProviderSession, ProviderError> {
        self.init_requests.lock().unwrap().push(req.clone());
        Ok(ProviderSession {
            session_id: req.reference.clone(),
            url: format!(
                "https://checkout.paystack.test/{}",
                req.reference
            ),
            provider: Provider::Paystack,
        })
    }

    async fn verify_transaction(
        &self,
        reference: &str,
    ) -> Result<ProviderTransaction, ProviderError> {
        self.transactions
            .lock()
            .unwrap()
            .iter()
            .find(|tx| tx.reference == reference)
            .cloned()
            .ok_or_else(|| {
                ProviderError::Permanent("Transaction not found".into())
            })
    }

    async fn charge_authorization(
        &self,
        req: &ChargeAuthorizationRequest,
    ) -> Result<ChargeOutcome, ProviderError> {
        self.charge_requests.lock().unwrap().push(req.clone());
        let scripted = self.charge_script.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or(ChargeOutcome::Success {
            reference: req.reference.clone(),
        }))
    }

    async fn list_banks(
        &self,
        _country: &str,
    ) -> Result<Vec<Bank>, ProviderError> {
        Ok(vec![Bank {
            name: "Test Bank".to_owned(),
            code: "058".to_owned(),
        }])
    }

    async fn resolve_account(
        &self,
        account_number: &Secret<String>,
        _bank_code: &str,
    ) -> Result<ResolvedAccount, ProviderError> {
        use common::ExposeSecret;
        Ok(ResolvedAccount {
            account_name: "TEST ACCOUNT".to_owned(),
            account_number_last4: common::pii::last4(
                account_number.expose_secret(),
            ),
        })
    }

    async fn create_subaccount(
        &self,
        _req: &SubaccountRequest,
    ) -> Result<String, ProviderError> {
        Ok("ACCT_test".to_owned())
    }

    async fn create_transfer_recipient(
        &self,
        req: &RecipientRequest,
    ) -> Result<String, ProviderError> {
        self.recipients_created.lock().unwrap().push(req.clone());
        Ok("RCP_test".to_owned())
    }

    async fn initiate_transfer(
        &self,
        req: &TransferRequest,
    ) -> Result<TransferInit, ProviderError> {
        self.transfer_requests.lock().unwrap().push(req.clone());
        Ok(TransferInit {
            transfer_code: format!("TRF_{}", req.reference),
            status: *self.next_transfer_status.lock().unwrap(),
        })
    }

    async fn finalize_transfer(
        &self,
        transfer_code: &str,
        otp: &str,
    ) -> Result<(), ProviderError> {
        self.finalized
            .lock()
            .unwrap()
            .push((transfer_code.to_owned(), otp.to_owned()));
        Ok(())
    }

    async fn create_refund(
        &self,
        reference: &str,
        _amount_cents: Option<i64>,
    ) -> Result<String, ProviderError> {
        Ok(format!("rf_{reference}"))
    }

    async fn list_transactions_since(
        &self,
        _since: TimestampMs,
    ) -> Result<Vec<ProviderTransaction>, ProviderError> {
        Ok(self.transactions.lock().unwrap().clone())
    }

    async fn fetch_balance(&self) -> Result<ProviderBalance, ProviderError> {
        Ok(ProviderBalance {
            available_cents: 1_000_000,
            currency: "NGN".parse().expect("static code parses"),
        })
    }
}

/// Fixed-rate [`FxApi`].
pub struct FakeFx {
    rates: Mutex<HashMap<String, Decimal>>,
}

impl Default for FakeFx {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert("NGN".to_owned(), dec!(1500));
        rates.insert("KES".to_owned(), dec!(130));
        rates.insert("ZAR".to_owned(), dec!(18));
        rates.insert("GHS".to_owned(), dec!(15));
        rates.insert("EUR".to_owned(), dec!(0.92));
        rates.insert("GBP".to_owned(), dec!(0.79));
        rates.insert("JPY".to_owned(), dec!(155));
        rates.insert("KRW".to_owned(), dec!(1350));
        Self {
            rates: Mutex::new(rates),
        }
    }
}

impl FakeFx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rate(&self, currency: &str, rate: Decimal) {
        self.rates
            .lock()
            .unwrap()
            .insert(currency.to_owned(), rate);
    }
}

#[async_trait]
impl FxApi for FakeFx {
    async fn usd_rate(
        &self,
        currency: &CurrencyCode,
    ) -> Result<UsdRate, ProviderError> {
        if currency.is_usd() {
            return Ok(UsdRate::ONE);
        }
        let rates = self.rates.lock().unwrap();
        let rate = rates.get(currency.as_str()).copied().ok_or_else(|| {
            ProviderError::Permanent(format!("No rate for {currency}"))
        })?;
        UsdRate::new(rate).map_err(|e| {
            ProviderError::Permanent(format!("Bad fixture rate: {e}"))
        })
    }
}

// --- Notification & alert recorders --- //

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    pub raised: Mutex<Vec<OpsAlert>>,
}

impl RecordingAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raised(&self) -> Vec<OpsAlert> {
        self.raised.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn raise(&self, alert: OpsAlert) -> Result<()> {
        self.raised.lock().unwrap().push(alert);
        Ok(())
    }
}

// --- Harness --- //

/// A fully-faked [`Ctx`] plus typed handles to every fake for inspection.
pub struct TestHarness {
    pub ctx: Ctx,
    pub store: Arc<MemStore>,
    pub cache: Arc<MemCache>,
    pub stripe: Arc<FakeStripe>,
    pub paystack: Arc<FakePaystack>,
    pub fx: Arc<FakeFx>,
    pub notifier: Arc<RecordingNotifier>,
    pub alerts: Arc<RecordingAlerts>,
}

pub fn harness() -> TestHarness {
    let store = Arc::new(MemStore::new());
    let cache = Arc::new(MemCache::new());
    let stripe = Arc::new(FakeStripe::new());
    let paystack = Arc::new(FakePaystack::new());
    let fx = Arc::new(FakeFx::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let alerts = Arc::new(RecordingAlerts::new());
    let session_secret = Secret::new("test-session-secret".to_owned());

    let ctx = Ctx {
        env: DeployEnv::Test,
        store: store.clone(),
        cache: cache.clone(),
        stripe: stripe.clone(),
        paystack: paystack.clone(),
        fx: fx.clone(),
        notifier: notifier.clone(),
        alerts: alerts.clone(),
        pii: PiiCipher::new(&Secret::new("test-pii-key".to_owned())),
        session_secret,
        stripe_webhook_secret: Secret::new("whsec_test".to_owned()),
        paystack_webhook_secret: Secret::new("psk_whsec_test".to_owned()),
        app_url: "https://app.patron.test".to_owned(),
        public_page_url: "https://patron.test".to_owned(),
    };

    TestHarness {
        ctx,
        store,
        cache,
        stripe,
        paystack,
        fx,
        notifier,
        alerts,
    }
}

// --- Fixtures --- //

pub mod fixtures {
    use super::*;
    use crate::models::{FeeModel, PriceTier};

    /// A US creator on the card processor with a $100.00 configured price.
    pub fn creator_us() -> Creator {
        Creator {
            id: Uuid::new_v4(),
            email: "creator@example.com".to_owned(),
            display_name: "Test Creator".to_owned(),
            country: "US".to_owned(),
            currency: CurrencyCode::usd(),
            purpose: CreatorPurpose::Personal,
            default_provider: Some(Provider::Stripe),
            stripe_account_id: Some("acct_test".to_owned()),
            paystack_subaccount_code: None,
            paystack_recipient_code: None,
            bank_code: None,
            bank_account_enc: None,
            fee_mode: FeeMode::Split,
            payout_status: PayoutAccountStatus::Active,
            price_cents: Some(10_000),
            tiers: vec![PriceTier {
                id: Uuid::new_v4(),
                amount_cents: 25_000,
                currency: CurrencyCode::usd(),
                name: "Supporter".to_owned(),
            }],
            created_at: TimestampMs::now(),
        }
    }

    /// A Nigerian service-purpose creator on the regional processor.
    pub fn creator_ng() -> Creator {
        Creator {
            id: Uuid::new_v4(),
            email: "creator-ng@example.com".to_owned(),
            display_name: "Lagos Studio".to_owned(),
            country: "NG".to_owned(),
            currency: "NGN".parse().unwrap(),
            purpose: CreatorPurpose::Service,
            default_provider: Some(Provider::Paystack),
            stripe_account_id: Some("acct_ng".to_owned()),
            paystack_subaccount_code: Some("ACCT_sub_ng".to_owned()),
            paystack_recipient_code: None,
            bank_code: Some("058".to_owned()),
            bank_account_enc: None,
            fee_mode: FeeMode::Split,
            payout_status: PayoutAccountStatus::Active,
            price_cents: Some(500_000),
            tiers: Vec::new(),
            created_at: TimestampMs::now(),
        }
    }

    /// An active monthly subscription with a period ending 30 days after
    /// `now`.
    pub fn subscription_active(now: TimestampMs) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            creator_id: Uuid::new_v4(),
            subscriber_id: Uuid::new_v4(),
            amount_cents: 10_000,
            currency: CurrencyCode::usd(),
            interval: BillingInterval::Month,
            status: SubscriptionStatus::Active,
            fee_model: FeeModel::SplitV1,
            fee_mode: FeeMode::Split,
            provider: Provider::Stripe,
            stripe_subscription_id: Some("sub_test".to_owned()),
            stripe_customer_id: Some("cus_test".to_owned()),
            paystack_authorization_enc: None,
            current_period_end: Some(
                now.saturating_add(Duration::from_secs(30 * 24 * 3600)),
            ),
            cancel_at_period_end: false,
            canceled_at: None,
            cancel_reason: None,
            ltv_cents: 0,
            manage_token_nonce: 0,
            retry_count: 0,
            past_due_since: None,
            created_at: now,
            updated_at: now,
        }
    }
}
