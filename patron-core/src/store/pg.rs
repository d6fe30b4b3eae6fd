//! Postgres production store.
//!
//! Entities map to rows by hand (enums as TEXT via `as_str`/`FromStr`,
//! timestamps as BIGINT millis), so the store compiles without a live
//! database. The two multi-row appliers ([`Store::persist_charge`],
//! [`Store::persist_refund`]) each run in one transaction; unique-key
//! conflicts on `provider_event_id` are treated as already-done.

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{
    api::models::{BillingInterval, Provider},
    money::CurrencyCode,
    time::TimestampMs,
};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde_json::Value as Json;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Postgres, Row, Transaction,
};
use uuid::Uuid;

use crate::{
    models::{
        Activity, CheckoutSession, Creator, DailyStats, Payment,
        PaymentStatus, PayoutAccountStatus, PriceTier, Subscriber,
        Subscription, WebhookEvent, WebhookEventStatus,
    },
    traits::{CheckedCharge, CheckedRefund, Store, WebhookUpsert},
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .context("Could not connect to Postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Migrations failed")
    }

    async fn load_tiers(&self, creator_id: Uuid) -> Result<Vec<PriceTier>> {
        let rows = sqlx::query(
            "SELECT id, amount_cents, currency, name \
             FROM creator_tiers WHERE creator_id = $1",
        )
        .bind(creator_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tier_from_row).collect()
    }

    async fn creator_from_row(&self, row: &PgRow) -> Result<Creator> {
        let id: Uuid = row.try_get("id")?;
        let tiers = self.load_tiers(id).await?;
        Ok(Creator {
            id,
            email: row.try_get("email")?,
            display_name: row.try_get("display_name")?,
            country: row.try_get("country")?,
            currency: parse_currency(row.try_get("currency")?)?,
            purpose: match row.try_get::<&str, _>("purpose")? {
                "service" => crate::models::CreatorPurpose::Service,
                _ => crate::models::CreatorPurpose::Personal,
            },
            default_provider: row
                .try_get::<Option<String>, _>("default_provider")?
                .and_then(|s| s.parse().ok()),
            stripe_account_id: row.try_get("stripe_account_id")?,
            paystack_subaccount_code: row
                .try_get("paystack_subaccount_code")?,
            paystack_recipient_code: row
                .try_get("paystack_recipient_code")?,
            bank_code: row.try_get("bank_code")?,
            bank_account_enc: row.try_get("bank_account_enc")?,
            fee_mode: row.try_get::<&str, _>("fee_mode")?.parse()?,
            payout_status: row
                .try_get::<&str, _>("payout_status")?
                .parse::<PayoutAccountStatus>()?,
            price_cents: row.try_get("price_cents")?,
            tiers,
            created_at: ts(row.try_get("created_at")?)?,
        })
    }
}

// --- Row mapping helpers --- //

fn ts(ms: i64) -> Result<TimestampMs> {
    TimestampMs::try_from_ms(ms)
}

fn opt_ts(ms: Option<i64>) -> Result<Option<TimestampMs>> {
    ms.map(ts).transpose()
}

fn parse_currency(s: String) -> Result<CurrencyCode> {
    s.parse::<CurrencyCode>()
        .map_err(|e| anyhow::anyhow!("Bad currency in db: {e}"))
}

fn tier_from_row(row: &PgRow) -> Result<PriceTier> {
    Ok(PriceTier {
        id: row.try_get("id")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: parse_currency(row.try_get("currency")?)?,
        name: row.try_get("name")?,
    })
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber> {
    Ok(Subscriber {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        dispute_count: row.try_get("dispute_count")?,
        blocked_reason: row.try_get("blocked_reason")?,
        created_at: ts(row.try_get("created_at")?)?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription> {
    Ok(Subscription {
        id: row.try_get("id")?,
        creator_id: row.try_get("creator_id")?,
        subscriber_id: row.try_get("subscriber_id")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: parse_currency(row.try_get("currency")?)?,
        interval: row
            .try_get::<&str, _>("billing_interval")?
            .parse::<BillingInterval>()?,
        status: row.try_get::<&str, _>("status")?.parse()?,
        fee_model: row.try_get::<&str, _>("fee_model")?.parse()?,
        fee_mode: row.try_get::<&str, _>("fee_mode")?.parse()?,
        provider: row.try_get::<&str, _>("provider")?.parse()?,
        stripe_subscription_id: row.try_get("stripe_subscription_id")?,
        stripe_customer_id: row.try_get("stripe_customer_id")?,
        paystack_authorization_enc: row
            .try_get("paystack_authorization_enc")?,
        current_period_end: opt_ts(row.try_get("current_period_end")?)?,
        cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        canceled_at: opt_ts(row.try_get("canceled_at")?)?,
        cancel_reason: row
            .try_get::<Option<String>, _>("cancel_reason")?
            .and_then(|s| serde_json::from_value(Json::String(s)).ok()),
        ltv_cents: row.try_get("ltv_cents")?,
        manage_token_nonce: row.try_get("manage_token_nonce")?,
        retry_count: row.try_get("retry_count")?,
        past_due_since: opt_ts(row.try_get("past_due_since")?)?,
        created_at: ts(row.try_get("created_at")?)?,
        updated_at: ts(row.try_get("updated_at")?)?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment> {
    Ok(Payment {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        creator_id: row.try_get("creator_id")?,
        subscriber_id: row.try_get("subscriber_id")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: parse_currency(row.try_get("currency")?)?,
        gross_cents: row.try_get("gross_cents")?,
        fee_cents: row.try_get("fee_cents")?,
        net_cents: row.try_get("net_cents")?,
        creator_fee_cents: row.try_get("creator_fee_cents")?,
        subscriber_fee_cents: row.try_get("subscriber_fee_cents")?,
        fee_model: row.try_get::<&str, _>("fee_model")?.parse()?,
        payment_type: row.try_get::<&str, _>("payment_type")?.parse()?,
        status: row.try_get::<&str, _>("status")?.parse()?,
        provider: row.try_get::<&str, _>("provider")?.parse()?,
        provider_event_id: row.try_get("provider_event_id")?,
        provider_charge_ref: row.try_get("provider_charge_ref")?,
        paystack_transfer_code: row.try_get("paystack_transfer_code")?,
        occurred_at: ts(row.try_get("occurred_at")?)?,
        reporting: crate::models::Reporting {
            currency: parse_currency(row.try_get("reporting_currency")?)?,
            gross_cents: row.try_get("reporting_gross_cents")?,
            fee_cents: row.try_get("reporting_fee_cents")?,
            net_cents: row.try_get("reporting_net_cents")?,
            exchange_rate: row
                .try_get::<Decimal, _>("reporting_exchange_rate")?,
            rate_source: row
                .try_get::<&str, _>("reporting_rate_source")?
                .parse()?,
            rate_timestamp: ts(row.try_get("reporting_rate_timestamp")?)?,
            is_estimated: row.try_get("reporting_is_estimated")?,
        },
        fee_delta_cents: row.try_get("fee_delta_cents")?,
        created_at: ts(row.try_get("created_at")?)?,
    })
}

fn webhook_event_from_row(row: &PgRow) -> Result<WebhookEvent> {
    Ok(WebhookEvent {
        id: row.try_get("id")?,
        provider: row.try_get::<&str, _>("provider")?.parse()?,
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        status: row.try_get::<&str, _>("status")?.parse()?,
        retry_count: row.try_get("retry_count")?,
        payment_id: row.try_get("payment_id")?,
        payload: row.try_get("payload")?,
        failure_reason: row.try_get("failure_reason")?,
        processed_at: opt_ts(row.try_get("processed_at")?)?,
        created_at: ts(row.try_get("created_at")?)?,
    })
}

fn session_from_row(row: &PgRow) -> Result<CheckoutSession> {
    Ok(CheckoutSession {
        session_id: row.try_get("session_id")?,
        provider: row.try_get::<&str, _>("provider")?.parse()?,
        creator_id: row.try_get("creator_id")?,
        subscriber_email: row.try_get("subscriber_email")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: parse_currency(row.try_get("currency")?)?,
        interval: row
            .try_get::<&str, _>("billing_interval")?
            .parse::<BillingInterval>()?,
        url: row.try_get("url")?,
        status: row.try_get::<&str, _>("status")?.parse()?,
        subscription_id: row.try_get("subscription_id")?,
        created_at: ts(row.try_get("created_at")?)?,
    })
}

async fn insert_payment_tx(
    tx: &mut Transaction<'_, Postgres>,
    p: &Payment,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO payments (\
            id, subscription_id, creator_id, subscriber_id, amount_cents, \
            currency, gross_cents, fee_cents, net_cents, \
            creator_fee_cents, subscriber_fee_cents, fee_model, \
            payment_type, status, provider, provider_event_id, \
            provider_charge_ref, paystack_transfer_code, occurred_at, \
            reporting_currency, reporting_gross_cents, \
            reporting_fee_cents, reporting_net_cents, \
            reporting_exchange_rate, reporting_rate_source, \
            reporting_rate_timestamp, reporting_is_estimated, \
            fee_delta_cents, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,\
                 $17,$18,$19,$20,$21,$22,$23,$24,$25,$26,$27,$28,$29) \
         ON CONFLICT (provider_event_id) DO NOTHING",
    )
    .bind(p.id)
    .bind(p.subscription_id)
    .bind(p.creator_id)
    .bind(p.subscriber_id)
    .bind(p.amount_cents)
    .bind(p.currency.as_str())
    .bind(p.gross_cents)
    .bind(p.fee_cents)
    .bind(p.net_cents)
    .bind(p.creator_fee_cents)
    .bind(p.subscriber_fee_cents)
    .bind(p.fee_model.as_str())
    .bind(p.payment_type.as_str())
    .bind(p.status.as_str())
    .bind(p.provider.as_str())
    .bind(p.provider_event_id.as_deref())
    .bind(p.provider_charge_ref.as_deref())
    .bind(p.paystack_transfer_code.as_deref())
    .bind(p.occurred_at.as_ms())
    .bind(p.reporting.currency.as_str())
    .bind(p.reporting.gross_cents)
    .bind(p.reporting.fee_cents)
    .bind(p.reporting.net_cents)
    .bind(p.reporting.exchange_rate)
    .bind(p.reporting.rate_source.as_str())
    .bind(p.reporting.rate_timestamp.as_ms())
    .bind(p.reporting.is_estimated)
    .bind(p.fee_delta_cents)
    .bind(p.created_at.as_ms())
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn insert_activity_tx(
    tx: &mut Transaction<'_, Postgres>,
    a: &Activity,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO activities (id, user_id, kind, occurred_at) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(a.id)
    .bind(a.user_id)
    .bind(serde_json::to_value(&a.kind)?)
    .bind(a.occurred_at.as_ms())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn subscription_binds<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    s: &'q Subscription,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(s.id)
        .bind(s.creator_id)
        .bind(s.subscriber_id)
        .bind(s.amount_cents)
        .bind(s.currency.as_str())
        .bind(s.interval.as_str())
        .bind(s.status.as_str())
        .bind(s.fee_model.as_str())
        .bind(s.fee_mode.as_str())
        .bind(s.provider.as_str())
        .bind(s.stripe_subscription_id.as_deref())
        .bind(s.stripe_customer_id.as_deref())
        .bind(s.paystack_authorization_enc.as_deref())
        .bind(s.current_period_end.map(|t| t.as_ms()))
        .bind(s.cancel_at_period_end)
        .bind(s.canceled_at.map(|t| t.as_ms()))
        .bind(s.cancel_reason.map(|r| {
            serde_json::to_value(r)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default()
        }))
        .bind(s.manage_token_nonce)
        .bind(s.retry_count)
        .bind(s.past_due_since.map(|t| t.as_ms()))
        .bind(s.created_at.as_ms())
        .bind(s.updated_at.as_ms())
}

#[async_trait]
impl Store for PgStore {
    // --- Creators --- //

    async fn get_creator(&self, id: Uuid) -> Result<Option<Creator>> {
        let row = sqlx::query("SELECT * FROM creators WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.creator_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn find_creator_by_stripe_account(
        &self,
        stripe_account_id: &str,
    ) -> Result<Option<Creator>> {
        let row = sqlx::query(
            "SELECT * FROM creators WHERE stripe_account_id = $1",
        )
        .bind(stripe_account_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.creator_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_service_creators(&self) -> Result<Vec<Creator>> {
        let rows = sqlx::query(
            "SELECT * FROM creators WHERE purpose = 'service'",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.creator_from_row(row).await?);
        }
        Ok(out)
    }

    async fn list_creators(&self) -> Result<Vec<Creator>> {
        let rows = sqlx::query("SELECT * FROM creators")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.creator_from_row(row).await?);
        }
        Ok(out)
    }

    async fn set_creator_recipient_code(
        &self,
        id: Uuid,
        recipient_code: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE creators SET paystack_recipient_code = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(recipient_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_creator_payout_status(
        &self,
        id: Uuid,
        status: PayoutAccountStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE creators SET payout_status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_creator_balance_cache(
        &self,
        id: Uuid,
        provider: Provider,
        available_cents: i64,
        currency: &CurrencyCode,
        as_of: TimestampMs,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO creator_balances \
                (creator_id, provider, available_cents, currency, as_of) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (creator_id, provider) DO UPDATE \
                SET available_cents = $3, currency = $4, as_of = $5",
        )
        .bind(id)
        .bind(provider.as_str())
        .bind(available_cents)
        .bind(currency.as_str())
        .bind(as_of.as_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Subscribers --- //

    async fn get_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>> {
        sqlx::query("SELECT * FROM subscribers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| subscriber_from_row(&row))
            .transpose()
    }

    async fn get_or_create_subscriber(
        &self,
        email: &str,
    ) -> Result<Subscriber> {
        let row = sqlx::query(
            "INSERT INTO subscribers (id, email, dispute_count, created_at) \
             VALUES ($1, $2, 0, $3) \
             ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(TimestampMs::now().as_ms())
        .fetch_one(&self.pool)
        .await?;
        subscriber_from_row(&row)
    }

    async fn set_subscriber_blocked(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE subscribers SET blocked_reason = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_dispute_count(&self, id: Uuid) -> Result<i32> {
        let row = sqlx::query(
            "UPDATE subscribers SET dispute_count = dispute_count + 1 \
             WHERE id = $1 RETURNING dispute_count",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("dispute_count")?)
    }

    // --- Subscriptions --- //

    async fn get_subscription(
        &self,
        id: Uuid,
    ) -> Result<Option<Subscription>> {
        sqlx::query("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| subscription_from_row(&row))
            .transpose()
    }

    async fn find_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        sqlx::query(
            "SELECT * FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| subscription_from_row(&row))
        .transpose()
    }

    async fn find_subscription(
        &self,
        creator_id: Uuid,
        subscriber_id: Uuid,
        interval: BillingInterval,
    ) -> Result<Option<Subscription>> {
        sqlx::query(
            "SELECT * FROM subscriptions \
             WHERE creator_id = $1 AND subscriber_id = $2 \
               AND billing_interval = $3 AND status != 'canceled' \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(creator_id)
        .bind(subscriber_id)
        .bind(interval.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| subscription_from_row(&row))
        .transpose()
    }

    async fn update_subscription(&self, sub: &Subscription) -> Result<()> {
        let query = sqlx::query(
            "UPDATE subscriptions SET \
                creator_id = $2, subscriber_id = $3, amount_cents = $4, \
                currency = $5, billing_interval = $6, status = $7, \
                fee_model = $8, fee_mode = $9, provider = $10, \
                stripe_subscription_id = $11, stripe_customer_id = $12, \
                paystack_authorization_enc = $13, \
                current_period_end = $14, cancel_at_period_end = $15, \
                canceled_at = $16, cancel_reason = $17, \
                manage_token_nonce = $18, retry_count = $19, \
                past_due_since = $20, created_at = $21, updated_at = $22 \
             WHERE id = $1",
        );
        subscription_binds(query, sub).execute(&self.pool).await?;
        Ok(())
    }

    async fn count_active_subscribers(
        &self,
        creator_id: Uuid,
    ) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT subscriber_id) AS subscribers \
             FROM subscriptions \
             WHERE creator_id = $1 AND status = 'active'",
        )
        .bind(creator_id)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("subscribers")?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn list_due_paystack_subscriptions(
        &self,
        now: TimestampMs,
    ) -> Result<Vec<Subscription>> {
        sqlx::query(
            "SELECT * FROM subscriptions \
             WHERE provider = 'paystack' AND status = 'active' \
               AND billing_interval = 'month' \
               AND current_period_end IS NOT NULL \
               AND current_period_end <= $1",
        )
        .bind(now.as_ms())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(subscription_from_row)
        .collect()
    }

    async fn list_past_due_subscriptions(
        &self,
    ) -> Result<Vec<Subscription>> {
        sqlx::query("SELECT * FROM subscriptions WHERE status = 'past_due'")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(subscription_from_row)
            .collect()
    }

    async fn list_pending_subscriptions_older_than(
        &self,
        cutoff: TimestampMs,
    ) -> Result<Vec<Subscription>> {
        sqlx::query(
            "SELECT * FROM subscriptions \
             WHERE status = 'pending' AND created_at < $1",
        )
        .bind(cutoff.as_ms())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(subscription_from_row)
        .collect()
    }

    async fn list_subscriptions_renewing_between(
        &self,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<Vec<Subscription>> {
        sqlx::query(
            "SELECT * FROM subscriptions \
             WHERE status = 'active' AND billing_interval = 'month' \
               AND current_period_end >= $1 AND current_period_end < $2",
        )
        .bind(start.as_ms())
        .bind(end.as_ms())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(subscription_from_row)
        .collect()
    }

    async fn list_subscriptions_canceled_since(
        &self,
        since: TimestampMs,
    ) -> Result<Vec<Subscription>> {
        sqlx::query(
            "SELECT * FROM subscriptions \
             WHERE status = 'canceled' AND canceled_at >= $1",
        )
        .bind(since.as_ms())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(subscription_from_row)
        .collect()
    }

    // --- Payments --- //

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        sqlx::query("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| payment_from_row(&row))
            .transpose()
    }

    async fn find_payment_by_charge_ref(
        &self,
        provider: Provider,
        charge_ref: &str,
    ) -> Result<Option<Payment>> {
        sqlx::query(
            "SELECT * FROM payments \
             WHERE provider = $1 AND provider_charge_ref = $2 \
               AND payment_type != 'payout' \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(provider.as_str())
        .bind(charge_ref)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| payment_from_row(&row))
        .transpose()
    }

    async fn find_payment_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<Payment>> {
        sqlx::query("SELECT * FROM payments WHERE provider_event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| payment_from_row(&row))
            .transpose()
    }

    async fn find_payout_by_transfer_ref(
        &self,
        transfer_ref: &str,
    ) -> Result<Option<Payment>> {
        sqlx::query(
            "SELECT * FROM payments \
             WHERE payment_type = 'payout' AND provider_charge_ref = $1",
        )
        .bind(transfer_ref)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| payment_from_row(&row))
        .transpose()
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_payment_tx(&mut tx, payment).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        status: PaymentStatus,
        occurred_at: Option<TimestampMs>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE payments SET status = $2, \
                occurred_at = COALESCE($3, occurred_at) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(occurred_at.map(|t| t.as_ms()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_payment_transfer_code(
        &self,
        id: Uuid,
        transfer_code: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE payments SET paystack_transfer_code = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(transfer_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_charge(&self, checked: CheckedCharge) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = insert_payment_tx(&mut tx, &checked.payment).await?;
        if !inserted {
            // Unique event id conflict: a competing worker finished first.
            tx.rollback().await?;
            return Ok(());
        }

        if checked.subscription_is_new {
            let query = sqlx::query(
                "INSERT INTO subscriptions (\
                    id, creator_id, subscriber_id, amount_cents, currency, \
                    billing_interval, status, fee_model, fee_mode, \
                    provider, stripe_subscription_id, stripe_customer_id, \
                    paystack_authorization_enc, current_period_end, \
                    cancel_at_period_end, canceled_at, cancel_reason, \
                    manage_token_nonce, retry_count, past_due_since, \
                    created_at, updated_at, ltv_cents) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,\
                         $15,$16,$17,$18,$19,$20,$21,$22,$23)",
            );
            subscription_binds(query, &checked.subscription)
                .bind(checked.ltv_increment_cents.max(0))
                .execute(&mut *tx)
                .await?;
        } else {
            let query = sqlx::query(
                "UPDATE subscriptions SET \
                    creator_id = $2, subscriber_id = $3, \
                    amount_cents = $4, currency = $5, \
                    billing_interval = $6, status = $7, fee_model = $8, \
                    fee_mode = $9, provider = $10, \
                    stripe_subscription_id = $11, stripe_customer_id = $12, \
                    paystack_authorization_enc = $13, \
                    current_period_end = $14, cancel_at_period_end = $15, \
                    canceled_at = $16, cancel_reason = $17, \
                    manage_token_nonce = $18, retry_count = $19, \
                    past_due_since = $20, created_at = $21, \
                    updated_at = $22, ltv_cents = ltv_cents + $23 \
                 WHERE id = $1",
            );
            subscription_binds(query, &checked.subscription)
                .bind(checked.ltv_increment_cents)
                .execute(&mut *tx)
                .await?;
        }

        for activity in &checked.activities {
            insert_activity_tx(&mut tx, activity).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn persist_refund(&self, checked: CheckedRefund) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = insert_payment_tx(&mut tx, &checked.refund).await?;
        if !inserted {
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query("UPDATE payments SET status = $2 WHERE id = $1")
            .bind(checked.original_payment_id)
            .bind(checked.original_new_status.as_str())
            .execute(&mut *tx)
            .await?;

        if let Some(subscription_id) = checked.subscription_id {
            sqlx::query(
                "UPDATE subscriptions \
                 SET ltv_cents = GREATEST(0, ltv_cents - $2) \
                 WHERE id = $1",
            )
            .bind(subscription_id)
            .bind(checked.ltv_decrement_cents)
            .execute(&mut *tx)
            .await?;
        }

        for activity in &checked.activities {
            insert_activity_tx(&mut tx, activity).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_failed_charges_since(
        &self,
        since: TimestampMs,
    ) -> Result<Vec<Payment>> {
        sqlx::query(
            "SELECT * FROM payments \
             WHERE status = 'failed' AND payment_type != 'payout' \
               AND occurred_at >= $1",
        )
        .bind(since.as_ms())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(payment_from_row)
        .collect()
    }

    async fn list_otp_pending_payouts(&self) -> Result<Vec<Payment>> {
        sqlx::query(
            "SELECT * FROM payments \
             WHERE payment_type = 'payout' AND status = 'otp_pending'",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(payment_from_row)
        .collect()
    }

    async fn recent_payout_outcomes(
        &self,
        limit: u32,
    ) -> Result<Vec<PaymentStatus>> {
        let rows = sqlx::query(
            "SELECT status FROM payments WHERE payment_type = 'payout' \
             ORDER BY created_at DESC LIMIT $1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                row.try_get::<&str, _>("status")?
                    .parse::<PaymentStatus>()
            })
            .collect()
    }

    async fn creator_unpaid_net_cents(
        &self,
        creator_id: Uuid,
    ) -> Result<i64> {
        let row = sqlx::query(
            "SELECT \
                COALESCE(SUM(net_cents) FILTER (\
                    WHERE payment_type != 'payout' \
                      AND status NOT IN ('failed', 'pending', 'otp_pending')\
                ), 0) \
                - COALESCE(SUM(amount_cents) FILTER (\
                    WHERE payment_type = 'payout' AND status != 'failed'\
                ), 0) AS unpaid \
             FROM payments WHERE creator_id = $1",
        )
        .bind(creator_id)
        .fetch_one(&self.pool)
        .await?;
        let unpaid: Decimal = row.try_get("unpaid")?;
        Ok(unpaid.to_i64().unwrap_or(0))
    }

    async fn daily_stats(
        &self,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<DailyStats> {
        let payments = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE payment_type != 'payout' \
                    AND amount_cents > 0 AND status != 'failed') \
                    AS charge_count, \
                COALESCE(SUM(reporting_gross_cents) FILTER (\
                    WHERE payment_type != 'payout' AND amount_cents > 0 \
                      AND status != 'failed'), 0) AS gross_usd, \
                COALESCE(SUM(reporting_fee_cents) FILTER (\
                    WHERE payment_type != 'payout' AND amount_cents > 0 \
                      AND status != 'failed'), 0) AS fee_usd, \
                COALESCE(SUM(reporting_net_cents) FILTER (\
                    WHERE payment_type != 'payout' AND amount_cents > 0 \
                      AND status != 'failed'), 0) AS net_usd, \
                COUNT(*) FILTER (WHERE amount_cents < 0) AS refund_count, \
                COALESCE(SUM(-reporting_gross_cents) FILTER (\
                    WHERE amount_cents < 0), 0) AS refunded_usd, \
                COUNT(*) FILTER (WHERE payment_type = 'payout') \
                    AS payout_count \
             FROM payments WHERE occurred_at >= $1 AND occurred_at < $2",
        )
        .bind(start.as_ms())
        .bind(end.as_ms())
        .fetch_one(&self.pool)
        .await?;

        let subs = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE created_at >= $1 AND created_at < $2) \
                    AS new_subs, \
                COUNT(*) FILTER (WHERE canceled_at >= $1 \
                    AND canceled_at < $2) AS canceled_subs \
             FROM subscriptions",
        )
        .bind(start.as_ms())
        .bind(end.as_ms())
        .fetch_one(&self.pool)
        .await?;

        let sum = |row: &PgRow, col: &str| -> Result<i64> {
            let v: Decimal = row.try_get(col)?;
            Ok(v.to_i64().unwrap_or(0))
        };
        Ok(DailyStats {
            charge_count: payments.try_get::<i64, _>("charge_count")? as u64,
            gross_usd_cents: sum(&payments, "gross_usd")?,
            fee_usd_cents: sum(&payments, "fee_usd")?,
            net_usd_cents: sum(&payments, "net_usd")?,
            refund_count: payments.try_get::<i64, _>("refund_count")? as u64,
            refunded_usd_cents: sum(&payments, "refunded_usd")?,
            payout_count: payments.try_get::<i64, _>("payout_count")? as u64,
            new_subscriptions: subs.try_get::<i64, _>("new_subs")? as u64,
            canceled_subscriptions: subs.try_get::<i64, _>("canceled_subs")?
                as u64,
        })
    }

    async fn insert_stats_snapshot(
        &self,
        day: &str,
        stats: &DailyStats,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO stats_snapshots (day, stats, created_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (day) DO UPDATE SET stats = $2",
        )
        .bind(day)
        .bind(serde_json::to_value(stats)?)
        .bind(TimestampMs::now().as_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Checkout sessions --- //

    async fn insert_checkout_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkout_sessions (\
                session_id, provider, creator_id, subscriber_email, \
                amount_cents, currency, billing_interval, url, status, \
                subscription_id, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
        )
        .bind(&session.session_id)
        .bind(session.provider.as_str())
        .bind(session.creator_id)
        .bind(session.subscriber_email.as_deref())
        .bind(session.amount_cents)
        .bind(session.currency.as_str())
        .bind(session.interval.as_str())
        .bind(&session.url)
        .bind(session.status.as_str())
        .bind(session.subscription_id)
        .bind(session.created_at.as_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CheckoutSession>> {
        sqlx::query("SELECT * FROM checkout_sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| session_from_row(&row))
            .transpose()
    }

    async fn link_checkout_session(
        &self,
        session_id: &str,
        subscription_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE checkout_sessions \
             SET subscription_id = $2, status = 'completed' \
             WHERE session_id = $1",
        )
        .bind(session_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Webhook events --- //

    async fn upsert_webhook_event(
        &self,
        provider: Provider,
        event_id: &str,
        event_type: &str,
        payload: &Json,
    ) -> Result<WebhookUpsert> {
        let row = sqlx::query(
            "INSERT INTO webhook_events (\
                id, provider, event_id, event_type, status, retry_count, \
                payload, created_at) \
             VALUES ($1, $2, $3, $4, 'received', 0, $5, $6) \
             ON CONFLICT (event_id) DO UPDATE \
                SET retry_count = webhook_events.retry_count + 1 \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(provider.as_str())
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .bind(TimestampMs::now().as_ms())
        .fetch_one(&self.pool)
        .await?;
        let event = webhook_event_from_row(&row)?;
        let was_duplicate = event.retry_count > 0;
        Ok(WebhookUpsert {
            event,
            was_duplicate,
        })
    }

    async fn get_webhook_event(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEvent>> {
        sqlx::query("SELECT * FROM webhook_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| webhook_event_from_row(&row))
            .transpose()
    }

    async fn set_webhook_status(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        payment_id: Option<Uuid>,
        failure_reason: Option<String>,
    ) -> Result<()> {
        let processed_at = matches!(
            status,
            WebhookEventStatus::Processed | WebhookEventStatus::Skipped
        )
        .then(|| TimestampMs::now().as_ms());
        sqlx::query(
            "UPDATE webhook_events SET status = $2, \
                payment_id = COALESCE($3, payment_id), \
                failure_reason = $4, \
                processed_at = COALESCE($5, processed_at) \
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(status.as_str())
        .bind(payment_id)
        .bind(failure_reason)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Notification log --- //

    async fn try_record_notification(
        &self,
        subscription_id: Uuid,
        notification_type: &str,
        now: TimestampMs,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO notification_log \
                (subscription_id, notification_type, sent_at) \
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(subscription_id)
        .bind(notification_type)
        .bind(now.as_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- Activity --- //

    async fn append_activity(&self, activity: &Activity) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_activity_tx(&mut tx, activity).await?;
        tx.commit().await?;
        Ok(())
    }

    // --- Cleanup --- //

    async fn expire_checkout_sessions(
        &self,
        cutoff: TimestampMs,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE checkout_sessions SET status = 'expired' \
             WHERE status = 'pending' AND created_at < $1",
        )
        .bind(cutoff.as_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_magic_links(
        &self,
        now: TimestampMs,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM magic_link_tokens WHERE expires_at < $1",
        )
        .bind(now.as_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_page_views_before(
        &self,
        cutoff: TimestampMs,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM page_views WHERE viewed_at < $1")
                .bind(cutoff.as_ms())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn expire_overdue_requests(
        &self,
        now: TimestampMs,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE creator_requests SET status = 'expired' \
             WHERE status = 'open' AND due_at < $1",
        )
        .bind(now.as_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_abandoned_onboarding(
        &self,
        cutoff: TimestampMs,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM onboarding_state WHERE updated_at < $1",
        )
        .bind(cutoff.as_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
