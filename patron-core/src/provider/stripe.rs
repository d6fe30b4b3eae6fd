//! Stripe REST adapter.
//!
//! Form-encoded requests against the Stripe API with the platform secret
//! key; connected-account calls carry the `Stripe-Account` header. Only
//! the calls in [`StripeApi`] exist here; the rest of Stripe's surface is
//! deliberately out of reach of the core.

use async_trait::async_trait;
use common::{
    api::models::BillingInterval,
    money::CurrencyCode,
    time::TimestampMs,
    ExposeSecret, Secret,
};
use serde_json::Value as Json;
use tracing::debug;
use uuid::Uuid;

use crate::traits::{
    ProviderBalance, ProviderError, ProviderSession, ProviderTransaction,
    StripeAccount, StripeApi, StripeInvoice, StripeSessionRequest,
};

use super::{classify_status, http_client};

const DEFAULT_BASE_URL: &str = "https://api.stripe.com/v1";

pub struct StripeClient {
    client: reqwest::Client,
    base_url: String,
    secret_key: Secret<String>,
}

impl StripeClient {
    pub fn new(secret_key: Secret<String>) -> Self {
        Self::with_base_url(secret_key, DEFAULT_BASE_URL.to_owned())
    }

    /// Point the adapter at a mock server; used by integration tooling.
    pub fn with_base_url(
        secret_key: Secret<String>,
        base_url: String,
    ) -> Self {
        Self {
            client: http_client(),
            base_url,
            secret_key,
        }
    }

    async fn post_form(
        &self,
        path: &str,
        account: Option<&str>,
        form: &[(String, String)],
    ) -> Result<Json, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "POST");
        let mut req = self
            .client
            .post(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .form(form);
        if let Some(account) = account {
            req = req.header("Stripe-Account", account);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            resp.json().await.map_err(ProviderError::from)
        } else {
            Err(classify_status(
                status,
                resp.text().await.unwrap_or_default(),
            ))
        }
    }

    async fn get(
        &self,
        path: &str,
        account: Option<&str>,
    ) -> Result<Json, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "GET");
        let mut req = self
            .client
            .get(&url)
            .bearer_auth(self.secret_key.expose_secret());
        if let Some(account) = account {
            req = req.header("Stripe-Account", account);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            resp.json().await.map_err(ProviderError::from)
        } else {
            Err(classify_status(
                status,
                resp.text().await.unwrap_or_default(),
            ))
        }
    }
}

fn str_field<'a>(json: &'a Json, pointer: &str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Json::as_str)
}

#[async_trait]
impl StripeApi for StripeClient {
    async fn create_checkout_session(
        &self,
        req: &StripeSessionRequest,
    ) -> Result<ProviderSession, ProviderError> {
        let mut form: Vec<(String, String)> = vec![
            (
                "mode".into(),
                match req.interval {
                    BillingInterval::Month => "subscription".into(),
                    BillingInterval::OneTime => "payment".into(),
                },
            ),
            ("success_url".into(), req.success_url.clone()),
            ("cancel_url".into(), req.cancel_url.clone()),
            (
                "line_items[0][price_data][currency]".into(),
                req.currency.as_str().to_ascii_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]".into(),
                req.amount_cents.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".into(),
                "Membership".into(),
            ),
            ("line_items[0][quantity]".into(), "1".into()),
            (
                "metadata[creator_id]".into(),
                req.creator_id.to_string(),
            ),
        ];
        match req.interval {
            BillingInterval::Month => {
                form.push((
                    "line_items[0][price_data][recurring][interval]".into(),
                    "month".into(),
                ));
                form.push((
                    "subscription_data[metadata][creator_id]".into(),
                    req.creator_id.to_string(),
                ));
                form.push((
                    "subscription_data[application_fee_percent]".into(),
                    // Percent of gross the platform keeps.
                    format!(
                        "{:.2}",
                        req.application_fee_cents as f64 * 100.0
                            / req.amount_cents.max(1) as f64
                    ),
                ));
            }
            BillingInterval::OneTime => {
                form.push((
                    "payment_intent_data[application_fee_amount]".into(),
                    req.application_fee_cents.to_string(),
                ));
            }
        }
        if let Some(email) = req.subscriber_email.as_deref() {
            form.push(("customer_email".into(), email.to_owned()));
        }
        if let Some(tier_id) = req.tier_id {
            form.push(("metadata[tier_id]".into(), tier_id.to_string()));
        }

        let json = self
            .post_form(
                "/checkout/sessions",
                Some(req.connected_account_id.as_str()),
                &form,
            )
            .await?;
        let session_id = str_field(&json, "/id")
            .ok_or_else(|| {
                ProviderError::Permanent("Session missing id".into())
            })?
            .to_owned();
        let url = str_field(&json, "/url")
            .ok_or_else(|| {
                ProviderError::Permanent("Session missing url".into())
            })?
            .to_owned();
        Ok(ProviderSession {
            session_id,
            url,
            provider: common::api::models::Provider::Stripe,
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<(), ProviderError> {
        if at_period_end {
            self.post_form(
                &format!("/subscriptions/{subscription_id}"),
                None,
                &[("cancel_at_period_end".into(), "true".into())],
            )
            .await?;
        } else {
            let url =
                format!("{}/subscriptions/{subscription_id}", self.base_url);
            let resp = self
                .client
                .delete(&url)
                .bearer_auth(self.secret_key.expose_secret())
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(classify_status(
                    status,
                    resp.text().await.unwrap_or_default(),
                ));
            }
        }
        Ok(())
    }

    async fn reactivate_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<(), ProviderError> {
        self.post_form(
            &format!("/subscriptions/{subscription_id}"),
            None,
            &[("cancel_at_period_end".into(), "false".into())],
        )
        .await?;
        Ok(())
    }

    async fn retrieve_account(
        &self,
        account_id: &str,
    ) -> Result<StripeAccount, ProviderError> {
        let json = self.get(&format!("/accounts/{account_id}"), None).await?;
        Ok(StripeAccount {
            account_id: account_id.to_owned(),
            charges_enabled: json
                .pointer("/charges_enabled")
                .and_then(Json::as_bool)
                .unwrap_or(false),
            payouts_enabled: json
                .pointer("/payouts_enabled")
                .and_then(Json::as_bool)
                .unwrap_or(false),
            disabled_reason: str_field(&json, "/requirements/disabled_reason")
                .map(str::to_owned),
        })
    }

    async fn retrieve_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<StripeInvoice, ProviderError> {
        let json = self.get(&format!("/invoices/{invoice_id}"), None).await?;
        Ok(StripeInvoice {
            invoice_id: invoice_id.to_owned(),
            subscription_id: str_field(&json, "/subscription")
                .map(str::to_owned),
            charge_ref: str_field(&json, "/charge").map(str::to_owned),
        })
    }

    async fn create_refund(
        &self,
        charge_ref: &str,
        amount_cents: Option<i64>,
    ) -> Result<String, ProviderError> {
        let mut form: Vec<(String, String)> = vec![(
            if charge_ref.starts_with("pi_") {
                "payment_intent".into()
            } else {
                "charge".into()
            },
            charge_ref.to_owned(),
        )];
        if let Some(amount) = amount_cents {
            form.push(("amount".into(), amount.to_string()));
        }
        let json = self.post_form("/refunds", None, &form).await?;
        str_field(&json, "/id")
            .map(str::to_owned)
            .ok_or_else(|| {
                ProviderError::Permanent("Refund missing id".into())
            })
    }

    async fn list_transactions_since(
        &self,
        since: TimestampMs,
    ) -> Result<Vec<ProviderTransaction>, ProviderError> {
        let created_gte = since.as_ms() / 1000;
        let json = self
            .get(
                &format!("/charges?created[gte]={created_gte}&limit=100"),
                None,
            )
            .await?;
        let charges = json
            .pointer("/data")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(charges
            .iter()
            .filter_map(|charge| {
                let reference = str_field(charge, "/id")?.to_owned();
                let amount_cents =
                    charge.pointer("/amount").and_then(Json::as_i64)?;
                let currency = str_field(charge, "/currency")?
                    .parse::<CurrencyCode>()
                    .ok()?;
                let occurred_at = charge
                    .pointer("/created")
                    .and_then(Json::as_i64)
                    .and_then(|secs| {
                        TimestampMs::try_from_ms(secs * 1000).ok()
                    })?;
                Some(ProviderTransaction {
                    reference,
                    amount_cents,
                    currency,
                    status: str_field(charge, "/status")
                        .unwrap_or("unknown")
                        .to_ascii_lowercase(),
                    creator_id: str_field(charge, "/metadata/creator_id")
                        .and_then(|s| Uuid::parse_str(s).ok()),
                    subscriber_email: str_field(
                        charge,
                        "/billing_details/email",
                    )
                    .map(str::to_owned),
                    occurred_at,
                })
            })
            .collect())
    }

    async fn fetch_balance(
        &self,
        account_id: &str,
    ) -> Result<ProviderBalance, ProviderError> {
        let json = self.get("/balance", Some(account_id)).await?;
        let available_cents = json
            .pointer("/available/0/amount")
            .and_then(Json::as_i64)
            .unwrap_or(0);
        let currency = str_field(&json, "/available/0/currency")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(CurrencyCode::usd);
        Ok(ProviderBalance {
            available_cents,
            currency,
        })
    }
}
