//! Paystack REST adapter.
//!
//! JSON requests with the platform secret key. Paystack wraps every
//! response in a `{ status, message, data }` envelope; `status: false`
//! with a 200 still means failure, so both layers are checked.

use async_trait::async_trait;
use chrono::DateTime;
use common::{
    money::CurrencyCode,
    time::TimestampMs,
    ExposeSecret, Secret,
};
use serde_json::{json, Value as Json};
use tracing::debug;
use uuid::Uuid;

use crate::traits::{
    Bank, ChargeAuthorizationRequest, ChargeOutcome, PaystackApi,
    PaystackInitRequest, ProviderBalance, ProviderError, ProviderSession,
    ProviderTransaction, RecipientRequest, ResolvedAccount,
    SubaccountRequest, TransferInit, TransferInitStatus, TransferRequest,
};

use super::{classify_status, http_client};

const DEFAULT_BASE_URL: &str = "https://api.paystack.co";

pub struct PaystackClient {
    client: reqwest::Client,
    base_url: String,
    secret_key: Secret<String>,
}

impl PaystackClient {
    pub fn new(secret_key: Secret<String>) -> Self {
        Self::with_base_url(secret_key, DEFAULT_BASE_URL.to_owned())
    }

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

    /// POST, unwrap the envelope, return `data`.
    async fn post(
        &self,
        path: &str,
        body: Json,
    ) -> Result<Json, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "POST");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        Self::unwrap_envelope(resp).await
    }

    async fn get(&self, path: &str) -> Result<Json, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "GET");
        let resp = self
            .client
            .get(&url)
            .bearer_auth(self.secret_key.expose_secret())
            .send()
            .await?;
        Self::unwrap_envelope(resp).await
    }

    async fn unwrap_envelope(
        resp: reqwest::Response,
    ) -> Result<Json, ProviderError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(
                status,
                resp.text().await.unwrap_or_default(),
            ));
        }
        let envelope: Json =
            resp.json().await.map_err(ProviderError::from)?;
        let ok = envelope
            .pointer("/status")
            .and_then(Json::as_bool)
            .unwrap_or(false);
        if !ok {
            let message = envelope
                .pointer("/message")
                .and_then(Json::as_str)
                .unwrap_or("unknown error");
            return Err(ProviderError::Permanent(message.to_owned()));
        }
        Ok(envelope
            .pointer("/data")
            .cloned()
            .unwrap_or(Json::Null))
    }
}

fn str_field<'a>(json: &'a Json, pointer: &str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Json::as_str)
}

fn require(
    json: &Json,
    pointer: &str,
    what: &str,
) -> Result<String, ProviderError> {
    str_field(json, pointer)
        .map(str::to_owned)
        .ok_or_else(|| {
            ProviderError::Permanent(format!("Response missing {what}"))
        })
}

#[async_trait]
impl PaystackApi for PaystackClient {
    async fn initialize_transaction(
        &self,
        req: &PaystackInitRequest,
    ) -> Result<ProviderSession, ProviderError> {
        let mut body = json!({
            "email": req.email,
            "amount": req.amount_cents,
            "currency": req.currency.as_str(),
            "reference": req.reference,
            "callback_url": req.callback_url,
            "metadata": {
                "creator_id": req.creator_id.to_string(),
                "tier_id": req.tier_id.map(|t| t.to_string()),
            },
        });
        if let Some(code) = req.subaccount_code.as_deref() {
            body["subaccount"] = json!(code);
        }

        let data = self.post("/transaction/initialize", body).await?;
        Ok(ProviderSession {
            session_id: req.reference.clone(),
            url: require(&data, "/authorization_url", "authorization_url")?,
            provider: common::api::models::Provider::Paystack,
        })
    }

    async fn verify_transaction(
        &self,
        reference: &str,
    ) -> Result<ProviderTransaction, ProviderError> {
        let data = self
            .get(&format!("/transaction/verify/{reference}"))
            .await?;
        Ok(parse_transaction(&data).ok_or_else(|| {
            ProviderError::Permanent("Unparseable transaction".into())
        })?)
    }

    async fn charge_authorization(
        &self,
        req: &ChargeAuthorizationRequest,
    ) -> Result<ChargeOutcome, ProviderError> {
        let body = json!({
            "authorization_code": req.authorization_code.expose_secret(),
            "email": req.email,
            "amount": req.amount_cents,
            "currency": req.currency.as_str(),
            "reference": req.reference,
            "metadata": {
                "subscription_id": req.subscription_id.to_string(),
            },
        });
        let data = self
            .post("/transaction/charge_authorization", body)
            .await?;
        let reference = require(&data, "/reference", "reference")?;
        match str_field(&data, "/status") {
            Some("success") => Ok(ChargeOutcome::Success { reference }),
            Some(other) => Ok(ChargeOutcome::Failed {
                reference,
                reason: str_field(&data, "/gateway_response")
                    .unwrap_or(other)
                    .to_owned(),
            }),
            None => Err(ProviderError::Permanent(
                "Charge response missing status".into(),
            )),
        }
    }

    async fn list_banks(
        &self,
        country: &str,
    ) -> Result<Vec<Bank>, ProviderError> {
        let data = self.get(&format!("/bank?country={country}")).await?;
        Ok(data
            .as_array()
            .map(|banks| {
                banks
                    .iter()
                    .filter_map(|bank| {
                        Some(Bank {
                            name: str_field(bank, "/name")?.to_owned(),
                            code: str_field(bank, "/code")?.to_owned(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn resolve_account(
        &self,
        account_number: &Secret<String>,
        bank_code: &str,
    ) -> Result<ResolvedAccount, ProviderError> {
        let data = self
            .get(&format!(
                "/bank/resolve?account_number={}&bank_code={bank_code}",
                account_number.expose_secret()
            ))
            .await?;
        let resolved_number =
            require(&data, "/account_number", "account_number")?;
        Ok(ResolvedAccount {
            account_name: require(&data, "/account_name", "account_name")?,
            account_number_last4: common::pii::last4(&resolved_number),
        })
    }

    async fn create_subaccount(
        &self,
        req: &SubaccountRequest,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "business_name": req.business_name,
            "bank_code": req.bank_code,
            "account_number": req.account_number.expose_secret(),
            "percentage_charge": req.percentage_charge,
        });
        let data = self.post("/subaccount", body).await?;
        require(&data, "/subaccount_code", "subaccount_code")
    }

    async fn create_transfer_recipient(
        &self,
        req: &RecipientRequest,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "type": "nuban",
            "name": req.name,
            "account_number": req.account_number.expose_secret(),
            "bank_code": req.bank_code,
            "currency": req.currency.as_str(),
        });
        let data = self.post("/transferrecipient", body).await?;
        require(&data, "/recipient_code", "recipient_code")
    }

    async fn initiate_transfer(
        &self,
        req: &TransferRequest,
    ) -> Result<TransferInit, ProviderError> {
        let body = json!({
            "source": "balance",
            "recipient": req.recipient_code,
            "amount": req.amount_cents,
            "currency": req.currency.as_str(),
            "reference": req.reference,
            "reason": req.reason,
        });
        let data = self.post("/transfer", body).await?;
        let transfer_code =
            require(&data, "/transfer_code", "transfer_code")?;
        let status = match str_field(&data, "/status") {
            Some("otp") => TransferInitStatus::RequiresOtp,
            Some("success") => TransferInitStatus::Success,
            _ => TransferInitStatus::Pending,
        };
        Ok(TransferInit {
            transfer_code,
            status,
        })
    }

    async fn finalize_transfer(
        &self,
        transfer_code: &str,
        otp: &str,
    ) -> Result<(), ProviderError> {
        self.post(
            "/transfer/finalize_transfer",
            json!({ "transfer_code": transfer_code, "otp": otp }),
        )
        .await?;
        Ok(())
    }

    async fn create_refund(
        &self,
        reference: &str,
        amount_cents: Option<i64>,
    ) -> Result<String, ProviderError> {
        let mut body = json!({ "transaction": reference });
        if let Some(amount) = amount_cents {
            body["amount"] = json!(amount);
        }
        let data = self.post("/refund", body).await?;
        // Refund ids come back numeric.
        Ok(data
            .pointer("/id")
            .map(|id| id.to_string().trim_matches('"').to_owned())
            .unwrap_or_else(|| reference.to_owned()))
    }

    async fn list_transactions_since(
        &self,
        since: TimestampMs,
    ) -> Result<Vec<ProviderTransaction>, ProviderError> {
        let from = since
            .to_datetime()
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        let data = self
            .get(&format!("/transaction?from={from}&perPage=100"))
            .await?;
        Ok(data
            .as_array()
            .map(|txs| txs.iter().filter_map(parse_transaction).collect())
            .unwrap_or_default())
    }

    async fn fetch_balance(&self) -> Result<ProviderBalance, ProviderError> {
        let data = self.get("/balance").await?;
        let available_cents = data
            .pointer("/0/balance")
            .and_then(Json::as_i64)
            .unwrap_or(0);
        let currency = str_field(&data, "/0/currency")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| {
                "NGN".parse().expect("static code parses")
            });
        Ok(ProviderBalance {
            available_cents,
            currency,
        })
    }
}

fn parse_transaction(data: &Json) -> Option<ProviderTransaction> {
    let occurred_at = str_field(data, "/paid_at")
        .or_else(|| str_field(data, "/created_at"))
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| TimestampMs::from_datetime(dt.to_utc()))
        .unwrap_or_else(TimestampMs::now);
    Some(ProviderTransaction {
        reference: str_field(data, "/reference")?.to_owned(),
        amount_cents: data.pointer("/amount").and_then(Json::as_i64)?,
        currency: str_field(data, "/currency")?
            .parse::<CurrencyCode>()
            .ok()?,
        status: str_field(data, "/status")
            .unwrap_or("unknown")
            .to_ascii_lowercase(),
        creator_id: str_field(data, "/metadata/creator_id")
            .and_then(|s| Uuid::parse_str(s).ok()),
        subscriber_email: str_field(data, "/customer/email")
            .map(str::to_owned),
        occurred_at,
    })
}
