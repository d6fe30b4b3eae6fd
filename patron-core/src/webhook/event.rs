//! Typed provider events.
//!
//! Provider webhook payloads are dynamic JSON whose shapes differ by API
//! version. This module decodes them into one tagged [`BillingEvent`] enum;
//! a decoded, typed event is the only input the applier accepts. Unknown
//! event types decode to [`BillingEvent::Unknown`], which ingestion stores
//! and acknowledges but never applies.

use chrono::DateTime;
use common::{
    api::{
        error::CoreApiError,
        models::{BillingInterval, Provider},
    },
    money::CurrencyCode,
    time::TimestampMs,
};
use rust_decimal::Decimal;
use serde_json::Value as Json;
use uuid::Uuid;

/// A decoded event plus its durable dedup key.
#[derive(Clone, Debug)]
pub struct DecodedEvent {
    /// Stripe: the provider event id as-is. Paystack:
    /// `paystack_{event_type}_{reference}`; the event type must be part of
    /// the key because the same reference emits multiple lifecycle events.
    pub event_key: String,
    pub event_type: String,
    pub provider: Provider,
    pub event: BillingEvent,
}

#[derive(Clone, Debug)]
pub enum BillingEvent {
    ChargeSucceeded(ChargeSucceeded),
    ChargeRefunded(ChargeRefunded),
    DisputeOpened(DisputeOpened),
    DisputeClosed(DisputeClosed),
    PaymentFailed(PaymentFailed),
    SubscriptionUpdated(SubscriptionUpdated),
    SubscriptionDeleted(SubscriptionDeleted),
    TransferRequiresOtp(TransferEvent),
    TransferSucceeded(TransferEvent),
    TransferFailed(TransferFailed),
    AccountUpdated(AccountUpdated),
    /// Stored and acknowledged, never applied.
    Unknown { event_type: String },
}

impl BillingEvent {
    /// Charge-success events may be short-circuited at ingest when the
    /// payment row already exists. Transfer and refund events never are:
    /// the payout row is created *before* the transfer, and a later
    /// transfer event is a state transition we must apply.
    pub fn short_circuitable(&self) -> bool {
        matches!(self, Self::ChargeSucceeded(_))
    }

    /// The provider charge ref for the short-circuit lookup, if any.
    pub fn charge_ref(&self) -> Option<&str> {
        match self {
            Self::ChargeSucceeded(ev) => Some(ev.charge_ref.as_str()),
            _ => None,
        }
    }
}

/// A settled inbound charge: one-time checkout completion or a recurring
/// invoice being paid.
#[derive(Clone, Debug)]
pub struct ChargeSucceeded {
    pub provider: Provider,
    pub charge_ref: String,
    /// Gross amount the provider collected, minor units.
    pub amount_cents: i64,
    pub currency: CurrencyCode,
    pub interval: BillingInterval,
    pub creator_id: Option<Uuid>,
    pub tier_id: Option<Uuid>,
    pub subscriber_email: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    /// Plaintext from the event; encrypted before it is persisted.
    pub paystack_authorization_code: Option<String>,
    /// Checkout session id / transaction reference, for session backfill.
    pub checkout_ref: Option<String>,
    pub period_end: Option<TimestampMs>,
    /// Fee the provider says it computed, for mismatch logging.
    pub provider_fee_cents: Option<i64>,
    /// Settlement rate the provider reported, local per USD.
    pub provider_exchange_rate: Option<Decimal>,
    pub occurred_at: TimestampMs,
}

#[derive(Clone, Debug)]
pub struct ChargeRefunded {
    pub provider: Provider,
    pub charge_ref: String,
    /// Positive, minor units.
    pub refund_amount_cents: i64,
    pub refund_ref: Option<String>,
    pub occurred_at: TimestampMs,
}

#[derive(Clone, Debug)]
pub struct DisputeOpened {
    pub provider: Provider,
    pub charge_ref: String,
    pub occurred_at: TimestampMs,
}

#[derive(Clone, Debug)]
pub struct DisputeClosed {
    pub provider: Provider,
    pub charge_ref: String,
    pub won: bool,
    pub occurred_at: TimestampMs,
}

#[derive(Clone, Debug)]
pub struct PaymentFailed {
    pub provider: Provider,
    pub stripe_subscription_id: Option<String>,
    pub charge_ref: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<CurrencyCode>,
    /// End of the billing period the failed attempt was for. The FSM guard
    /// compares this against the subscription's current period so a late
    /// failure can't demote an already-renewed subscription.
    pub period_end: Option<TimestampMs>,
    pub occurred_at: TimestampMs,
}

#[derive(Clone, Debug)]
pub struct SubscriptionUpdated {
    pub stripe_subscription_id: String,
    pub provider_status: String,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<TimestampMs>,
    pub occurred_at: TimestampMs,
}

#[derive(Clone, Debug)]
pub struct SubscriptionDeleted {
    pub stripe_subscription_id: String,
    pub occurred_at: TimestampMs,
}

#[derive(Clone, Debug)]
pub struct TransferEvent {
    pub transfer_ref: String,
    pub transfer_code: Option<String>,
    pub amount_cents: Option<i64>,
    /// Provider-reported settlement time for `transfer.success`.
    pub paid_at: Option<TimestampMs>,
    pub occurred_at: TimestampMs,
}

#[derive(Clone, Debug)]
pub struct TransferFailed {
    pub transfer_ref: String,
    pub transfer_code: Option<String>,
    pub reason: String,
    /// Account-level failures (invalid bank details) restrict the
    /// creator's payout status; transient failures don't.
    pub account_level: bool,
    pub occurred_at: TimestampMs,
}

#[derive(Clone, Debug)]
pub struct AccountUpdated {
    pub stripe_account_id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub disabled_reason: Option<String>,
    pub occurred_at: TimestampMs,
}

// --- JSON helpers --- //

fn str_at<'a>(json: &'a Json, pointer: &str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Json::as_str)
}

fn i64_at(json: &Json, pointer: &str) -> Option<i64> {
    json.pointer(pointer).and_then(Json::as_i64)
}

fn bool_at(json: &Json, pointer: &str) -> Option<bool> {
    json.pointer(pointer).and_then(Json::as_bool)
}

fn uuid_at(json: &Json, pointer: &str) -> Option<Uuid> {
    str_at(json, pointer).and_then(|s| Uuid::parse_str(s).ok())
}

fn currency_at(json: &Json, pointer: &str) -> Option<CurrencyCode> {
    str_at(json, pointer).and_then(|s| s.parse().ok())
}

fn unix_secs_at(json: &Json, pointer: &str) -> Option<TimestampMs> {
    i64_at(json, pointer)
        .and_then(|secs| TimestampMs::try_from_ms(secs * 1000).ok())
}

fn iso8601_at(json: &Json, pointer: &str) -> Option<TimestampMs> {
    str_at(json, pointer)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| TimestampMs::from_datetime(dt.to_utc()))
}

fn decimal_at(json: &Json, pointer: &str) -> Option<Decimal> {
    match json.pointer(pointer) {
        Some(Json::String(s)) => s.parse().ok(),
        Some(Json::Number(n)) => n.to_string().parse().ok(),
        _ => None,
    }
}

// --- Stripe decoding --- //

/// Decode a Stripe event envelope. Malformed envelopes (no id/type) are
/// rejected; unknown event types decode to [`BillingEvent::Unknown`].
pub fn decode_stripe(payload: &Json) -> Result<DecodedEvent, CoreApiError> {
    let event_id = str_at(payload, "/id")
        .ok_or_else(|| CoreApiError::invalid_request("Missing event id"))?
        .to_owned();
    let event_type = str_at(payload, "/type")
        .ok_or_else(|| CoreApiError::invalid_request("Missing event type"))?
        .to_owned();
    let occurred_at = unix_secs_at(payload, "/created")
        .unwrap_or_else(TimestampMs::now);
    let obj = payload
        .pointer("/data/object")
        .ok_or_else(|| CoreApiError::invalid_request("Missing data.object"))?;

    let event = match event_type.as_str() {
        // Recurring renewal: an invoice was paid.
        "invoice.paid" | "invoice.payment_succeeded" => {
            let charge_ref = str_at(obj, "/charge")
                .or_else(|| str_at(obj, "/payment_intent"))
                .ok_or_else(|| {
                    CoreApiError::invalid_request("Invoice missing charge")
                })?
                .to_owned();
            BillingEvent::ChargeSucceeded(ChargeSucceeded {
                provider: Provider::Stripe,
                charge_ref,
                amount_cents: i64_at(obj, "/amount_paid").unwrap_or(0),
                currency: currency_at(obj, "/currency")
                    .unwrap_or_else(CurrencyCode::usd),
                interval: BillingInterval::Month,
                creator_id: uuid_at(obj, "/metadata/creator_id").or_else(
                    || {
                        uuid_at(
                            obj,
                            "/subscription_details/metadata/creator_id",
                        )
                    },
                ),
                tier_id: uuid_at(obj, "/metadata/tier_id"),
                subscriber_email: str_at(obj, "/customer_email")
                    .map(str::to_owned),
                stripe_subscription_id: str_at(obj, "/subscription")
                    .map(str::to_owned),
                stripe_customer_id: str_at(obj, "/customer")
                    .map(str::to_owned),
                paystack_authorization_code: None,
                checkout_ref: None,
                period_end: unix_secs_at(
                    obj,
                    "/lines/data/0/period/end",
                )
                .or_else(|| unix_secs_at(obj, "/period_end")),
                provider_fee_cents: i64_at(obj, "/application_fee_amount"),
                provider_exchange_rate: decimal_at(obj, "/exchange_rate"),
                occurred_at,
            })
        }
        // One-time checkout completed.
        "checkout.session.completed" => {
            let session_id = str_at(obj, "/id")
                .ok_or_else(|| {
                    CoreApiError::invalid_request("Session missing id")
                })?
                .to_owned();
            let charge_ref = str_at(obj, "/payment_intent")
                .map(str::to_owned)
                .unwrap_or_else(|| session_id.clone());
            BillingEvent::ChargeSucceeded(ChargeSucceeded {
                provider: Provider::Stripe,
                charge_ref,
                amount_cents: i64_at(obj, "/amount_total").unwrap_or(0),
                currency: currency_at(obj, "/currency")
                    .unwrap_or_else(CurrencyCode::usd),
                interval: match str_at(obj, "/mode") {
                    Some("subscription") => BillingInterval::Month,
                    _ => BillingInterval::OneTime,
                },
                creator_id: uuid_at(obj, "/metadata/creator_id"),
                tier_id: uuid_at(obj, "/metadata/tier_id"),
                subscriber_email: str_at(obj, "/customer_details/email")
                    .or_else(|| str_at(obj, "/customer_email"))
                    .map(str::to_owned),
                stripe_subscription_id: str_at(obj, "/subscription")
                    .map(str::to_owned),
                stripe_customer_id: str_at(obj, "/customer")
                    .map(str::to_owned),
                paystack_authorization_code: None,
                checkout_ref: Some(session_id),
                period_end: None,
                provider_fee_cents: i64_at(obj, "/application_fee_amount"),
                provider_exchange_rate: None,
                occurred_at,
            })
        }
        "charge.refunded" => {
            let charge_ref = require_str(obj, "/id", "Charge missing id")?;
            // The charge object carries the cumulative amount_refunded plus
            // the individual refunds; the newest refund is first.
            let refund_amount = i64_at(obj, "/refunds/data/0/amount")
                .or_else(|| i64_at(obj, "/amount_refunded"))
                .unwrap_or(0);
            BillingEvent::ChargeRefunded(ChargeRefunded {
                provider: Provider::Stripe,
                charge_ref,
                refund_amount_cents: refund_amount,
                refund_ref: str_at(obj, "/refunds/data/0/id")
                    .map(str::to_owned),
                occurred_at,
            })
        }
        "charge.dispute.created" => {
            BillingEvent::DisputeOpened(DisputeOpened {
                provider: Provider::Stripe,
                charge_ref: require_str(
                    obj,
                    "/charge",
                    "Dispute missing charge",
                )?,
                occurred_at,
            })
        }
        "charge.dispute.closed" =>
            BillingEvent::DisputeClosed(DisputeClosed {
                provider: Provider::Stripe,
                charge_ref: require_str(
                    obj,
                    "/charge",
                    "Dispute missing charge",
                )?,
                won: str_at(obj, "/status") == Some("won"),
                occurred_at,
            }),
        "invoice.payment_failed" =>
            BillingEvent::PaymentFailed(PaymentFailed {
                provider: Provider::Stripe,
                stripe_subscription_id: str_at(obj, "/subscription")
                    .map(str::to_owned),
                charge_ref: str_at(obj, "/charge").map(str::to_owned),
                amount_cents: i64_at(obj, "/amount_due"),
                currency: currency_at(obj, "/currency"),
                period_end: unix_secs_at(obj, "/lines/data/0/period/end")
                    .or_else(|| unix_secs_at(obj, "/period_end")),
                occurred_at,
            }),
        "customer.subscription.updated" =>
            BillingEvent::SubscriptionUpdated(SubscriptionUpdated {
                stripe_subscription_id: require_str(
                    obj,
                    "/id",
                    "Subscription missing id",
                )?,
                provider_status: str_at(obj, "/status")
                    .unwrap_or("unknown")
                    .to_owned(),
                cancel_at_period_end: bool_at(obj, "/cancel_at_period_end")
                    .unwrap_or(false),
                current_period_end: unix_secs_at(
                    obj,
                    "/current_period_end",
                ),
                occurred_at,
            }),
        "customer.subscription.deleted" =>
            BillingEvent::SubscriptionDeleted(SubscriptionDeleted {
                stripe_subscription_id: require_str(
                    obj,
                    "/id",
                    "Subscription missing id",
                )?,
                occurred_at,
            }),
        "account.updated" => BillingEvent::AccountUpdated(AccountUpdated {
            stripe_account_id: require_str(
                obj,
                "/id",
                "Account missing id",
            )?,
            charges_enabled: bool_at(obj, "/charges_enabled")
                .unwrap_or(false),
            payouts_enabled: bool_at(obj, "/payouts_enabled")
                .unwrap_or(false),
            disabled_reason: str_at(obj, "/requirements/disabled_reason")
                .map(str::to_owned),
            occurred_at,
        }),
        _ => BillingEvent::Unknown {
            event_type: event_type.clone(),
        },
    };

    Ok(DecodedEvent {
        event_key: event_id,
        event_type,
        provider: Provider::Stripe,
        event,
    })
}

// --- Paystack decoding --- //

/// Decode a Paystack event envelope.
pub fn decode_paystack(payload: &Json) -> Result<DecodedEvent, CoreApiError> {
    let event_type = str_at(payload, "/event")
        .ok_or_else(|| CoreApiError::invalid_request("Missing event type"))?
        .to_owned();
    let data = payload
        .pointer("/data")
        .ok_or_else(|| CoreApiError::invalid_request("Missing data"))?;

    let reference = str_at(data, "/reference")
        .or_else(|| str_at(data, "/transfer_code"))
        .or_else(|| str_at(data, "/id"))
        .map(str::to_owned)
        .or_else(|| i64_at(data, "/id").map(|id| id.to_string()))
        .ok_or_else(|| {
            CoreApiError::invalid_request("Missing reference")
        })?;
    let event_key = format!("paystack_{event_type}_{reference}");
    let occurred_at = iso8601_at(data, "/paid_at")
        .or_else(|| iso8601_at(data, "/created_at"))
        .unwrap_or_else(TimestampMs::now);

    let event = match event_type.as_str() {
        "charge.success" => BillingEvent::ChargeSucceeded(ChargeSucceeded {
            provider: Provider::Paystack,
            charge_ref: reference.clone(),
            amount_cents: i64_at(data, "/amount").unwrap_or(0),
            currency: currency_at(data, "/currency")
                .unwrap_or_else(|| "NGN".parse().unwrap()),
            interval: match str_at(data, "/metadata/interval") {
                Some("one_time") => BillingInterval::OneTime,
                _ => BillingInterval::Month,
            },
            creator_id: uuid_at(data, "/metadata/creator_id"),
            tier_id: uuid_at(data, "/metadata/tier_id"),
            subscriber_email: str_at(data, "/customer/email")
                .map(str::to_owned),
            stripe_subscription_id: None,
            stripe_customer_id: None,
            paystack_authorization_code: str_at(
                data,
                "/authorization/authorization_code",
            )
            .map(str::to_owned),
            checkout_ref: Some(reference.clone()),
            period_end: None,
            provider_fee_cents: i64_at(data, "/fees"),
            provider_exchange_rate: None,
            occurred_at,
        }),
        "refund.processed" => BillingEvent::ChargeRefunded(ChargeRefunded {
            provider: Provider::Paystack,
            charge_ref: str_at(data, "/transaction_reference")
                .unwrap_or(reference.as_str())
                .to_owned(),
            refund_amount_cents: i64_at(data, "/amount").unwrap_or(0),
            refund_ref: str_at(data, "/refund_reference")
                .map(str::to_owned),
            occurred_at,
        }),
        "transfer.requires_otp" =>
            BillingEvent::TransferRequiresOtp(transfer_event(
                data,
                &reference,
                occurred_at,
            )),
        "transfer.success" => BillingEvent::TransferSucceeded(
            transfer_event(data, &reference, occurred_at),
        ),
        "transfer.failed" | "transfer.reversed" => {
            let reason = str_at(data, "/reason")
                .or_else(|| str_at(data, "/message"))
                .unwrap_or("unknown")
                .to_owned();
            let reason_lower = reason.to_ascii_lowercase();
            BillingEvent::TransferFailed(TransferFailed {
                transfer_ref: reference.clone(),
                transfer_code: str_at(data, "/transfer_code")
                    .map(str::to_owned),
                account_level: reason_lower.contains("account")
                    || reason_lower.contains("bank"),
                reason,
                occurred_at,
            })
        }
        "invoice.payment_failed" =>
            BillingEvent::PaymentFailed(PaymentFailed {
                provider: Provider::Paystack,
                stripe_subscription_id: None,
                charge_ref: Some(reference.clone()),
                amount_cents: i64_at(data, "/amount"),
                currency: currency_at(data, "/currency"),
                period_end: iso8601_at(data, "/period_end"),
                occurred_at,
            }),
        _ => BillingEvent::Unknown {
            event_type: event_type.clone(),
        },
    };

    Ok(DecodedEvent {
        event_key,
        event_type,
        provider: Provider::Paystack,
        event,
    })
}

fn transfer_event(
    data: &Json,
    reference: &str,
    occurred_at: TimestampMs,
) -> TransferEvent {
    TransferEvent {
        transfer_ref: reference.to_owned(),
        transfer_code: str_at(data, "/transfer_code").map(str::to_owned),
        amount_cents: i64_at(data, "/amount"),
        paid_at: iso8601_at(data, "/paid_at")
            .or_else(|| iso8601_at(data, "/transferred_at")),
        occurred_at,
    }
}

fn require_str(
    json: &Json,
    pointer: &str,
    msg: &str,
) -> Result<String, CoreApiError> {
    str_at(json, pointer)
        .map(str::to_owned)
        .ok_or_else(|| CoreApiError::invalid_request(msg))
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn stripe_invoice_paid_decodes() {
        let creator_id = Uuid::new_v4();
        let payload = json!({
            "id": "evt_1A",
            "type": "invoice.paid",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "in_1",
                "charge": "ch_A",
                "subscription": "sub_1",
                "customer": "cus_1",
                "amount_paid": 10_450,
                "currency": "usd",
                "lines": { "data": [
                    { "period": { "end": 1_702_600_000 } }
                ]},
                "subscription_details": {
                    "metadata": { "creator_id": creator_id.to_string() }
                }
            }}
        });
        let decoded = decode_stripe(&payload).unwrap();
        assert_eq!(decoded.event_key, "evt_1A");
        let BillingEvent::ChargeSucceeded(ev) = decoded.event else {
            panic!("Expected ChargeSucceeded");
        };
        assert_eq!(ev.charge_ref, "ch_A");
        assert_eq!(ev.amount_cents, 10_450);
        assert_eq!(ev.interval, BillingInterval::Month);
        assert_eq!(ev.creator_id, Some(creator_id));
        assert_eq!(
            ev.period_end.unwrap().as_ms(),
            1_702_600_000_000
        );
        assert_eq!(ev.stripe_subscription_id.as_deref(), Some("sub_1"));
    }

    #[test]
    fn paystack_key_includes_event_type() {
        let success = json!({
            "event": "transfer.success",
            "data": {
                "reference": "trf_ref_1",
                "transfer_code": "TRF_x",
                "amount": 500_000,
                "paid_at": "2024-07-01T10:00:00Z",
            }
        });
        let otp = json!({
            "event": "transfer.requires_otp",
            "data": { "reference": "trf_ref_1", "transfer_code": "TRF_x" }
        });
        // Same reference, two lifecycle events, two distinct keys.
        let k1 = decode_paystack(&success).unwrap().event_key;
        let k2 = decode_paystack(&otp).unwrap().event_key;
        assert_eq!(k1, "paystack_transfer.success_trf_ref_1");
        assert_eq!(k2, "paystack_transfer.requires_otp_trf_ref_1");
        assert_ne!(k1, k2);
    }

    #[test]
    fn paystack_charge_success_decodes() {
        let payload = json!({
            "event": "charge.success",
            "data": {
                "reference": "psk_ref_9",
                "amount": 500_000,
                "currency": "NGN",
                "paid_at": "2024-07-01T10:00:00Z",
                "customer": { "email": "fan@example.com" },
                "authorization": { "authorization_code": "AUTH_abc" },
                "metadata": { "creator_id": Uuid::new_v4().to_string() },
                "fees": 7_500,
            }
        });
        let decoded = decode_paystack(&payload).unwrap();
        let BillingEvent::ChargeSucceeded(ev) = decoded.event else {
            panic!("Expected ChargeSucceeded");
        };
        assert_eq!(ev.provider, Provider::Paystack);
        assert_eq!(ev.amount_cents, 500_000);
        assert_eq!(
            ev.paystack_authorization_code.as_deref(),
            Some("AUTH_abc")
        );
        assert_eq!(ev.provider_fee_cents, Some(7_500));
        assert_eq!(ev.checkout_ref.as_deref(), Some("psk_ref_9"));
    }

    #[test]
    fn unknown_types_soft_reject() {
        let payload = json!({
            "id": "evt_2",
            "type": "price.created",
            "data": { "object": {} }
        });
        let decoded = decode_stripe(&payload).unwrap();
        assert!(matches!(
            decoded.event,
            BillingEvent::Unknown { ref event_type } if event_type == "price.created"
        ));
    }

    #[test]
    fn malformed_envelope_rejected() {
        assert!(decode_stripe(&json!({"type": "invoice.paid"})).is_err());
        assert!(decode_paystack(&json!({"data": {}})).is_err());
    }

    #[test]
    fn dispute_closed_outcomes() {
        for (status, won) in [("won", true), ("lost", false)] {
            let payload = json!({
                "id": "evt_d",
                "type": "charge.dispute.closed",
                "created": 1_700_000_000,
                "data": { "object": { "charge": "ch_A", "status": status } }
            });
            let decoded = decode_stripe(&payload).unwrap();
            let BillingEvent::DisputeClosed(ev) = decoded.event else {
                panic!("Expected DisputeClosed");
            };
            assert_eq!(ev.won, won);
        }
    }
}
