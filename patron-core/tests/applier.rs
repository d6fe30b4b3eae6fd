//! End-to-end applier scenarios over the in-memory fakes: webhook
//! ingestion, duplicate delivery, refunds, dispute flows, and
//! out-of-order lifecycle events.

use common::{
    api::models::Provider,
    time::TimestampMs,
    tokens,
};
use patron_core::{
    apply,
    models::{PaymentStatus, SubscriptionStatus, WebhookEventStatus},
    testing::{fixtures, harness, TestHarness},
    webhook::{self, event::decode_stripe},
};
use serde_json::json;
use uuid::Uuid;

fn invoice_paid_payload(
    event_id: &str,
    charge_ref: &str,
    creator_id: Uuid,
    amount: i64,
    period_end_secs: i64,
) -> serde_json::Value {
    json!({
        "id": event_id,
        "type": "invoice.paid",
        "created": 1_720_000_000,
        "data": { "object": {
            "id": "in_1",
            "charge": charge_ref,
            "subscription": "sub_A",
            "customer": "cus_A",
            "customer_email": "fan@example.com",
            "amount_paid": amount,
            "currency": "usd",
            "lines": { "data": [ { "period": { "end": period_end_secs } } ] },
            "subscription_details": {
                "metadata": { "creator_id": creator_id.to_string() }
            }
        }}
    })
}

async fn ingest_stripe(
    h: &TestHarness,
    payload: &serde_json::Value,
) -> common::api::models::WebhookAck {
    let body = serde_json::to_vec(payload).unwrap();
    let header = tokens::stripe_signature_header(
        &h.ctx.stripe_webhook_secret,
        &body,
        TimestampMs::now(),
    );
    webhook::ingest(
        &h.ctx,
        None,
        Provider::Stripe,
        Some(&header),
        &body,
    )
    .await
    .expect("ingest should ack")
}

/// Posting the same `charge.success` twice yields one payment row, one
/// LTV increment, and a bumped retry count on the stored event.
#[tokio::test]
async fn double_webhook_single_payment() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    let payload = invoice_paid_payload(
        "evt_dup",
        "ch_A",
        creator_id,
        10_450,
        1_722_600_000,
    );
    ingest_stripe(&h, &payload).await;
    ingest_stripe(&h, &payload).await;

    let payments = h.store.payments();
    assert_eq!(payments.len(), 1);
    let payment = &payments[0];
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert_eq!(payment.gross_cents, 10_450);
    assert_eq!(payment.fee_cents, 900);
    assert_eq!(payment.net_cents, 9_550);

    let events = h.store.webhook_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, WebhookEventStatus::Processed);
    assert_eq!(events[0].retry_count, 1);
    assert_eq!(events[0].payment_id, Some(payment.id));

    let subs = h.store.subscriptions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].status, SubscriptionStatus::Active);
    assert_eq!(subs[0].ltv_cents, 9_550);
    assert_eq!(subs[0].stripe_subscription_id.as_deref(), Some("sub_A"));
}

/// Concurrent application of the same decoded event produces exactly one
/// payment row; the loser either bails on the subject lock or no-ops on
/// the unique event id.
#[tokio::test]
async fn concurrent_apply_single_payment() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    let payload = invoice_paid_payload(
        "evt_race",
        "ch_race",
        creator_id,
        10_000,
        1_722_600_000,
    );
    let decoded = decode_stripe(&payload).unwrap();

    let ev = match &decoded.event {
        patron_core::webhook::event::BillingEvent::ChargeSucceeded(ev) => {
            ev.clone()
        }
        _ => panic!("Expected a charge"),
    };

    let (a, b) = tokio::join!(
        apply::apply_charge_success(&h.ctx, &ev, "evt_race"),
        apply::apply_charge_success(&h.ctx, &ev, "evt_race"),
    );
    // At least one side must have applied; a loser surfaces as a
    // retryable lock error.
    assert!(a.is_ok() || b.is_ok());

    // Retry any loser the way the webhook scheduler would.
    if a.is_err() || b.is_err() {
        apply::apply_charge_success(&h.ctx, &ev, "evt_race")
            .await
            .expect("Retry should succeed");
    }

    assert_eq!(h.store.payments().len(), 1);
    assert_eq!(h.store.subscriptions()[0].ltv_cents, 9_550);
}

/// Partial refunds reverse fees proportionally and clamp-decrement LTV.
#[tokio::test]
async fn refund_ratio_and_ltv() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    // Subscriber paid 104.50: fee 9.00, creator 95.50.
    ingest_stripe(
        &h,
        &invoice_paid_payload(
            "evt_chg",
            "ch_R",
            creator_id,
            10_450,
            1_722_600_000,
        ),
    )
    .await;

    // Refund half.
    let refund_payload = json!({
        "id": "evt_refund",
        "type": "charge.refunded",
        "created": 1_720_100_000,
        "data": { "object": {
            "id": "ch_R",
            "amount_refunded": 5_225,
            "refunds": { "data": [ { "id": "re_1", "amount": 5_225 } ] }
        }}
    });
    ingest_stripe(&h, &refund_payload).await;

    let payments = h.store.payments();
    assert_eq!(payments.len(), 2);
    let refund = payments
        .iter()
        .find(|p| p.amount_cents < 0)
        .expect("Refund row exists");
    assert_eq!(refund.amount_cents, -5_225);
    assert_eq!(refund.fee_cents, -450);
    assert_eq!(refund.net_cents, -4_775);
    assert_eq!(refund.status, PaymentStatus::Refunded);

    let original = payments
        .iter()
        .find(|p| p.amount_cents > 0)
        .expect("Original row exists");
    assert_eq!(original.status, PaymentStatus::Refunded);

    // 9550 - 4775, clamped at zero were it to go below.
    assert_eq!(h.store.subscriptions()[0].ltv_cents, 4_775);
}

/// A full refund's USD shadow cancels the original exactly, because the
/// refund copies the original payment's exchange rate.
#[tokio::test]
async fn refund_reporting_cancels_exactly() {
    let h = harness();
    let creator = fixtures::creator_ng();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    let charge = json!({
        "event": "charge.success",
        "data": {
            "reference": "psk_fx_1",
            "amount": 1_500_000,
            "currency": "NGN",
            "paid_at": "2024-07-01T10:00:00Z",
            "customer": { "email": "fan@example.com" },
            "authorization": { "authorization_code": "AUTH_fx" },
            "metadata": { "creator_id": creator_id.to_string() },
        }
    });
    let body = serde_json::to_vec(&charge).unwrap();
    let header = tokens::paystack_signature_header(
        &h.ctx.paystack_webhook_secret,
        &body,
    );
    webhook::ingest(
        &h.ctx,
        None,
        Provider::Paystack,
        Some(&header),
        &body,
    )
    .await
    .unwrap();

    let refund = json!({
        "event": "refund.processed",
        "data": {
            "reference": "rf_1",
            "transaction_reference": "psk_fx_1",
            "amount": 1_500_000,
            "created_at": "2024-07-02T10:00:00Z",
        }
    });
    let body = serde_json::to_vec(&refund).unwrap();
    let header = tokens::paystack_signature_header(
        &h.ctx.paystack_webhook_secret,
        &body,
    );
    webhook::ingest(
        &h.ctx,
        None,
        Provider::Paystack,
        Some(&header),
        &body,
    )
    .await
    .unwrap();

    let payments = h.store.payments();
    let original =
        payments.iter().find(|p| p.amount_cents > 0).unwrap();
    let refund_row =
        payments.iter().find(|p| p.amount_cents < 0).unwrap();

    assert_eq!(
        refund_row.reporting.exchange_rate,
        original.reporting.exchange_rate
    );
    assert_eq!(
        refund_row.reporting.net_cents,
        -original.reporting.net_cents
    );
    assert_eq!(
        refund_row.reporting.gross_cents,
        -original.reporting.gross_cents
    );
    assert!(!refund_row.reporting.is_estimated);
}

/// A late `invoice.payment_failed` for an already-renewed period does not
/// demote the subscription.
#[tokio::test]
async fn late_payment_failed_is_historical() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    // Renewal for the period ending 2024-08-01 arrives first.
    let august = 1_722_470_400; // 2024-08-01
    ingest_stripe(
        &h,
        &invoice_paid_payload(
            "evt_aug",
            "ch_aug",
            creator_id,
            10_000,
            august,
        ),
    )
    .await;

    // Then the failure for the period ending 2024-07-01 trickles in.
    let july = 1_719_792_000; // 2024-07-01
    let failed = json!({
        "id": "evt_late_fail",
        "type": "invoice.payment_failed",
        "created": 1_720_000_100,
        "data": { "object": {
            "subscription": "sub_A",
            "amount_due": 10_000,
            "currency": "usd",
            "lines": { "data": [ { "period": { "end": july } } ] }
        }}
    });
    ingest_stripe(&h, &failed).await;

    let subs = h.store.subscriptions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].status, SubscriptionStatus::Active);
    assert_eq!(
        subs[0].current_period_end.unwrap().as_ms(),
        august * 1000
    );

    // The failed attempt is still recorded for dunning.
    assert!(h
        .store
        .payments()
        .iter()
        .any(|p| p.status == PaymentStatus::Failed));
}

/// A lost dispute claws back the full amount; a won dispute only flips
/// status.
#[tokio::test]
async fn dispute_outcomes() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    ingest_stripe(
        &h,
        &invoice_paid_payload(
            "evt_d1",
            "ch_disputed",
            creator_id,
            10_450,
            1_722_600_000,
        ),
    )
    .await;

    let opened = json!({
        "id": "evt_d2",
        "type": "charge.dispute.created",
        "created": 1_720_200_000,
        "data": { "object": { "charge": "ch_disputed" } }
    });
    ingest_stripe(&h, &opened).await;
    assert_eq!(
        h.store
            .payments()
            .iter()
            .find(|p| p.amount_cents > 0)
            .unwrap()
            .status,
        PaymentStatus::Disputed
    );

    let lost = json!({
        "id": "evt_d3",
        "type": "charge.dispute.closed",
        "created": 1_720_300_000,
        "data": { "object": { "charge": "ch_disputed", "status": "lost" } }
    });
    ingest_stripe(&h, &lost).await;

    let payments = h.store.payments();
    let original =
        payments.iter().find(|p| p.amount_cents > 0).unwrap();
    assert_eq!(original.status, PaymentStatus::DisputeLost);
    let reversal =
        payments.iter().find(|p| p.amount_cents < 0).unwrap();
    assert_eq!(reversal.amount_cents, -10_450);
    assert_eq!(h.store.subscriptions()[0].ltv_cents, 0);
}

/// Unknown event types are stored and acknowledged but never applied.
#[tokio::test]
async fn unknown_event_soft_skip() {
    let h = harness();
    let payload = json!({
        "id": "evt_unknown",
        "type": "price.created",
        "created": 1_720_000_000,
        "data": { "object": { "id": "price_1" } }
    });
    let ack = ingest_stripe(&h, &payload).await;
    assert!(ack.received);

    let events = h.store.webhook_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, WebhookEventStatus::Skipped);
    assert!(h.store.payments().is_empty());
}

/// Signature failures are rejected without recording an event.
#[tokio::test]
async fn bad_signature_records_nothing() {
    let h = harness();
    let body = br#"{"id":"evt_x","type":"invoice.paid"}"#;
    let result = webhook::ingest(
        &h.ctx,
        None,
        Provider::Stripe,
        Some("t=1,v1=deadbeef"),
        body,
    )
    .await;
    assert!(result.is_err());
    assert!(h.store.webhook_events().is_empty());

    let missing = webhook::ingest(
        &h.ctx,
        None,
        Provider::Stripe,
        None,
        body,
    )
    .await;
    assert!(missing.is_err());
}
