//! HTTP surface tests over the in-memory core fakes.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use common::{time::TimestampMs, tokens};
use patron_core::testing::{fixtures, harness};
use serde_json::{json, Value};
use server::routes::{router, AppState};
use tower::ServiceExt;

fn app(h: &patron_core::testing::TestHarness) -> axum::Router {
    router(AppState {
        ctx: h.ctx.clone(),
        queue: None,
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("Body reads");
    serde_json::from_slice(&bytes).expect("Body is JSON")
}

#[tokio::test]
async fn webhook_signature_rejected_with_400() {
    let h = harness();
    let response = app(&h)
        .oneshot(
            Request::post("/webhooks/stripe")
                .header("stripe-signature", "t=1,v1=deadbeef")
                .body(Body::from(r#"{"id":"evt_1","type":"invoice.paid"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.store.webhook_events().is_empty());
}

#[tokio::test]
async fn webhook_accepted_and_applied_inline() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    let payload = json!({
        "id": "evt_http",
        "type": "invoice.paid",
        "created": 1_720_000_000,
        "data": { "object": {
            "id": "in_1",
            "charge": "ch_http",
            "subscription": "sub_http",
            "customer": "cus_1",
            "customer_email": "fan@example.com",
            "amount_paid": 10_450,
            "currency": "usd",
            "lines": { "data": [ { "period": { "end": 1_722_600_000 } } ] },
            "subscription_details": {
                "metadata": { "creator_id": creator_id.to_string() }
            }
        }}
    });
    let body = serde_json::to_vec(&payload).unwrap();
    let signature = tokens::stripe_signature_header(
        &h.ctx.stripe_webhook_secret,
        &body,
        TimestampMs::now(),
    );

    let response = app(&h)
        .oneshot(
            Request::post("/webhooks/stripe")
                .header("stripe-signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "received": true }));
    assert_eq!(h.store.payments().len(), 1);
}

#[tokio::test]
async fn checkout_creates_session() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    let request = json!({
        "creator_id": creator_id,
        "amount_cents": 10_000,
        "currency": "USD",
        "interval": "month",
        "subscriber_email": "fan@example.com",
        "payer_country": "US",
        "tier_id": null,
    });
    let response = app(&h)
        .oneshot(
            Request::post("/checkout/session")
                .header("content-type", "application/json")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["provider"], "stripe");
    let session_id = body["session_id"].as_str().unwrap().to_owned();

    // Post-redirect polling sees the pending session.
    let response = app(&h)
        .oneshot(
            Request::get(format!(
                "/checkout/session/{session_id}/verify"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "pending");
}

#[tokio::test]
async fn checkout_rejects_unconfigured_amount() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    let request = json!({
        "creator_id": creator_id,
        "amount_cents": 123,
        "currency": "USD",
        "interval": "month",
        "subscriber_email": "fan@example.com",
    });
    let response = app(&h)
        .oneshot(
            Request::post("/checkout/session")
                .header("content-type", "application/json")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn manage_token_flow() {
    let h = harness();
    let now = TimestampMs::now();
    let sub = fixtures::subscription_active(now);
    let sub_id = sub.id;
    h.store.insert_subscription(sub);

    let token =
        tokens::mint_manage_token(&h.ctx.session_secret, sub_id, now);

    let response = app(&h)
        .oneshot(
            Request::get(format!("/subscription/manage/{token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let view = body_json(response).await;
    assert_eq!(view["subscription_id"], json!(sub_id));
    assert_eq!(view["cancel_at_period_end"], json!(false));

    let response = app(&h)
        .oneshot(
            Request::post(format!("/unsubscribe/{token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["cancel_at_period_end"],
        json!(true)
    );

    // Provider-side cancellation mirrored at period end.
    assert_eq!(
        h.stripe.cancels.lock().unwrap().as_slice(),
        &[("sub_test".to_owned(), true)]
    );

    // Garbage tokens never reach the store.
    let response = app(&h)
        .oneshot(
            Request::get("/subscription/manage/not-a-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_requires_token_and_freshness() {
    let h = harness();

    // No token.
    let response = app(&h)
        .oneshot(
            Request::get("/admin/payouts/stuck")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Valid token works for reads.
    let now = TimestampMs::now();
    let token = tokens::mint_admin_token(
        &h.ctx.session_secret,
        tokens::AdminRole::Ops,
        now,
    );
    let response = app(&h)
        .oneshot(
            Request::get("/admin/payouts/stuck")
                .header("x-admin-token", &token)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A stale session cannot refund.
    let stale = tokens::mint_admin_token(
        &h.ctx.session_secret,
        tokens::AdminRole::Admin,
        now.saturating_sub(std::time::Duration::from_secs(60 * 60)),
    );
    let response = app(&h)
        .oneshot(
            Request::post("/admin/refunds")
                .header("x-admin-token", &stale)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "payment_id": uuid::Uuid::new_v4(),
                        "amount_cents": null,
                        "reason": null,
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
