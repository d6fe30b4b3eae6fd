//! Webhook ingestion.
//!
//! Two endpoints, one pipeline: verify the signature over the raw body,
//! compute the durable event key, upsert the `WebhookEvent`, short-circuit
//! already-applied charges, then hand the decoded event to the async
//! processor pool (or process inline when no queue is available, so
//! ingestion has no hard Redis/queue dependency).

use common::{
    api::{
        error::CoreApiError,
        models::{Provider, WebhookAck},
    },
    time::TimestampMs,
    tokens,
};
use serde_json::Value as Json;
use tracing::{info, instrument, warn};

use crate::{
    context::Ctx,
    models::WebhookEventStatus,
    webhook::event::DecodedEvent,
};

/// Typed provider events.
pub mod event;
/// Async worker pool, retries, dead-lettering.
pub mod processor;

/// Ingest one raw webhook request.
///
/// Signature verification failures return an error and never record an
/// event (attacker noise stays out of the log). Everything after a valid
/// signature acks with `{received: true}`, duplicates included.
#[instrument(skip_all, fields(provider = %provider))]
pub async fn ingest(
    ctx: &Ctx,
    queue: Option<&processor::QueueHandle>,
    provider: Provider,
    signature_header: Option<&str>,
    body: &[u8],
) -> Result<WebhookAck, CoreApiError> {
    let header = signature_header.ok_or_else(|| {
        CoreApiError::signature_invalid("Missing signature header")
    })?;
    match provider {
        Provider::Stripe => tokens::verify_stripe_signature(
            &ctx.stripe_webhook_secret,
            header,
            body,
            TimestampMs::now(),
        )
        .map_err(|e| CoreApiError::signature_invalid(e.to_string()))?,
        Provider::Paystack => tokens::verify_paystack_signature(
            &ctx.paystack_webhook_secret,
            header,
            body,
        )
        .map_err(|e| CoreApiError::signature_invalid(e.to_string()))?,
    }

    let payload: Json = serde_json::from_slice(body).map_err(|_| {
        CoreApiError::invalid_request("Webhook body is not valid JSON")
    })?;
    let decoded = match provider {
        Provider::Stripe => event::decode_stripe(&payload)?,
        Provider::Paystack => event::decode_paystack(&payload)?,
    };

    let upsert = ctx
        .store
        .upsert_webhook_event(
            provider,
            &decoded.event_key,
            &decoded.event_type,
            &payload,
        )
        .await?;

    // Already fully applied; nothing left to do but acknowledge.
    if upsert.event.status == WebhookEventStatus::Processed {
        info!(event_key = %decoded.event_key, "Duplicate of processed event");
        return Ok(WebhookAck { received: true });
    }

    // Charge-success short-circuit: the payment row may already exist (for
    // example via reconciliation heal) even though this event was never
    // processed. Transfer and refund events always go to the applier.
    if decoded.event.short_circuitable() {
        if let Some(charge_ref) = decoded.event.charge_ref() {
            if let Some(existing) = ctx
                .store
                .find_payment_by_charge_ref(provider, charge_ref)
                .await?
            {
                if existing.payment_type.is_charge() {
                    ctx.store
                        .set_webhook_status(
                            &decoded.event_key,
                            WebhookEventStatus::Skipped,
                            Some(existing.id),
                            None,
                        )
                        .await?;
                    info!(
                        event_key = %decoded.event_key,
                        payment_id = %existing.id,
                        "Short-circuited; payment already recorded"
                    );
                    return Ok(WebhookAck { received: true });
                }
            }
        }
    }

    // Queue when we can; run inline otherwise (and always under `test`).
    match queue {
        Some(queue) if !ctx.env.webhooks_inline() => {
            if queue.enqueue(decoded.clone()).await {
                return Ok(WebhookAck { received: true });
            }
            warn!("Webhook queue is saturated; processing inline");
            processor::process_once(ctx, &decoded).await;
        }
        _ => {
            processor::process_once(ctx, &decoded).await;
        }
    }

    Ok(WebhookAck { received: true })
}

/// Re-run a dead-lettered or failed event by its durable key (admin op).
pub async fn retry_event(
    ctx: &Ctx,
    event_key: &str,
) -> Result<WebhookAck, CoreApiError> {
    let stored = ctx
        .store
        .get_webhook_event(event_key)
        .await?
        .ok_or_else(|| {
            CoreApiError::not_found(format!("No event {event_key}"))
        })?;
    let decoded: DecodedEvent = match stored.provider {
        Provider::Stripe => event::decode_stripe(&stored.payload)?,
        Provider::Paystack => event::decode_paystack(&stored.payload)?,
    };
    processor::process_once(ctx, &decoded).await;
    Ok(WebhookAck { received: true })
}
