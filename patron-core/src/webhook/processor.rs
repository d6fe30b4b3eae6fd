//! Async webhook processing: a small in-process worker pool with
//! exponential retry (1s, 2s, 4s, 8s, 16s; 5 attempts) and dead-lettering.

use std::time::Duration;

use common::{
    backoff,
    constants::{WEBHOOK_MAX_ATTEMPTS, WEBHOOK_RETRY_INITIAL_WAIT_MS},
    shutdown::ShutdownChannel,
    task::PtTask,
};
use common::api::error::{CoreApiError, CoreErrorKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    apply,
    context::Ctx,
    locks,
    models::WebhookEventStatus,
    traits::OpsAlert,
    webhook::event::DecodedEvent,
};

const QUEUE_DEPTH: usize = 1024;

/// Sender half of the processing queue, handed to the ingest path.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<DecodedEvent>,
}

impl QueueHandle {
    /// Returns false when the queue is saturated; the caller falls back to
    /// inline processing.
    pub async fn enqueue(&self, decoded: DecodedEvent) -> bool {
        self.tx.try_send(decoded).is_ok()
    }
}

/// Spawn `workers` processing tasks. The returned tasks drain naturally:
/// once the queue sender side is dropped and the channel empties, or when
/// shutdown fires with the channel idle, each worker exits.
pub fn spawn_pool(
    ctx: Ctx,
    workers: usize,
    shutdown: ShutdownChannel,
) -> (QueueHandle, Vec<PtTask<()>>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));

    let tasks = (0..workers.max(1))
        .map(|i| {
            let ctx = ctx.clone();
            let rx = std::sync::Arc::clone(&rx);
            let shutdown = shutdown.clone();
            PtTask::spawn_named("webhook worker", async move {
                info!("Webhook worker {i} started");
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            biased;
                            maybe = rx.recv() => maybe,
                            () = shutdown.recv() => None,
                        }
                    };
                    match next {
                        Some(decoded) => {
                            process_with_retries(&ctx, &decoded).await
                        }
                        None => break,
                    }
                }
                info!("Webhook worker {i} drained");
            })
        })
        .collect();

    (QueueHandle { tx }, tasks)
}

/// One processing attempt: take the `charge:{event_id}` lock, run the
/// applier, record the outcome on the stored event. Used by the inline
/// ingest fallback and by admin retries.
pub async fn process_once(ctx: &Ctx, decoded: &DecodedEvent) {
    match attempt(ctx, decoded).await {
        Ok(()) => (),
        Err(err) => {
            warn!(
                event_key = %decoded.event_key,
                "Webhook processing failed: {err}"
            );
            let _ = ctx
                .store
                .set_webhook_status(
                    &decoded.event_key,
                    WebhookEventStatus::Failed,
                    None,
                    Some(err.to_string()),
                )
                .await;
        }
    }
}

/// Worker-pool path: retry transient failures on the exponential schedule,
/// then dead-letter and alert.
async fn process_with_retries(ctx: &Ctx, decoded: &DecodedEvent) {
    let mut waits =
        backoff::iter_with_initial_wait_ms(WEBHOOK_RETRY_INITIAL_WAIT_MS);

    for attempt_index in 1..=WEBHOOK_MAX_ATTEMPTS {
        match attempt(ctx, decoded).await {
            Ok(()) => return,
            Err(err) if !err.is_retryable() => {
                // Permanent: mark failed with reason and stop retrying.
                warn!(
                    event_key = %decoded.event_key,
                    "Permanent failure: {err}"
                );
                let _ = ctx
                    .store
                    .set_webhook_status(
                        &decoded.event_key,
                        WebhookEventStatus::Failed,
                        None,
                        Some(err.to_string()),
                    )
                    .await;
                return;
            }
            Err(err) => {
                warn!(
                    event_key = %decoded.event_key,
                    attempt_index,
                    "Transient failure: {err}"
                );
                let _ = ctx
                    .store
                    .set_webhook_status(
                        &decoded.event_key,
                        WebhookEventStatus::Failed,
                        None,
                        Some(err.to_string()),
                    )
                    .await;
                if attempt_index < WEBHOOK_MAX_ATTEMPTS {
                    tokio::time::sleep(
                        waits.next().unwrap_or(Duration::from_secs(16)),
                    )
                    .await;
                }
            }
        }
    }

    error!(event_key = %decoded.event_key, "Dead-lettering webhook event");
    let _ = ctx
        .store
        .set_webhook_status(
            &decoded.event_key,
            WebhookEventStatus::DeadLetter,
            None,
            None,
        )
        .await;
    let _ = ctx
        .alerts
        .raise(OpsAlert::WebhookDeadLettered {
            event_id: decoded.event_key.clone(),
        })
        .await;
}

async fn attempt(
    ctx: &Ctx,
    decoded: &DecodedEvent,
) -> Result<(), CoreApiError> {
    let guard = locks::lock_charge(&ctx.cache, &decoded.event_key)
        .await
        .map_err(CoreApiError::from)?
        .ok_or_else(|| {
            CoreApiError::provider_unavailable(format!(
                "Event {} is being processed elsewhere",
                decoded.event_key
            ))
        })?;

    let result = apply::apply_event(ctx, decoded).await;
    guard.release().await;

    match result {
        Ok(applied) => {
            let status = match applied {
                apply::Applied::Skipped => WebhookEventStatus::Skipped,
                _ => WebhookEventStatus::Processed,
            };
            ctx.store
                .set_webhook_status(
                    &decoded.event_key,
                    status,
                    applied.payment_id(),
                    None,
                )
                .await?;
            Ok(())
        }
        // The applier treats conflicts as already-done.
        Err(err) if err.kind == CoreErrorKind::Conflict => {
            ctx.store
                .set_webhook_status(
                    &decoded.event_key,
                    WebhookEventStatus::Processed,
                    None,
                    None,
                )
                .await?;
            Ok(())
        }
        Err(err) => Err(err),
    }
}
