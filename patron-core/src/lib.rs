//! The `patron-core` crate contains the payments orchestration core: the
//! subsystem that turns asynchronous provider events into exactly-once
//! financial facts.
//!
//! Everything here is driven through the seams in [`traits`]: a [`Store`]
//! over the relational database, a [`Cache`] over Redis, one adapter per
//! payment provider, an FX rate source, and outbound notification/alert
//! sinks. The HTTP surface lives in the `server` crate and is a thin layer
//! over the operations exposed here.
//!
//! [`Store`]: crate::traits::Store
//! [`Cache`]: crate::traits::Cache

/// Applies decoded provider events onto payments and subscriptions.
pub mod apply;
/// Checkout session initiation.
pub mod checkout;
/// Shared handles bundled for the appliers, jobs, and routes.
pub mod context;
/// The fee engine.
pub mod fees;
/// FX rate client.
pub mod fx;
/// Distributed locks and idempotency helpers.
pub mod locks;
/// Entities and status enums.
pub mod models;
/// Payout initiation and finalization.
pub mod payout;
/// Provider REST adapters.
pub mod provider;
/// Provider vs. ledger diffing and repair.
pub mod reconcile;
/// Provider selection per checkout.
pub mod router;
/// The scheduled job runner and jobs.
pub mod scheduler;
/// Store implementations.
pub mod store;
/// Subscription lifecycle state machine.
pub mod subscription;
/// Trait seams: store, cache, provider adapters, notifier, alerts.
pub mod traits;
/// Webhook ingestion, typed events, async processing.
pub mod webhook;

/// In-memory fakes shared between unit, integration, and server tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
