//! Server startup and shutdown wiring.
//!
//! Order: config, stores, provider adapters, webhook worker pool,
//! scheduler, HTTP. Shutdown runs the same order in reverse: stop taking
//! requests, then drain the webhook pool and job tasks before exit.

use std::sync::Arc;

use anyhow::Context as _;
use common::{pii::PiiCipher, shutdown::ShutdownChannel, task};
use patron_core::{
    context::Ctx,
    fx::FxClient,
    locks::RedisCache,
    provider::{paystack::PaystackClient, stripe::StripeClient},
    scheduler,
    store::PgStore,
    webhook::processor,
};
use tracing::info;

use crate::{
    cli::Args,
    config::Config,
    routes::{self, AppState},
};

/// A production notifier is wired in by the notifications service; the
/// core only needs the seam. Until that service registers itself, sends
/// are logged.
struct LogNotifier;

#[async_trait::async_trait]
impl patron_core::traits::Notifier for LogNotifier {
    async fn send(
        &self,
        notification: patron_core::traits::Notification,
    ) -> anyhow::Result<()> {
        info!(?notification, "notify");
        Ok(())
    }
}

struct LogAlerts;

#[async_trait::async_trait]
impl patron_core::traits::AlertSink for LogAlerts {
    async fn raise(
        &self,
        alert: patron_core::traits::OpsAlert,
    ) -> anyhow::Result<()> {
        tracing::error!(?alert, "ops alert");
        Ok(())
    }
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    info!(env = %config.deploy_env, port = args.port, "Starting server");

    let store = PgStore::connect(&config.database_url).await?;
    if args.migrate {
        store.run_migrations().await?;
    }
    let cache = RedisCache::connect(&config.redis_url).await?;

    let ctx = Ctx {
        env: config.deploy_env,
        store: Arc::new(store),
        cache: Arc::new(cache),
        stripe: Arc::new(StripeClient::new(config.stripe_secret_key)),
        paystack: Arc::new(PaystackClient::new(
            config.paystack_secret_key,
        )),
        fx: Arc::new(FxClient::new(config.fx_api_url)),
        notifier: Arc::new(LogNotifier),
        alerts: Arc::new(LogAlerts),
        session_secret: config.session_secret,
        stripe_webhook_secret: config.stripe_webhook_secret,
        paystack_webhook_secret: config.paystack_webhook_secret,
        pii: PiiCipher::new(&config.pii_key),
        app_url: config.app_url,
        public_page_url: config.public_page_url,
    };

    let shutdown = ShutdownChannel::new();

    // Webhook worker pool; under `test` everything runs inline instead.
    let (queue, mut worker_tasks) = if config.deploy_env.is_test() {
        (None, Vec::new())
    } else {
        let (queue, tasks) = processor::spawn_pool(
            ctx.clone(),
            args.webhook_workers,
            shutdown.clone(),
        );
        (Some(queue), tasks)
    };

    // Scheduled jobs.
    let mut job_tasks = if config.deploy_env.is_test() {
        Vec::new()
    } else {
        scheduler::spawn_all(ctx.clone(), shutdown.clone())
    };

    // HTTP.
    let state = AppState {
        ctx,
        queue: queue.clone(),
    };
    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .context("Could not bind listener")?;
    info!("Listening on {}", listener.local_addr()?);

    // SIGINT fans out through the shutdown channel; the server refuses new
    // connections and finishes in-flight requests before returning.
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT; shutting down");
            signal_shutdown.send();
        }
    });

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.recv().await })
        .await
        .context("Server error")?;
    shutdown.send();

    // Drop our queue handle so the workers can drain the channel and exit.
    drop(queue);
    let mut tasks = Vec::new();
    tasks.append(&mut worker_tasks);
    tasks.append(&mut job_tasks);
    task::join_all_and_log(tasks).await;
    info!("Shutdown complete");
    Ok(())
}
