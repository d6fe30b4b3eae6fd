//! Shared handles bundled for the appliers, jobs, and routes.

use std::sync::Arc;

use common::{env::DeployEnv, pii::PiiCipher, Secret};

use crate::traits::{
    AlertSink, Cache, FxApi, Notifier, PaystackApi, Store, StripeApi,
};

/// The cloneable bundle of seams threaded through the core. Constructed
/// once at startup (or per-test from fakes); no other global state exists.
#[derive(Clone)]
pub struct Ctx {
    pub env: DeployEnv,
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub stripe: Arc<dyn StripeApi>,
    pub paystack: Arc<dyn PaystackApi>,
    pub fx: Arc<dyn FxApi>,
    pub notifier: Arc<dyn Notifier>,
    pub alerts: Arc<dyn AlertSink>,
    /// HMAC key for manage/cancel tokens.
    pub session_secret: Secret<String>,
    pub stripe_webhook_secret: Secret<String>,
    pub paystack_webhook_secret: Secret<String>,
    pub pii: PiiCipher,
    /// Base URL for checkout redirect targets.
    pub app_url: String,
    /// Base URL for public creator pages.
    pub public_page_url: String,
}
