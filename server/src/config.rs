//! Environment configuration.
//!
//! Everything the server needs is enumerated here and read once at
//! startup; a missing required variable fails fast with its name.

use anyhow::{Context, Result};
use common::{env::DeployEnv, Secret};

pub struct Config {
    pub deploy_env: DeployEnv,
    pub database_url: String,
    pub redis_url: String,
    /// HMAC key for manage/cancel/admin tokens.
    pub session_secret: Secret<String>,
    pub stripe_secret_key: Secret<String>,
    pub paystack_secret_key: Secret<String>,
    pub stripe_webhook_secret: Secret<String>,
    pub paystack_webhook_secret: Secret<String>,
    /// Key PII (authorization codes, bank accounts) is encrypted under.
    pub pii_key: Secret<String>,
    pub app_url: String,
    pub public_page_url: String,
    pub fx_api_url: String,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} was not set"))
}

fn required_secret(name: &str) -> Result<Secret<String>> {
    required(name).map(Secret::new)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // A .env file is a convenience for dev; absence is fine.
        let _ = dotenvy::dotenv();

        Ok(Self {
            deploy_env: DeployEnv::from_env()?,
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            session_secret: required_secret("SESSION_SECRET")?,
            stripe_secret_key: required_secret("STRIPE_SECRET_KEY")?,
            paystack_secret_key: required_secret("PAYSTACK_SECRET_KEY")?,
            stripe_webhook_secret: required_secret(
                "STRIPE_WEBHOOK_SECRET",
            )?,
            paystack_webhook_secret: required_secret(
                "PAYSTACK_WEBHOOK_SECRET",
            )?,
            pii_key: required_secret("PII_KEY")?,
            app_url: required("APP_URL")?,
            public_page_url: required("PUBLIC_PAGE_URL")?,
            fx_api_url: required("FX_API_URL")?,
        })
    }
}
