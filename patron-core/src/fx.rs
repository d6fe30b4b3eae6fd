//! FX rate client.
//!
//! Rates are fetched from an external service and stored per transaction;
//! the platform never computes its own. A small in-memory cache keeps the
//! applier from hammering the rate API on bursts of same-currency events.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use common::{
    constants::PROVIDER_HTTP_TIMEOUT,
    money::{CurrencyCode, UsdRate},
    time::TimestampMs,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::traits::{FxApi, ProviderError};

const RATE_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Deserialize)]
struct RatesResponse {
    rates: HashMap<String, Decimal>,
}

/// Production [`FxApi`] backed by an exchange-rate REST service.
pub struct FxClient {
    client: reqwest::Client,
    base_url: String,
    cache: Mutex<HashMap<String, (UsdRate, TimestampMs)>>,
}

impl FxClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_HTTP_TIMEOUT)
            .build()
            .expect("Failed to build reqwest Client");
        Self {
            client,
            base_url,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, currency: &CurrencyCode) -> Option<UsdRate> {
        let cache = self.cache.lock().unwrap();
        let (rate, fetched_at) = cache.get(currency.as_str())?;
        let now = TimestampMs::now();
        (now.abs_diff(*fetched_at) < RATE_CACHE_TTL).then_some(*rate)
    }
}

#[async_trait]
impl FxApi for FxClient {
    async fn usd_rate(
        &self,
        currency: &CurrencyCode,
    ) -> Result<UsdRate, ProviderError> {
        if currency.is_usd() {
            return Ok(UsdRate::ONE);
        }
        if let Some(rate) = self.cached(currency) {
            return Ok(rate);
        }

        let url = format!(
            "{}/latest?base=USD&symbols={}",
            self.base_url, currency
        );
        debug!(%url, "Fetching FX rate");
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ProviderError::Unavailable(format!(
                "Rate service returned {}",
                resp.status()
            )));
        }
        let rates: RatesResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        let raw = rates.rates.get(currency.as_str()).ok_or_else(|| {
            ProviderError::Permanent(format!(
                "Rate service has no rate for {currency}"
            ))
        })?;
        let rate = UsdRate::new(*raw).map_err(|_| {
            ProviderError::Permanent(format!(
                "Rate service returned non-positive rate for {currency}"
            ))
        })?;

        self.cache
            .lock()
            .unwrap()
            .insert(currency.as_str().to_owned(), (rate, TimestampMs::now()));
        Ok(rate)
    }
}
