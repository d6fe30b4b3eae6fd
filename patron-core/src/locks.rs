//! Distributed locks and idempotency helpers.
//!
//! The lock primitive is Redis `SET key token NX PX ttl`; release is a
//! compare-and-delete on the fencing token so a holder can never release a
//! lock that expired and was re-acquired by someone else. Acquisition never
//! block-waits: we either get the lock or bail and let the caller's retry
//! machinery come back.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::constants::{CHARGE_LOCK_TTL, LOCK_TTL};
use redis::aio::ConnectionManager;
use tracing::warn;
use uuid::Uuid;

use crate::traits::Cache;

/// Fencing-token compare-and-delete, atomic on the Redis side.
const RELEASE_SCRIPT: &str = "if redis.call('get', KEYS[1]) == ARGV[1] \
     then return redis.call('del', KEYS[1]) else return 0 end";

/// Production [`Cache`] over Redis.
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .context("Invalid REDIS_URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("Could not connect to Redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn del_if_match(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Lock key for event application against one subscription's provider ref.
pub fn subscription_key(provider_ref: &str) -> String {
    format!("subscription:{provider_ref}")
}

/// Lock key serializing competing retries of one webhook event.
pub fn charge_key(event_id: &str) -> String {
    format!("charge:{event_id}")
}

/// Lock key for a first-charge checkout session.
pub fn checkout_key(session_id: &str) -> String {
    format!("checkout:{session_id}")
}

/// Lock key around a notification send.
pub fn notification_key(subscription_id: Uuid, kind: &str) -> String {
    format!("notification:{subscription_id}:{kind}")
}

/// Lease key for a scheduled job.
pub fn job_key(name: &str) -> String {
    format!("job:{name}")
}

/// A held distributed lock. Release via [`LockGuard::release`]; a dropped
/// guard without release simply lets the TTL expire, which is safe but
/// holds the subject longer than needed.
#[must_use]
pub struct LockGuard {
    cache: Arc<dyn Cache>,
    key: String,
    token: String,
}

impl LockGuard {
    /// The fencing token identifying this acquisition.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock if we still hold it.
    pub async fn release(self) {
        match self.cache.del_if_match(&self.key, &self.token).await {
            Ok(true) => (),
            Ok(false) => {
                // TTL expired and someone else may hold the key now.
                warn!(key = %self.key, "Lock was lost before release");
            }
            Err(e) => {
                warn!(key = %self.key, "Failed to release lock: {e:#}");
            }
        }
    }
}

/// Try to acquire `key` for `ttl`. Returns `None` when the subject is
/// already locked.
pub async fn try_acquire(
    cache: &Arc<dyn Cache>,
    key: &str,
    ttl: Duration,
) -> Result<Option<LockGuard>> {
    let token = Uuid::new_v4().to_string();
    let acquired = cache.set_nx_px(key, &token, ttl).await?;
    Ok(acquired.then(|| LockGuard {
        cache: Arc::clone(cache),
        key: key.to_owned(),
        token,
    }))
}

/// Acquire the default-TTL subject lock for a subscription ref.
pub async fn lock_subscription(
    cache: &Arc<dyn Cache>,
    provider_ref: &str,
) -> Result<Option<LockGuard>> {
    try_acquire(cache, &subscription_key(provider_ref), LOCK_TTL).await
}

/// Acquire the short lock serializing competing webhook retries.
pub async fn lock_charge(
    cache: &Arc<dyn Cache>,
    event_id: &str,
) -> Result<Option<LockGuard>> {
    try_acquire(cache, &charge_key(event_id), CHARGE_LOCK_TTL).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::MemCache;

    fn cache() -> Arc<dyn Cache> {
        Arc::new(MemCache::new())
    }

    #[tokio::test]
    async fn exclusive_until_released() {
        let cache = cache();
        let key = subscription_key("sub_123");

        let guard = try_acquire(&cache, &key, LOCK_TTL).await.unwrap();
        let guard = guard.expect("First acquire should succeed");

        let second = try_acquire(&cache, &key, LOCK_TTL).await.unwrap();
        assert!(second.is_none(), "Lock should be exclusive");

        guard.release().await;
        let third = try_acquire(&cache, &key, LOCK_TTL).await.unwrap();
        assert!(third.is_some(), "Released lock should be reacquirable");
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let cache = cache();
        let key = charge_key("evt_1");

        let guard = try_acquire(&cache, &key, LOCK_TTL)
            .await
            .unwrap()
            .unwrap();

        // Simulate the TTL expiring and another worker taking the lock.
        cache.del(&key).await.unwrap();
        let other = try_acquire(&cache, &key, LOCK_TTL)
            .await
            .unwrap()
            .expect("Re-acquire after expiry");

        // The stale guard must not free the new holder's lock.
        guard.release().await;
        let contended = try_acquire(&cache, &key, LOCK_TTL).await.unwrap();
        assert!(contended.is_none(), "New holder's lock must survive");

        other.release().await;
    }
}
