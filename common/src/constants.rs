use std::time::Duration;

/// Timeout applied to every outbound provider HTTP call.
pub const PROVIDER_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// TTL of the checkout double-click dedupe key.
pub const CHECKOUT_DEDUPE_TTL: Duration = Duration::from_secs(120);

/// Default TTL for distributed locks.
pub const LOCK_TTL: Duration = Duration::from_secs(30);

/// TTL for the short `charge:{event_id}` lock serializing competing
/// webhook retries.
pub const CHARGE_LOCK_TTL: Duration = Duration::from_secs(10);

/// Lifetime of manage/cancel tokens embedded in subscriber emails.
pub const MANAGE_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Maximum number of webhook processing attempts before dead-lettering.
pub const WEBHOOK_MAX_ATTEMPTS: u32 = 5;

/// Initial wait of the webhook retry backoff (1s, 2s, 4s, 8s, 16s).
pub const WEBHOOK_RETRY_INITIAL_WAIT_MS: u64 = 1_000;

/// How long a pending subscription may linger before the cleanup sweeper
/// cancels it.
pub const PENDING_SUBSCRIPTION_MAX_AGE: Duration =
    Duration::from_secs(7 * 24 * 60 * 60);

/// Age past which an `otp_pending` payout is considered stuck.
pub const STUCK_TRANSFER_AGE: Duration = Duration::from_secs(60 * 60);

/// TTL on scheduled-job health records in Redis.
pub const JOB_HEALTH_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Acceptable deviation between a requested checkout amount and a configured
/// price, in minor units. Absorbs rounding noise from client-side display
/// conversion.
pub const PRICE_MATCH_TOLERANCE: i64 = 1;
