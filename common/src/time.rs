use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// - Internally represented by a non-negative [`i64`] so that values survive
///   a roundtrip through the database's signed `BIGINT` columns.
/// - Can represent any time from January 1st, 1970 00:00:00.000 UTC to
///   roughly 292 million years in the future.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct TimestampMs(i64);

impl TimestampMs {
    pub const MIN: Self = TimestampMs(0);

    /// Creates a new [`TimestampMs`] from the current [`SystemTime`].
    ///
    /// Panics if the current time is not within bounds.
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).unwrap()
    }

    /// Constructs a [`TimestampMs`] from a non-negative [`i64`] milliseconds
    /// value, erroring if the value is negative.
    pub fn try_from_ms(ms: i64) -> anyhow::Result<Self> {
        if ms >= 0 {
            Ok(Self(ms))
        } else {
            Err(anyhow::anyhow!("Timestamp must be non-negative"))
        }
    }

    /// Returns the contained [`i64`].
    #[inline]
    pub fn as_ms(self) -> i64 {
        self.0
    }

    /// Returns this timestamp plus the given [`Duration`], saturating at the
    /// maximum representable value.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let add_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(add_ms))
    }

    /// Returns this timestamp minus the given [`Duration`], saturating at
    /// the epoch.
    pub fn saturating_sub(self, duration: Duration) -> Self {
        let sub_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(sub_ms).max(0))
    }

    /// The absolute difference between two timestamps.
    pub fn abs_diff(self, other: Self) -> Duration {
        Duration::from_millis(self.0.abs_diff(other.0))
    }

    /// Whether `self` is at least `age` older than `now`.
    pub fn is_older_than(self, now: Self, age: Duration) -> bool {
        self <= now.saturating_sub(age)
    }

    /// Convert to a [`chrono::DateTime<Utc>`] for calendar arithmetic.
    /// Infallible since the contained value is non-negative.
    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.0)
            .expect("Non-negative i64 millis is always in chrono bounds")
    }

    /// Convert from a [`chrono::DateTime<Utc>`], clamping pre-epoch values.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis().max(0))
    }
}

impl fmt::Display for TimestampMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Get a [`SystemTime`] corresponding to this timestamp.
impl From<TimestampMs> for SystemTime {
    fn from(timestamp: TimestampMs) -> Self {
        let timestamp_u64 = u64::try_from(timestamp.0)
            .expect("Non-negative invariant was violated");
        UNIX_EPOCH + Duration::from_millis(timestamp_u64)
    }
}

/// Attempts to convert a [`SystemTime`] into a [`TimestampMs`].
///
/// Returns an error if the [`SystemTime`] is not within bounds.
impl TryFrom<SystemTime> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        system_time
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .map(i64::try_from)
            .map(|res| res.map(Self))
            .context("Current time is before January 1st, 1970")?
            .context("Current time is more than 292 million years past epoch")
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        if value >= 0 {
            Ok(TimestampMs(value))
        } else {
            Err(de::Error::invalid_value(
                de::Unexpected::Signed(value),
                &"Unix timestamp must be non-negative",
            ))
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::Arbitrary,
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for TimestampMs {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            (0..i64::MAX).prop_map(Self).boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::roundtrip;

    #[test]
    fn timestamp_roundtrip() {
        roundtrip::json_string_roundtrip_proptest::<TimestampMs>();
    }

    #[test]
    fn deserialize_enforces_nonnegative() {
        assert_eq!(serde_json::from_str::<TimestampMs>("42").unwrap().0, 42);
        assert_eq!(serde_json::from_str::<TimestampMs>("0").unwrap().0, 0);
        assert!(serde_json::from_str::<TimestampMs>("-42").is_err());
    }

    #[test]
    fn saturating_arithmetic() {
        let ts = TimestampMs(1_000);
        assert_eq!(ts.saturating_sub(Duration::from_secs(2)), TimestampMs(0));
        assert_eq!(
            ts.saturating_add(Duration::from_secs(1)),
            TimestampMs(2_000)
        );
        assert!(TimestampMs(0)
            .is_older_than(TimestampMs(100_000), Duration::from_secs(60)));
        assert!(!TimestampMs(99_999)
            .is_older_than(TimestampMs(100_000), Duration::from_secs(60)));
    }
}
