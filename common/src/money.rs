//! Currency codes and minor-unit money conversions.
//!
//! All amounts that cross a service boundary are integer minor units
//! (`i64` "cents"). [`Decimal`] is used for intermediate arithmetic only,
//! with a single deterministic rounding step (half away from zero) at the
//! end, so that fee and FX math never touches floating point.

use std::{borrow::Borrow, fmt, str::FromStr};

use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Currencies whose smallest unit equals their main unit (no subdivision).
/// Closed enumeration; amounts in these currencies skip the ×100 conversion
/// when translating between display and minor units.
pub const ZERO_DECIMAL_CURRENCIES: [&str; 16] = [
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF",
    "UGX", "VND", "VUV", "XAF", "XOF", "XPF",
];

/// Countries where the regional processor must route funds through an extra
/// FX/correspondent step; the fee engine adds a buffer for them.
pub const CROSS_BORDER_COUNTRIES: [&str; 4] = ["NG", "KE", "ZA", "GH"];

/// Errors that can occur when parsing or converting money values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Currency code must be three ASCII letters")]
    BadCurrencyCode,
    #[error("Exchange rate must be positive")]
    NonPositiveRate,
    #[error("Amount out of range")]
    OutOfRange,
}

/// Fiat currency ISO 4217 code, normalized to uppercase.
///
/// ### Examples
///
/// `"USD", "NGN", "KES", "JPY", ...`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub const USD: &'static str = "USD";

    pub fn usd() -> Self {
        Self(Self::USD.to_owned())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    #[inline]
    pub fn is_usd(&self) -> bool {
        self.0 == Self::USD
    }

    /// Whether this currency has no minor subdivision.
    pub fn is_zero_decimal(&self) -> bool {
        ZERO_DECIMAL_CURRENCIES.contains(&self.0.as_str())
    }

    /// Number of minor units per major unit: 1 for zero-decimal currencies,
    /// 100 otherwise.
    pub fn minor_per_major(&self) -> i64 {
        if self.is_zero_decimal() {
            1
        } else {
            100
        }
    }

    /// Convert a display (major-unit) amount into minor units, rounding half
    /// away from zero.
    pub fn display_to_minor(&self, display: Decimal) -> Result<i64, Error> {
        let minor = display * Decimal::from(self.minor_per_major());
        round_to_i64(minor)
    }

    /// Convert minor units into a display (major-unit) [`Decimal`].
    pub fn minor_to_display(&self, minor: i64) -> Decimal {
        Decimal::from(minor) / Decimal::from(self.minor_per_major())
    }
}

impl FromStr for CurrencyCode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 3 && s.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(s.to_ascii_uppercase()))
        } else {
            Err(Error::BadCurrencyCode)
        }
    }
}

impl Borrow<str> for CurrencyCode {
    fn borrow(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An exchange rate expressed as local major units per one US dollar.
/// Guaranteed positive by construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsdRate(Decimal);

impl UsdRate {
    /// The identity rate used when the payment currency is already USD.
    pub const ONE: Self = Self(Decimal::ONE);

    pub fn new(rate: Decimal) -> Result<Self, Error> {
        if rate > Decimal::ZERO {
            Ok(Self(rate))
        } else {
            Err(Error::NonPositiveRate)
        }
    }

    #[inline]
    pub fn as_decimal(self) -> Decimal {
        self.0
    }
}

/// Round a [`Decimal`] to an integer number of minor units, half away from
/// zero, erroring if the value doesn't fit in an [`i64`].
pub fn round_to_i64(value: Decimal) -> Result<i64, Error> {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or(Error::OutOfRange)
}

/// Convert USD cents into minor units of a local currency at the given rate.
pub fn usd_cents_to_local_minor(
    usd_cents: i64,
    rate: UsdRate,
    currency: &CurrencyCode,
) -> Result<i64, Error> {
    let usd_major = Decimal::from(usd_cents) / dec!(100);
    let local_major = usd_major * rate.0;
    round_to_i64(local_major * Decimal::from(currency.minor_per_major()))
}

/// Convert minor units of a local currency into USD cents at the given rate.
pub fn local_minor_to_usd_cents(
    local_minor: i64,
    rate: UsdRate,
    currency: &CurrencyCode,
) -> Result<i64, Error> {
    let local_major =
        Decimal::from(local_minor) / Decimal::from(currency.minor_per_major());
    let usd_major = local_major / rate.0;
    round_to_i64(usd_major * dec!(100))
}

#[cfg(test)]
mod test {
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::*;

    fn usd() -> CurrencyCode {
        CurrencyCode::usd()
    }

    #[test]
    fn code_normalization_and_validation() {
        assert_eq!(CurrencyCode::from_str("ngn").unwrap().as_str(), "NGN");
        assert!(CurrencyCode::from_str("US").is_err());
        assert!(CurrencyCode::from_str("USD1").is_err());
        assert!(CurrencyCode::from_str("U$D").is_err());
    }

    #[test]
    fn zero_decimal_translation() {
        let jpy = CurrencyCode::from_str("JPY").unwrap();
        let kes = CurrencyCode::from_str("KES").unwrap();
        assert_eq!(jpy.display_to_minor(dec!(1500)).unwrap(), 1500);
        assert_eq!(kes.display_to_minor(dec!(1500)).unwrap(), 150_000);
        assert_eq!(jpy.minor_to_display(1500), dec!(1500));
        assert_eq!(kes.minor_to_display(150_000), dec!(1500));
    }

    #[test]
    fn usd_shortcircuit_rate_is_identity() {
        let cents = 10_450;
        let back =
            usd_cents_to_local_minor(cents, UsdRate::ONE, &usd()).unwrap();
        assert_eq!(back, cents);
    }

    /// Round-trip through a local currency and back loses at most one cent
    /// for any realistic (>= 1 local per USD) rate.
    #[test]
    fn fx_roundtrip_within_one_cent() {
        proptest!(|(
            usd_cents in 1i64..=1_000_000_000,
            // Rates with up to 4 decimal places, at least 1 local per USD.
            rate_ten_thousandths in 10_000i64..=50_000_000,
        )| {
            let rate = UsdRate::new(
                Decimal::new(rate_ten_thousandths, 4)
            ).unwrap();
            let ngn = CurrencyCode::from_str("NGN").unwrap();
            let local = usd_cents_to_local_minor(usd_cents, rate, &ngn).unwrap();
            let back = local_minor_to_usd_cents(local, rate, &ngn).unwrap();
            prop_assert!((back - usd_cents).abs() <= 1);
        })
    }

    #[test]
    fn display_minor_roundtrip() {
        proptest!(|(minor in 0i64..=10_000_000_000)| {
            let kes = CurrencyCode::from_str("KES").unwrap();
            let display = kes.minor_to_display(minor);
            prop_assert_eq!(kes.display_to_minor(display).unwrap(), minor);
        })
    }
}
