use proptest::{
    arbitrary::any,
    strategy::{BoxedStrategy, Strategy},
};

use crate::money::CurrencyCode;

/// An arbitrary alphanumeric string of reasonable length.
pub fn any_string() -> BoxedStrategy<String> {
    "[a-zA-Z0-9_\\-]{0,32}".boxed()
}

/// An arbitrary simple email address.
pub fn any_email() -> BoxedStrategy<String> {
    ("[a-z0-9]{1,12}", "[a-z]{2,10}")
        .prop_map(|(local, domain)| format!("{local}@{domain}.com"))
        .boxed()
}

/// An arbitrary supported currency code, weighted towards the corridors the
/// platform actually sees.
pub fn any_currency() -> BoxedStrategy<CurrencyCode> {
    proptest::sample::select(vec![
        "USD", "NGN", "KES", "ZAR", "GHS", "EUR", "GBP", "JPY", "KRW",
    ])
    .prop_map(|code| code.parse::<CurrencyCode>().unwrap())
    .boxed()
}

/// Positive amounts in minor units within the range the fee engine
/// guarantees its invariants over.
pub fn any_amount_cents() -> BoxedStrategy<i64> {
    (100i64..=10_000_000).boxed()
}

/// Any amount in minor units, including refund-signed values.
pub fn any_signed_cents() -> BoxedStrategy<i64> {
    any::<bool>()
        .prop_flat_map(|negative| {
            any_amount_cents().prop_map(move |cents| {
                if negative {
                    -cents
                } else {
                    cents
                }
            })
        })
        .boxed()
}
