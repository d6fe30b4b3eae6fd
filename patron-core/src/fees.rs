//! The fee engine.
//!
//! Pure, deterministic arithmetic: no I/O, no clocks. All intermediate math
//! is [`Decimal`]; rounding happens once per output value, half away from
//! zero, and the final values are integer minor units. Callers pass the
//! cross-border flag and the creator's purpose/mode; the engine never looks
//! anything up.

use common::money::{round_to_i64, CurrencyCode, UsdRate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{FeeMode, FeeModel};

/// Total platform take on a domestic charge.
pub const PLATFORM_FEE_RATE: Decimal = dec!(0.09);
/// Extra take on cross-border corridors.
pub const CROSS_BORDER_BUFFER: Decimal = dec!(0.015);
/// Per-side rate of the split model on a domestic charge.
pub const SPLIT_RATE: Decimal = dec!(0.045);

/// Hard floor on the computed minimum for cross-border countries, in USD
/// cents.
const CROSS_BORDER_MINIMUM_FLOOR_USD_CENTS: i64 = 10_00;

/// Complete output of a fee computation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FeeBreakdown {
    pub base_cents: i64,
    /// What the subscriber is charged.
    pub gross_cents: i64,
    pub fee_cents: i64,
    /// What the creator receives.
    pub net_cents: i64,
    pub creator_fee_cents: Option<i64>,
    pub subscriber_fee_cents: Option<i64>,
    pub fee_model: FeeModel,
    pub fee_mode: FeeMode,
}

/// Total platform rate for a corridor.
pub fn platform_rate(cross_border: bool) -> Decimal {
    if cross_border {
        PLATFORM_FEE_RATE + CROSS_BORDER_BUFFER
    } else {
        PLATFORM_FEE_RATE
    }
}

/// Per-side split rate for a corridor.
pub fn split_side_rate(cross_border: bool) -> Decimal {
    if cross_border {
        SPLIT_RATE + CROSS_BORDER_BUFFER / dec!(2)
    } else {
        SPLIT_RATE
    }
}

/// Compute the `split_v1` fee breakdown used for all new subscriptions:
/// both parties pay half the total fee; the subscriber sees the surcharge,
/// the creator sees a reduced net.
pub fn calculate_service_fee(
    base_cents: i64,
    cross_border: bool,
) -> FeeBreakdown {
    let base = Decimal::from(base_cents);
    let side_rate = split_side_rate(cross_border);

    let subscriber_fee = round_cents(base * side_rate);
    let creator_fee = round_cents(base * side_rate);
    let fee = subscriber_fee + creator_fee;

    FeeBreakdown {
        base_cents,
        gross_cents: base_cents + subscriber_fee,
        fee_cents: fee,
        net_cents: base_cents - creator_fee,
        creator_fee_cents: Some(creator_fee),
        subscriber_fee_cents: Some(subscriber_fee),
        fee_model: FeeModel::SplitV1,
        fee_mode: FeeMode::Split,
    }
}

/// Compute the legacy single-percentage breakdown. Selectable only on old
/// subscriptions.
pub fn calculate_legacy_fee(
    base_cents: i64,
    mode: FeeMode,
    cross_border: bool,
) -> FeeBreakdown {
    let base = Decimal::from(base_cents);
    let fee = round_cents(base * platform_rate(cross_border));

    let (gross, net) = match mode {
        // Creator eats the fee; subscriber pays face value.
        FeeMode::Absorb => (base_cents, base_cents - fee),
        // Fee is added on top; creator keeps face value.
        FeeMode::PassToSubscriber | FeeMode::Split => {
            (base_cents + fee, base_cents)
        }
    };

    FeeBreakdown {
        base_cents,
        gross_cents: gross,
        fee_cents: fee,
        net_cents: net,
        creator_fee_cents: None,
        subscriber_fee_cents: None,
        fee_model: FeeModel::Legacy,
        fee_mode: mode,
    }
}

/// Compute a breakdown in the model/mode a subscription was created with.
pub fn calculate_fee(
    base_cents: i64,
    fee_model: FeeModel,
    fee_mode: FeeMode,
    cross_border: bool,
) -> FeeBreakdown {
    match fee_model {
        FeeModel::SplitV1 => calculate_service_fee(base_cents, cross_border),
        FeeModel::Legacy => {
            calculate_legacy_fee(base_cents, fee_mode, cross_border)
        }
    }
}

/// Reconstruct a breakdown from a provider-reported gross amount.
///
/// Webhook events carry what the provider actually collected; the base is
/// derived by inverting the surcharge, and the provider-reported gross is
/// preserved exactly: `base + subscriber_fee == gross` holds by
/// construction in every mode.
pub fn breakdown_from_gross(
    gross_cents: i64,
    fee_model: FeeModel,
    fee_mode: FeeMode,
    cross_border: bool,
) -> FeeBreakdown {
    let gross = Decimal::from(gross_cents);
    match fee_model {
        FeeModel::SplitV1 => {
            let side_rate = split_side_rate(cross_border);
            let subscriber_fee =
                round_cents(gross * side_rate / (Decimal::ONE + side_rate));
            let base = gross_cents - subscriber_fee;
            let creator_fee =
                round_cents(Decimal::from(base) * side_rate);
            FeeBreakdown {
                base_cents: base,
                gross_cents,
                fee_cents: subscriber_fee + creator_fee,
                net_cents: base - creator_fee,
                creator_fee_cents: Some(creator_fee),
                subscriber_fee_cents: Some(subscriber_fee),
                fee_model: FeeModel::SplitV1,
                fee_mode: FeeMode::Split,
            }
        }
        FeeModel::Legacy => match fee_mode {
            FeeMode::Absorb => {
                calculate_legacy_fee(gross_cents, FeeMode::Absorb, cross_border)
            }
            FeeMode::PassToSubscriber | FeeMode::Split => {
                let rate = platform_rate(cross_border);
                let base = round_cents(gross / (Decimal::ONE + rate));
                FeeBreakdown {
                    base_cents: base,
                    gross_cents,
                    fee_cents: gross_cents - base,
                    net_cents: base,
                    creator_fee_cents: None,
                    subscriber_fee_cents: None,
                    fee_model: FeeModel::Legacy,
                    fee_mode: FeeMode::PassToSubscriber,
                }
            }
        },
    }
}

/// Refund amounts derived proportionally from an original payment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefundBreakdown {
    /// Negative.
    pub amount_cents: i64,
    /// Negative.
    pub fee_cents: i64,
    /// Negative.
    pub net_cents: i64,
    pub creator_fee_cents: Option<i64>,
    pub subscriber_fee_cents: Option<i64>,
}

/// Compute the (negative) refund row amounts for refunding
/// `refund_amount_cents` of an original payment with the given gross / fee
/// / split amounts.
///
/// Proportional refunds preserve the original fee math and work for absorb
/// and pass-to-subscriber alike: `fee = refund x (orig_fee / orig_gross)`,
/// with net taken as the remainder so `fee + net == refund` exactly.
pub fn refund_breakdown(
    original_gross_cents: i64,
    original_fee_cents: i64,
    original_creator_fee_cents: Option<i64>,
    refund_amount_cents: i64,
) -> RefundBreakdown {
    assert!(refund_amount_cents > 0, "refund amount must be positive");
    assert!(original_gross_cents > 0, "original gross must be positive");

    let refund = Decimal::from(refund_amount_cents);
    let gross = Decimal::from(original_gross_cents);
    let fee_ratio = Decimal::from(original_fee_cents) / gross;

    let fee = round_cents(refund * fee_ratio);
    let net = refund_amount_cents - fee;

    let (creator_fee, subscriber_fee) = match original_creator_fee_cents {
        Some(orig_creator_fee) => {
            let creator_ratio = Decimal::from(orig_creator_fee) / gross;
            let creator_fee = round_cents(refund * creator_ratio);
            (Some(-creator_fee), Some(-(fee - creator_fee)))
        }
        None => (None, None),
    };

    RefundBreakdown {
        amount_cents: -refund_amount_cents,
        fee_cents: -fee,
        net_cents: -net,
        creator_fee_cents: creator_fee,
        subscriber_fee_cents: subscriber_fee,
    }
}

// --- Creator minimum calculator --- //

/// The smallest monthly amount a creator may charge, per country.
#[derive(Clone, Debug, PartialEq)]
pub struct CreatorMinimum {
    pub minimum_usd_cents: i64,
    pub minimum_local_cents: i64,
    pub currency: CurrencyCode,
    pub net_margin_rate: Decimal,
    pub fixed_cents: i64,
}

/// Per-country processing costs the platform pays out of its fee.
struct CountryCosts {
    /// Percent of the charge.
    percent: Decimal,
    /// Fixed per-charge cost, USD cents.
    fixed_usd_cents: i64,
}

fn country_costs(country: &str) -> CountryCosts {
    // Card processing percent cost + fixed per-charge cost by corridor.
    match country {
        "US" => CountryCosts {
            percent: dec!(0.029),
            fixed_usd_cents: 30,
        },
        "GB" | "DE" | "FR" | "NL" | "ES" | "IT" => CountryCosts {
            percent: dec!(0.025),
            fixed_usd_cents: 30,
        },
        "NG" | "GH" => CountryCosts {
            percent: dec!(0.039),
            fixed_usd_cents: 20,
        },
        "KE" | "ZA" => CountryCosts {
            percent: dec!(0.035),
            fixed_usd_cents: 25,
        },
        _ => CountryCosts {
            percent: dec!(0.034),
            fixed_usd_cents: 35,
        },
    }
}

/// Compute the smallest monthly amount that keeps the platform margin
/// positive for this creator.
///
/// The margin rate is the platform rate minus the country's percent costs;
/// fixed per-charge costs are amortized over the creator's subscriber count
/// and the break-even amount is rounded up to the nearest $5, with a hard
/// floor for cross-border countries.
pub fn creator_minimum(
    country: &str,
    currency: &CurrencyCode,
    subscriber_count: u32,
    usd_rate: UsdRate,
) -> CreatorMinimum {
    let cross_border =
        common::money::CROSS_BORDER_COUNTRIES.contains(&country);
    let costs = country_costs(country);
    let margin = platform_rate(cross_border) - costs.percent;
    debug_assert!(margin > Decimal::ZERO, "negative margin for {country}");

    let amortized_fixed = Decimal::from(costs.fixed_usd_cents)
        / Decimal::from(subscriber_count.max(1));

    // Break-even charge amount: margin * amount >= amortized fixed costs.
    let break_even = amortized_fixed / margin;
    let mut minimum_usd_cents = ceil_to_nearest_500(break_even);

    if cross_border {
        minimum_usd_cents =
            minimum_usd_cents.max(CROSS_BORDER_MINIMUM_FLOOR_USD_CENTS);
    }

    let minimum_local_cents = common::money::usd_cents_to_local_minor(
        minimum_usd_cents,
        usd_rate,
        currency,
    )
    .unwrap_or(minimum_usd_cents);

    CreatorMinimum {
        minimum_usd_cents,
        minimum_local_cents,
        currency: currency.clone(),
        net_margin_rate: margin,
        fixed_cents: costs.fixed_usd_cents,
    }
}

/// Round up to the nearest $5 (500 cents), never below $5.
fn ceil_to_nearest_500(usd_cents: Decimal) -> i64 {
    let step = dec!(500);
    let steps = (usd_cents / step).ceil();
    let cents = steps * step;
    round_to_i64(cents.max(step)).expect("minimum fits in i64")
}

fn round_cents(value: Decimal) -> i64 {
    round_to_i64(value).expect("fee math stays within i64")
}

#[cfg(test)]
mod test {
    use common::test_utils::arbitrary;
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn domestic_split_math() {
        let fees = calculate_service_fee(10_000, false);
        assert_eq!(fees.subscriber_fee_cents, Some(450));
        assert_eq!(fees.creator_fee_cents, Some(450));
        assert_eq!(fees.fee_cents, 900);
        assert_eq!(fees.gross_cents, 10_450);
        assert_eq!(fees.net_cents, 9_550);
        assert_eq!(fees.fee_model, FeeModel::SplitV1);
    }

    #[test]
    fn cross_border_split_math() {
        let fees = calculate_service_fee(10_000, true);
        assert_eq!(fees.subscriber_fee_cents, Some(525));
        assert_eq!(fees.creator_fee_cents, Some(525));
        assert_eq!(fees.fee_cents, 1_050);
        assert_eq!(fees.gross_cents, 10_525);
        assert_eq!(fees.net_cents, 9_475);
    }

    #[test]
    fn legacy_absorb_and_pass() {
        let absorb = calculate_legacy_fee(10_000, FeeMode::Absorb, false);
        assert_eq!(absorb.fee_cents, 900);
        assert_eq!(absorb.gross_cents, 10_000);
        assert_eq!(absorb.net_cents, 9_100);

        let pass = calculate_legacy_fee(
            10_000,
            FeeMode::PassToSubscriber,
            false,
        );
        assert_eq!(pass.fee_cents, 900);
        assert_eq!(pass.gross_cents, 10_900);
        assert_eq!(pass.net_cents, 10_000);
    }

    /// `base + subscriber_fee == gross` and `base - creator_fee == net` for
    /// any amount in the supported range, domestic or cross-border.
    #[test]
    fn split_invariants() {
        proptest!(|(
            base in arbitrary::any_amount_cents(),
            cross_border: bool,
        )| {
            let fees = calculate_service_fee(base, cross_border);
            let subscriber_fee = fees.subscriber_fee_cents.unwrap();
            let creator_fee = fees.creator_fee_cents.unwrap();

            prop_assert_eq!(base + subscriber_fee, fees.gross_cents);
            prop_assert_eq!(base - creator_fee, fees.net_cents);
            prop_assert_eq!(subscriber_fee + creator_fee, fees.fee_cents);
            prop_assert!(subscriber_fee >= 0 && creator_fee >= 0);
        })
    }

    /// `|fee| + |net| == |gross|` holds in both legacy modes too.
    #[test]
    fn legacy_invariants() {
        proptest!(|(
            base in arbitrary::any_amount_cents(),
            absorb: bool,
            cross_border: bool,
        )| {
            let mode = if absorb {
                FeeMode::Absorb
            } else {
                FeeMode::PassToSubscriber
            };
            let fees = calculate_legacy_fee(base, mode, cross_border);
            prop_assert_eq!(
                fees.fee_cents.abs() + fees.net_cents.abs(),
                fees.gross_cents.abs()
            );
        })
    }

    /// Inverting a provider-reported gross recovers the base the checkout
    /// was priced from, up to a cent of rounding.
    #[test]
    fn gross_inversion_recovers_base() {
        proptest!(|(
            base in arbitrary::any_amount_cents(),
            cross_border: bool,
        )| {
            let forward = calculate_service_fee(base, cross_border);
            let inverted = breakdown_from_gross(
                forward.gross_cents,
                FeeModel::SplitV1,
                FeeMode::Split,
                cross_border,
            );
            prop_assert_eq!(inverted.gross_cents, forward.gross_cents);
            prop_assert!((inverted.base_cents - base).abs() <= 1);
            prop_assert_eq!(
                inverted.base_cents + inverted.subscriber_fee_cents.unwrap(),
                inverted.gross_cents
            );
            prop_assert_eq!(
                inverted.base_cents - inverted.creator_fee_cents.unwrap(),
                inverted.net_cents
            );
        })
    }

    #[test]
    fn half_refund_splits_proportionally() {
        // Subscriber paid 104.50, fee 9.00, creator got 95.50; refund half.
        let refund = refund_breakdown(10_450, 900, None, 5_225);
        assert_eq!(refund.amount_cents, -5_225);
        assert_eq!(refund.fee_cents, -450);
        assert_eq!(refund.net_cents, -4_775);
    }

    #[test]
    fn refund_preserves_split_fields() {
        let original = calculate_service_fee(10_000, true);
        let refund = refund_breakdown(
            original.gross_cents,
            original.fee_cents,
            original.creator_fee_cents,
            original.gross_cents,
        );
        // Full refund exactly cancels the original.
        assert_eq!(refund.fee_cents, -original.fee_cents);
        assert_eq!(refund.net_cents, -original.net_cents);
        assert_eq!(
            refund.creator_fee_cents,
            original.creator_fee_cents.map(|c| -c)
        );
        assert_eq!(
            refund.subscriber_fee_cents,
            original.subscriber_fee_cents.map(|c| -c)
        );
    }

    /// Partial refunds always satisfy `fee + net == amount` and the split
    /// fields always sum to the fee.
    #[test]
    fn refund_invariants() {
        proptest!(|(
            base in arbitrary::any_amount_cents(),
            cross_border: bool,
            refund_pct in 1u32..=100,
        )| {
            let original = calculate_service_fee(base, cross_border);
            let refund_amount =
                (original.gross_cents * i64::from(refund_pct) / 100).max(1);
            let refund = refund_breakdown(
                original.gross_cents,
                original.fee_cents,
                original.creator_fee_cents,
                refund_amount,
            );
            prop_assert_eq!(
                refund.fee_cents + refund.net_cents,
                refund.amount_cents
            );
            prop_assert_eq!(
                refund.creator_fee_cents.unwrap()
                    + refund.subscriber_fee_cents.unwrap(),
                refund.fee_cents
            );
        })
    }

    #[test]
    fn minimum_rounds_up_to_five_dollars() {
        let usd = CurrencyCode::usd();
        // Solo US creator: 30c fixed / 6.1% margin ~= $4.92 -> $5.
        let min = creator_minimum("US", &usd, 1, UsdRate::ONE);
        assert_eq!(min.minimum_usd_cents, 500);
        assert_eq!(min.minimum_local_cents, 500);
        assert_eq!(min.net_margin_rate, dec!(0.061));
        assert_eq!(min.fixed_cents, 30);
    }

    #[test]
    fn minimum_amortizes_over_subscribers() {
        let usd = CurrencyCode::usd();
        let solo = creator_minimum("US", &usd, 1, UsdRate::ONE);
        let popular = creator_minimum("US", &usd, 1_000, UsdRate::ONE);
        assert!(popular.minimum_usd_cents <= solo.minimum_usd_cents);
        assert_eq!(popular.minimum_usd_cents, 500);
    }

    #[test]
    fn cross_border_floor_applies() {
        let ngn = "NGN".parse::<CurrencyCode>().unwrap();
        let rate = UsdRate::new(dec!(1500)).unwrap();
        let min = creator_minimum("NG", &ngn, 10_000, rate);
        assert_eq!(min.minimum_usd_cents, 10_00);
        assert_eq!(min.minimum_local_cents, 1_500_000);
    }
}
