//! Provider selection per checkout.
//!
//! Routing is advisory for UX but authoritative for the checkout call. The
//! payer country is client-supplied and untrusted; spoofing it only
//! degrades the payer's own experience.

use common::{api::models::Provider, money::CROSS_BORDER_COUNTRIES};

use crate::models::Creator;

/// Pick the provider for a checkout request.
///
/// 1. If only one provider is connected, use it.
/// 2. If both are connected, payers in the cross-border set route to the
///    regional processor; everyone else to the card processor.
/// 3. If the payer country is absent or invalid, fall back to the
///    creator's default.
pub fn route_checkout(
    creator: &Creator,
    payer_country: Option<&str>,
) -> Option<Provider> {
    match (creator.has_stripe(), creator.has_paystack()) {
        (false, false) => None,
        (true, false) => Some(Provider::Stripe),
        (false, true) => Some(Provider::Paystack),
        (true, true) => {
            let country = payer_country
                .map(|c| c.to_ascii_uppercase())
                .filter(|c| c.len() == 2);
            match country {
                Some(c) if CROSS_BORDER_COUNTRIES.contains(&c.as_str()) => {
                    Some(Provider::Paystack)
                }
                Some(_) => Some(Provider::Stripe),
                None => creator.default_provider.or(Some(Provider::Stripe)),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn single_connection_wins() {
        let mut creator = fixtures::creator_us();
        creator.paystack_subaccount_code = None;
        assert_eq!(
            route_checkout(&creator, Some("NG")),
            Some(Provider::Stripe)
        );

        let mut creator = fixtures::creator_ng();
        creator.stripe_account_id = None;
        assert_eq!(
            route_checkout(&creator, Some("US")),
            Some(Provider::Paystack)
        );
    }

    #[test]
    fn both_connected_routes_by_country() {
        let mut creator = fixtures::creator_us();
        creator.paystack_subaccount_code = Some("ACCT_x".to_owned());

        assert_eq!(
            route_checkout(&creator, Some("ng")),
            Some(Provider::Paystack)
        );
        assert_eq!(
            route_checkout(&creator, Some("KE")),
            Some(Provider::Paystack)
        );
        assert_eq!(
            route_checkout(&creator, Some("DE")),
            Some(Provider::Stripe)
        );
    }

    #[test]
    fn missing_or_invalid_country_uses_default() {
        let mut creator = fixtures::creator_us();
        creator.paystack_subaccount_code = Some("ACCT_x".to_owned());
        creator.default_provider = Some(Provider::Paystack);

        assert_eq!(
            route_checkout(&creator, None),
            Some(Provider::Paystack)
        );
        // Three letters is not a country; falls back to the default.
        assert_eq!(
            route_checkout(&creator, Some("NGA")),
            Some(Provider::Paystack)
        );
    }

    #[test]
    fn no_connections_routes_nowhere() {
        let mut creator = fixtures::creator_us();
        creator.stripe_account_id = None;
        creator.paystack_subaccount_code = None;
        assert_eq!(route_checkout(&creator, Some("US")), None);
    }
}
