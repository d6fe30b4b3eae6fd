//! Checkout session initiation.
//!
//! Validates the request against the creator's configuration, dedupes
//! double-clicks through a short-TTL Redis key, and creates the provider
//! session. No local `Subscription` row is created here: the event applier
//! creates it on the first successful charge, so abandoned checkouts never
//! pollute the subscriptions table (the cleanup sweeper expires the session
//! records themselves).

use common::{
    api::{
        error::CoreApiError,
        models::{
            BillingInterval, CheckoutRequest, CheckoutResponse,
            CheckoutVerifyResponse, Provider,
        },
    },
    constants::{CHECKOUT_DEDUPE_TTL, PRICE_MATCH_TOLERANCE},
    money,
    time::TimestampMs,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    context::Ctx,
    fees,
    models::{CheckoutSession, CheckoutSessionStatus, Creator, FeeMode},
    router,
    traits::{PaystackInitRequest, StripeSessionRequest},
};

/// Floor applied to regional-processor checkouts instead of the dynamic
/// minimum, in minor units of the charge currency.
const REGIONAL_FLOOR_MINOR: i64 = 1_000;

/// `POST /checkout/session`.
#[instrument(skip_all, fields(creator_id = %req.creator_id))]
pub async fn create_checkout_session(
    ctx: &Ctx,
    req: &CheckoutRequest,
) -> Result<CheckoutResponse, CoreApiError> {
    let creator = ctx
        .store
        .get_creator(req.creator_id)
        .await?
        .ok_or_else(|| CoreApiError::not_found("Unknown creator"))?;

    validate_amount_against_prices(&creator, req)?;

    let provider = router::route_checkout(
        &creator,
        req.payer_country.as_deref(),
    )
    .ok_or_else(|| {
        CoreApiError::invalid_request(
            "Creator has no payment provider connected",
        )
    })?;

    validate_currency(&creator, provider, req)?;
    enforce_minimum(ctx, &creator, provider, req).await?;

    if provider == Provider::Paystack && req.subscriber_email.is_none() {
        return Err(CoreApiError::invalid_request(
            "Subscriber email is required for this checkout",
        ));
    }

    // Swallow double-clicks: same creator + payer + amount within the TTL
    // returns the prior session if it is still pending.
    let payer_fp = req
        .subscriber_email
        .clone()
        .or_else(|| req.payer_country.clone())
        .unwrap_or_else(|| "anon".to_owned());
    let dedupe_key = format!(
        "checkout_dedupe:{}:{payer_fp}:{}",
        req.creator_id, req.amount_cents
    );
    if let Some(prior_id) = ctx.cache.get(&dedupe_key).await? {
        if let Some(prior) =
            ctx.store.get_checkout_session(&prior_id).await?
        {
            if prior.status == CheckoutSessionStatus::Pending {
                info!(session_id = %prior.session_id, "Checkout deduped");
                return Ok(CheckoutResponse {
                    url: prior.url,
                    provider: prior.provider,
                    session_id: prior.session_id,
                });
            }
        }
    }

    // The subscriber pays gross; the platform fee rides along as the
    // application fee on the provider side.
    let breakdown = fees::calculate_fee(
        req.amount_cents,
        crate::models::FeeModel::SplitV1,
        FeeMode::Split,
        creator.is_cross_border(),
    );

    let now = TimestampMs::now();
    let session = match provider {
        Provider::Stripe => {
            let account_id =
                creator.stripe_account_id.clone().ok_or_else(|| {
                    CoreApiError::invalid_request(
                        "Creator has not connected the card processor",
                    )
                })?;
            ctx.stripe
                .create_checkout_session(&StripeSessionRequest {
                    connected_account_id: account_id,
                    amount_cents: breakdown.gross_cents,
                    currency: req.currency.clone(),
                    interval: req.interval,
                    subscriber_email: req.subscriber_email.clone(),
                    application_fee_cents: breakdown.fee_cents,
                    creator_id: creator.id,
                    tier_id: req.tier_id,
                    success_url: format!(
                        "{}/checkout/success",
                        ctx.app_url
                    ),
                    cancel_url: format!("{}/checkout/cancel", ctx.app_url),
                })
                .await?
        }
        Provider::Paystack => {
            let reference = format!("ps_{}", Uuid::new_v4().simple());
            ctx.paystack
                .initialize_transaction(&PaystackInitRequest {
                    email: req
                        .subscriber_email
                        .clone()
                        .expect("checked above"),
                    amount_cents: breakdown.gross_cents,
                    currency: req.currency.clone(),
                    subaccount_code: creator
                        .paystack_subaccount_code
                        .clone(),
                    reference,
                    callback_url: format!(
                        "{}/checkout/success",
                        ctx.app_url
                    ),
                    creator_id: creator.id,
                    tier_id: req.tier_id,
                })
                .await?
        }
    };

    let record = CheckoutSession {
        session_id: session.session_id.clone(),
        provider,
        creator_id: creator.id,
        subscriber_email: req.subscriber_email.clone(),
        amount_cents: req.amount_cents,
        currency: req.currency.clone(),
        interval: req.interval,
        url: session.url.clone(),
        status: CheckoutSessionStatus::Pending,
        subscription_id: None,
        created_at: now,
    };
    ctx.store.insert_checkout_session(&record).await?;

    if let Err(e) = ctx
        .cache
        .set_px(&dedupe_key, &session.session_id, CHECKOUT_DEDUPE_TTL)
        .await
    {
        // Dedupe is advisory; checkout proceeds without it.
        warn!("Failed to set checkout dedupe key: {e:#}");
    }

    Ok(CheckoutResponse {
        url: session.url,
        provider,
        session_id: session.session_id,
    })
}

/// `GET /checkout/session/:id/verify`, for client post-redirect polling.
pub async fn verify_checkout_session(
    ctx: &Ctx,
    session_id: &str,
) -> Result<CheckoutVerifyResponse, CoreApiError> {
    let session = ctx
        .store
        .get_checkout_session(session_id)
        .await?
        .ok_or_else(|| CoreApiError::not_found("Unknown session"))?;
    Ok(CheckoutVerifyResponse {
        status: session.status.as_str().to_owned(),
        subscription_id: session.subscription_id,
    })
}

/// The request amount must match a configured price (single or tier) within
/// one minor unit of rounding noise. One-time checkouts on creators with no
/// configured prices are open-amount.
fn validate_amount_against_prices(
    creator: &Creator,
    req: &CheckoutRequest,
) -> Result<(), CoreApiError> {
    let mut configured: Vec<i64> = Vec::new();
    if let Some(price) = creator.price_cents {
        configured.push(price);
    }
    match req.tier_id {
        Some(tier_id) => {
            let tier = creator
                .tiers
                .iter()
                .find(|t| t.id == tier_id)
                .ok_or_else(|| {
                    CoreApiError::invalid_request("Unknown tier")
                })?;
            configured = vec![tier.amount_cents];
        }
        None => {
            configured
                .extend(creator.tiers.iter().map(|t| t.amount_cents));
        }
    }

    if configured.is_empty() {
        if req.interval == BillingInterval::OneTime {
            return Ok(());
        }
        return Err(CoreApiError::invalid_request(
            "Creator has no configured prices",
        ));
    }

    let matched = configured.iter().any(|price| {
        (req.amount_cents - price).abs() <= PRICE_MATCH_TOLERANCE
    });
    if matched {
        Ok(())
    } else {
        Err(CoreApiError::invalid_request(
            "Amount does not match a configured price",
        ))
    }
}

/// Cross-border card-processor checkouts collect in USD (the FX conversion
/// happens provider-side and is recorded via reporting fields when the
/// charge event arrives); everything else collects in the creator's payout
/// currency.
fn validate_currency(
    creator: &Creator,
    provider: Provider,
    req: &CheckoutRequest,
) -> Result<(), CoreApiError> {
    let expected = match provider {
        Provider::Stripe if creator.is_cross_border() => {
            money::CurrencyCode::usd()
        }
        _ => creator.currency.clone(),
    };
    if req.currency == expected {
        Ok(())
    } else {
        Err(CoreApiError::invalid_request(format!(
            "Checkout currency must be {expected}"
        )))
    }
}

/// Card-processor creators must meet the dynamic per-country minimum;
/// regional-processor creators get the flat regional floor instead.
async fn enforce_minimum(
    ctx: &Ctx,
    creator: &Creator,
    provider: Provider,
    req: &CheckoutRequest,
) -> Result<(), CoreApiError> {
    match provider {
        Provider::Paystack => {
            if req.amount_cents < REGIONAL_FLOOR_MINOR {
                return Err(CoreApiError::invalid_request(
                    "Amount is below the regional minimum",
                ));
            }
            Ok(())
        }
        Provider::Stripe => {
            if req.interval == BillingInterval::OneTime {
                return Ok(());
            }
            let rate = if req.currency.is_usd() {
                money::UsdRate::ONE
            } else {
                ctx.fx.usd_rate(&req.currency).await?
            };
            let subscriber_count =
                ctx.store.count_active_subscribers(creator.id).await?;
            let minimum = fees::creator_minimum(
                &creator.country,
                &req.currency,
                subscriber_count,
                rate,
            );
            if req.amount_cents < minimum.minimum_local_cents {
                return Err(CoreApiError::invalid_request(format!(
                    "Amount is below the creator minimum of {} {}",
                    minimum.minimum_local_cents, minimum.currency
                )));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{fixtures, harness};

    /// The dynamic minimum amortizes fixed costs over the creator's live
    /// subscriber count: a price that is too low for a brand-new creator
    /// becomes acceptable once enough subscribers share the fixed costs.
    #[tokio::test]
    async fn minimum_amortizes_over_live_subscribers() {
        let h = harness();
        // A corridor where the solo break-even lands above $5: default
        // country costs (3.4% + 35c) against the 9% domestic rate put the
        // solo minimum at $10 and the two-subscriber minimum at $5.
        let mut creator = fixtures::creator_us();
        creator.country = "BR".to_owned();
        creator.price_cents = Some(750);
        creator.tiers.clear();
        let creator_id = creator.id;
        h.store.insert_creator(creator);

        let req = CheckoutRequest {
            creator_id,
            amount_cents: 750,
            currency: money::CurrencyCode::usd(),
            interval: BillingInterval::Month,
            subscriber_email: Some("fan@example.com".to_owned()),
            payer_country: Some("US".to_owned()),
            tier_id: None,
        };

        // No subscribers yet: $7.50 is below the $10 solo minimum.
        let err = create_checkout_session(&h.ctx, &req)
            .await
            .expect_err("Below-minimum checkout must be rejected");
        assert!(err.msg.contains("minimum"));

        // Two active subscribers halve the amortized fixed costs.
        let now = common::time::TimestampMs::now();
        for _ in 0..2 {
            let mut sub = fixtures::subscription_active(now);
            sub.creator_id = creator_id;
            h.store.insert_subscription(sub);
        }
        create_checkout_session(&h.ctx, &req)
            .await
            .expect("Amortized minimum admits the price");
    }
}
