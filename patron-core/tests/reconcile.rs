//! Reconciliation: settled provider transactions missing locally are
//! reported and, with auto-fix, healed through the regular applier.

use common::{money::CurrencyCode, time::TimestampMs};
use patron_core::{
    reconcile,
    testing::{fixtures, harness},
    traits::ProviderTransaction,
};

fn settled_tx(
    reference: &str,
    creator_id: uuid::Uuid,
    amount_cents: i64,
) -> ProviderTransaction {
    ProviderTransaction {
        reference: reference.to_owned(),
        amount_cents,
        currency: CurrencyCode::usd(),
        status: "succeeded".to_owned(),
        creator_id: Some(creator_id),
        subscriber_email: Some("fan@example.com".to_owned()),
        occurred_at: TimestampMs::now(),
    }
}

#[tokio::test]
async fn heal_and_converge() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    h.stripe
        .set_transactions(vec![settled_tx("T_X", creator_id, 10_450)]);

    // First run heals the miss.
    let report = reconcile::run(&h.ctx, 48, true).await.unwrap();
    assert_eq!(report.discrepancies, vec!["T_X".to_owned()]);
    assert_eq!(report.healed, 1);

    let payments = h.store.payments();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].provider_charge_ref.as_deref(), Some("T_X"));
    assert_eq!(
        payments[0].provider_event_id.as_deref(),
        Some("manual_T_X")
    );
    assert_eq!(payments[0].gross_cents, 10_450);

    // Discrepancy alert fired.
    assert!(h.alerts.raised().iter().any(|a| matches!(
        a,
        patron_core::traits::OpsAlert::ReconciliationDiscrepancies {
            count: 1,
            auto_fixed: 1,
        }
    )));

    // Second run finds a clean ledger.
    let report = reconcile::run(&h.ctx, 48, true).await.unwrap();
    assert!(report.discrepancies.is_empty());
    assert_eq!(report.healed, 0);
    assert_eq!(h.store.payments().len(), 1);
}

#[tokio::test]
async fn unsettled_and_unattributable_are_left_alone() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);

    let mut pending = settled_tx("T_pending", creator_id, 5_000);
    pending.status = "pending".to_owned();
    let mut orphan = settled_tx("T_orphan", creator_id, 5_000);
    orphan.creator_id = None;
    h.stripe.set_transactions(vec![pending, orphan]);

    let report = reconcile::run(&h.ctx, 48, true).await.unwrap();
    assert!(report.discrepancies.is_empty());
    assert_eq!(report.unattributable, vec!["T_orphan".to_owned()]);
    assert!(h.store.payments().is_empty());
}

#[tokio::test]
async fn report_only_without_auto_fix() {
    let h = harness();
    let creator = fixtures::creator_us();
    let creator_id = creator.id;
    h.store.insert_creator(creator);
    h.stripe
        .set_transactions(vec![settled_tx("T_R", creator_id, 7_000)]);

    let report = reconcile::run(&h.ctx, 48, false).await.unwrap();
    assert_eq!(report.discrepancies.len(), 1);
    assert_eq!(report.healed, 0);
    assert!(h.store.payments().is_empty());
}
