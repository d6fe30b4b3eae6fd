//! Subscription lifecycle state machine.
//!
//! States: `pending, active, past_due, canceled`. Transitions are guarded
//! methods on [`Subscription`]; each validates the proposed transition
//! against the current state (and the event's billing period, which is what
//! makes out-of-order webhook delivery safe) before mutating anything.
//! `canceled` is terminal: nothing resurrects it.

use std::time::Duration;

use anyhow::{bail, ensure};
use common::{
    api::models::{BillingInterval, Provider},
    money::CurrencyCode,
    time::TimestampMs,
};
use tracing::warn;
use uuid::Uuid;

use crate::models::{
    CancelReason, FeeMode, FeeModel, Subscription, SubscriptionStatus,
};

/// Days after entering `past_due` at which billing retries run.
pub const RETRY_SCHEDULE_DAYS: [u64; 3] = [1, 3, 5];

/// What a `payment_failed` application did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PaymentFailedOutcome {
    /// Demoted `active` to `past_due`; dunning should begin.
    MarkedPastDue,
    /// The failure was for an already-renewed (or unknown) period; recorded
    /// as historical, no state change.
    Historical,
    /// Already `past_due` or `canceled`; nothing to do.
    NoChange,
}

impl Subscription {
    /// Construct the row bound at first successful charge. Always `active`:
    /// local rows are only created once money has actually moved.
    #[allow(clippy::too_many_arguments)]
    pub fn new_active(
        creator_id: Uuid,
        subscriber_id: Uuid,
        amount_cents: i64,
        currency: CurrencyCode,
        interval: BillingInterval,
        provider: Provider,
        fee_mode: FeeMode,
        period_end: Option<TimestampMs>,
        now: TimestampMs,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            creator_id,
            subscriber_id,
            amount_cents,
            currency,
            interval,
            status: SubscriptionStatus::Active,
            // All new subscriptions are on the split model; legacy remains
            // only on rows that already carry it.
            fee_model: FeeModel::SplitV1,
            fee_mode,
            provider,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            paystack_authorization_enc: None,
            current_period_end: period_end,
            cancel_at_period_end: false,
            canceled_at: None,
            cancel_reason: None,
            ltv_cents: 0,
            manage_token_nonce: 0,
            retry_count: 0,
            past_due_since: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a successful charge: `active`/`past_due -> active`, advance the
    /// period end, reset dunning state. Errors on canceled subscriptions --
    /// a charge landing after cancellation is a reconciliation case, not a
    /// resurrection.
    pub fn apply_charge_success(
        &mut self,
        period_end: Option<TimestampMs>,
        now: TimestampMs,
    ) -> anyhow::Result<()> {
        use SubscriptionStatus::*;
        match self.status {
            Pending | Active | PastDue => (),
            Canceled => bail!(
                "Charge arrived for canceled subscription {}",
                self.id
            ),
        }

        if self.status == PastDue {
            warn!(
                subscription_id = %self.id,
                "Retry succeeded; restoring active"
            );
        }
        self.status = Active;
        self.retry_count = 0;
        self.past_due_since = None;

        // Advance to the provider-reported period end; never move backwards
        // (a replayed older event must not rewind the period).
        match (period_end, self.current_period_end) {
            (Some(new_end), Some(cur)) if new_end > cur => {
                self.current_period_end = Some(new_end);
            }
            (Some(new_end), None) => self.current_period_end = Some(new_end),
            _ => (),
        }
        self.updated_at = now;
        Ok(())
    }

    /// Apply a failed renewal. Only `active` demotes to `past_due`, and only
    /// when the failure is for the current period: a late `payment_failed`
    /// after a newer `charge.success` must not demote.
    pub fn apply_payment_failed(
        &mut self,
        failed_period_end: Option<TimestampMs>,
        now: TimestampMs,
    ) -> PaymentFailedOutcome {
        use SubscriptionStatus::*;
        match self.status {
            PastDue | Canceled | Pending => {
                return PaymentFailedOutcome::NoChange
            }
            Active => (),
        }

        if let (Some(failed_end), Some(current_end)) =
            (failed_period_end, self.current_period_end)
        {
            if failed_end < current_end {
                // The period this failure was for has already been renewed.
                return PaymentFailedOutcome::Historical;
            }
        }

        self.status = PastDue;
        self.past_due_since = Some(now);
        self.retry_count = 0;
        self.updated_at = now;
        PaymentFailedOutcome::MarkedPastDue
    }

    /// Creator/subscriber cancel at end of the current period. Keeps the
    /// subscription billing-eligible until the period lapses.
    pub fn request_cancel_at_period_end(
        &mut self,
        now: TimestampMs,
    ) -> anyhow::Result<()> {
        ensure!(
            self.status != SubscriptionStatus::Canceled,
            "Subscription {} already canceled",
            self.id
        );
        self.cancel_at_period_end = true;
        self.canceled_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Undo a pending end-of-period cancellation.
    pub fn reactivate(&mut self, now: TimestampMs) -> anyhow::Result<()> {
        ensure!(
            self.status != SubscriptionStatus::Canceled,
            "Subscription {} already canceled",
            self.id
        );
        self.cancel_at_period_end = false;
        self.updated_at = now;
        Ok(())
    }

    /// Terminal cancellation. Idempotent: canceling a canceled subscription
    /// keeps the original `canceled_at` and reason.
    pub fn cancel_now(&mut self, reason: CancelReason, now: TimestampMs) {
        if self.status == SubscriptionStatus::Canceled {
            return;
        }
        self.status = SubscriptionStatus::Canceled;
        self.canceled_at = Some(now);
        self.cancel_reason = Some(reason);
        self.cancel_at_period_end = false;
        self.updated_at = now;
    }

    /// Whether the dunning retry at `attempt` (0-based) is due.
    pub fn retry_due(&self, attempt: usize, now: TimestampMs) -> bool {
        if self.status != SubscriptionStatus::PastDue {
            return false;
        }
        let Some(since) = self.past_due_since else {
            return false;
        };
        match RETRY_SCHEDULE_DAYS.get(attempt) {
            Some(days) => {
                let due_at = since
                    .saturating_add(Duration::from_secs(days * 24 * 3600));
                now >= due_at
            }
            None => false,
        }
    }

    /// Whether all retries have been exhausted and the grace period is over.
    pub fn retries_exhausted(&self, now: TimestampMs) -> bool {
        if self.status != SubscriptionStatus::PastDue {
            return false;
        }
        let Some(since) = self.past_due_since else {
            return false;
        };
        let last_day = RETRY_SCHEDULE_DAYS[RETRY_SCHEDULE_DAYS.len() - 1];
        let cutoff =
            since.saturating_add(Duration::from_secs(last_day * 24 * 3600));
        now >= cutoff
            && self.retry_count >= RETRY_SCHEDULE_DAYS.len() as i32
    }

    /// The idempotency key for billing one period once:
    /// `(subscription_id, period_key)`.
    pub fn period_key(&self) -> String {
        let end = self
            .current_period_end
            .map(|ts| ts.as_ms())
            .unwrap_or_default();
        format!("{}:{end}", self.id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::fixtures;

    fn ts(ms: i64) -> TimestampMs {
        TimestampMs::try_from_ms(ms).unwrap()
    }

    const DAY_MS: i64 = 24 * 3600 * 1000;

    #[test]
    fn charge_success_restores_past_due() {
        let mut sub = fixtures::subscription_active(ts(0));
        assert_eq!(
            sub.apply_payment_failed(sub.current_period_end, ts(DAY_MS)),
            PaymentFailedOutcome::MarkedPastDue
        );
        assert_eq!(sub.status, SubscriptionStatus::PastDue);

        sub.apply_charge_success(Some(ts(40 * DAY_MS)), ts(2 * DAY_MS))
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_end, Some(ts(40 * DAY_MS)));
        assert_eq!(sub.past_due_since, None);
    }

    #[test]
    fn late_failure_does_not_demote_renewed_subscription() {
        let mut sub = fixtures::subscription_active(ts(0));
        // Renewal advances the period to t+60d...
        sub.apply_charge_success(Some(ts(60 * DAY_MS)), ts(30 * DAY_MS))
            .unwrap();
        // ...then a failure for the old period (ending t+30d) arrives late.
        let outcome =
            sub.apply_payment_failed(Some(ts(30 * DAY_MS)), ts(31 * DAY_MS));
        assert_eq!(outcome, PaymentFailedOutcome::Historical);
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[test]
    fn replayed_older_charge_does_not_rewind_period() {
        let mut sub = fixtures::subscription_active(ts(0));
        sub.apply_charge_success(Some(ts(60 * DAY_MS)), ts(30 * DAY_MS))
            .unwrap();
        sub.apply_charge_success(Some(ts(30 * DAY_MS)), ts(31 * DAY_MS))
            .unwrap();
        assert_eq!(sub.current_period_end, Some(ts(60 * DAY_MS)));
    }

    #[test]
    fn canceled_is_terminal() {
        let mut sub = fixtures::subscription_active(ts(0));
        sub.cancel_now(CancelReason::SubscriberRequest, ts(DAY_MS));
        let canceled_at = sub.canceled_at;

        // No event may transition canceled -> active.
        assert!(sub
            .apply_charge_success(Some(ts(90 * DAY_MS)), ts(2 * DAY_MS))
            .is_err());
        assert_eq!(
            sub.apply_payment_failed(None, ts(2 * DAY_MS)),
            PaymentFailedOutcome::NoChange
        );
        assert!(sub.request_cancel_at_period_end(ts(2 * DAY_MS)).is_err());

        // Re-canceling keeps the original timestamp and reason.
        sub.cancel_now(CancelReason::PaymentFailed, ts(3 * DAY_MS));
        assert_eq!(sub.canceled_at, canceled_at);
        assert_eq!(
            sub.cancel_reason,
            Some(CancelReason::SubscriberRequest)
        );
    }

    #[test]
    fn retry_schedule_gates() {
        let mut sub = fixtures::subscription_active(ts(0));
        sub.apply_payment_failed(sub.current_period_end, ts(0));

        assert!(!sub.retry_due(0, ts(DAY_MS - 1)));
        assert!(sub.retry_due(0, ts(DAY_MS)));
        assert!(!sub.retry_due(1, ts(DAY_MS)));
        assert!(sub.retry_due(1, ts(3 * DAY_MS)));
        assert!(sub.retry_due(2, ts(5 * DAY_MS)));
        // Off the end of the schedule: never due.
        assert!(!sub.retry_due(3, ts(100 * DAY_MS)));

        assert!(!sub.retries_exhausted(ts(5 * DAY_MS)));
        sub.retry_count = 3;
        assert!(sub.retries_exhausted(ts(5 * DAY_MS)));
    }

    #[test]
    fn end_of_period_cancel_keeps_status() {
        let mut sub = fixtures::subscription_active(ts(0));
        sub.request_cancel_at_period_end(ts(DAY_MS)).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.cancel_at_period_end);
        assert_eq!(sub.canceled_at, None);

        sub.reactivate(ts(2 * DAY_MS)).unwrap();
        assert!(!sub.cancel_at_period_end);
    }
}
