use crate::domain::subscription::Subscription;
use crate::domain::types::{CycleId, CycleState, SubscriptionId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One subscription billing period tracked through the cycle state
/// machine. Cycles are append-only: they are created by the ensure job,
/// mutated only through conditional state transitions, and never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingCycle {
    pub id: CycleId,
    pub tenant_id: TenantId,
    pub subscription_id: SubscriptionId,
    /// Half-open period `[period_start, period_end)`.
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub state: CycleState,
    pub error_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BillingCycle {
    /// First cycle of a subscription, starting at its start_at.
    pub fn first(subscription: &Subscription) -> Self {
        Self::starting_at(subscription, subscription.start_at)
    }

    /// The cycle immediately following `previous`: contiguous periods,
    /// `period_start == previous.period_end`.
    pub fn following(subscription: &Subscription, previous: &BillingCycle) -> Self {
        Self::starting_at(subscription, previous.period_end)
    }

    fn starting_at(subscription: &Subscription, period_start: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: CycleId::new(),
            tenant_id: subscription.tenant_id,
            subscription_id: subscription.id,
            period_start,
            period_end: subscription.interval.advance(period_start),
            state: CycleState::Open,
            error_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_close(&self, now: DateTime<Utc>) -> bool {
        now >= self.period_end
    }

    pub fn seconds_until_end(&self, now: DateTime<Utc>) -> i64 {
        (self.period_end - now).num_seconds().max(0)
    }
}
