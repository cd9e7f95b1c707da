use crate::domain::pricing::PricedLine;
use crate::domain::subscription::{BillingMode, SubscriptionItem};
use crate::domain::types::{Amount, Currency, CycleId, MeterCode, SubscriptionItemId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A rated billing line item: the priced outcome of one subscription item
/// for one cycle. Keyed by `(cycle_id, subscription_item_id)` and written
/// through idempotent upserts, so re-rating a cycle reproduces rather
/// than duplicates these rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingResult {
    pub cycle_id: CycleId,
    pub subscription_item_id: SubscriptionItemId,
    pub billing_mode: BillingMode,
    pub meter_code: Option<MeterCode>,
    pub currency: Currency,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    pub amount: Amount,
    pub rated_at: DateTime<Utc>,
}

impl RatingResult {
    /// `rated_at` is the period end the line was rated as of, not the
    /// wall-clock time rating ran: re-rating a cycle must reproduce
    /// identical rows.
    pub fn from_priced_line(
        cycle_id: CycleId,
        item: &SubscriptionItem,
        currency: Currency,
        rated_at: DateTime<Utc>,
        line: PricedLine,
    ) -> Self {
        Self {
            cycle_id,
            subscription_item_id: item.id,
            billing_mode: item.billing_mode,
            meter_code: item.meter_code.clone(),
            currency,
            quantity: line.quantity,
            unit_amount: line.unit_amount,
            amount: line.amount,
            rated_at,
        }
    }
}
