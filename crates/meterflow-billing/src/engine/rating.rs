use crate::domain::pricing::resolve_amount;
use crate::domain::rating::RatingResult;
use crate::domain::subscription::BillingMode;
use crate::domain::types::{CycleId, CycleState};
use crate::error::{BillingError, Result};
use crate::storage::cycles::CycleRepository;
use crate::storage::rating::RatingRepository;
use crate::storage::subscriptions::SubscriptionRepository;
use crate::storage::usage::UsageRepository;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Converts a closing cycle's usage and subscription items into rated
/// line items.
#[async_trait]
pub trait RatingOperations: Send + Sync {
    async fn rate(&self, cycle_id: &CycleId) -> Result<()>;

    /// Whether every subscription item active for the cycle has a rating
    /// result. Gates the invoicing job.
    async fn has_complete_results(&self, cycle_id: &CycleId) -> Result<bool>;
}

pub struct RatingEngine {
    cycles: Arc<dyn CycleRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    usage: Arc<dyn UsageRepository>,
    rating: Arc<dyn RatingRepository>,
}

impl RatingEngine {
    pub fn new(
        cycles: Arc<dyn CycleRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        usage: Arc<dyn UsageRepository>,
        rating: Arc<dyn RatingRepository>,
    ) -> Self {
        Self {
            cycles,
            subscriptions,
            usage,
            rating,
        }
    }
}

#[async_trait]
impl RatingOperations for RatingEngine {
    /// Rating is atomic per cycle: every item is priced before anything
    /// is written, so a failing item leaves no partially-rated cycle
    /// behind. The writes themselves are keyed upserts over a pure read
    /// of the immutable usage log, which is what makes re-invocation
    /// reproduce identical results.
    async fn rate(&self, cycle_id: &CycleId) -> Result<()> {
        let cycle = self.cycles.get(cycle_id).await?;
        if cycle.state != CycleState::Closing {
            return Err(BillingError::CycleNotClosing {
                id: cycle_id.to_string(),
                state: cycle.state.to_string(),
            });
        }

        let subscription = self.subscriptions.get(&cycle.subscription_id).await?;

        let mut results = Vec::with_capacity(subscription.items.len());
        for item in &subscription.items {
            let quantity = match item.billing_mode {
                BillingMode::Licensed => {
                    if item.quantity > Decimal::ZERO {
                        item.quantity
                    } else {
                        Decimal::ONE
                    }
                }
                BillingMode::Metered => {
                    let meter = item.meter_code.as_ref().ok_or_else(|| {
                        BillingError::MissingMeter {
                            item: item.id.to_string(),
                        }
                    })?;
                    self.usage
                        .sum_quantity(meter, &item.id, cycle.period_start, cycle.period_end)
                        .await?
                }
            };

            let line = resolve_amount(
                &item.price,
                quantity,
                &subscription.currency,
                cycle.period_start,
                subscription.interval,
            )?;

            results.push(RatingResult::from_priced_line(
                cycle.id,
                item,
                subscription.currency.clone(),
                cycle.period_end,
                line,
            ));
        }

        self.rating.upsert_results(&results).await?;

        info!(
            cycle_id = %cycle.id,
            subscription_id = %cycle.subscription_id,
            line_items = results.len(),
            "rated billing cycle"
        );
        Ok(())
    }

    async fn has_complete_results(&self, cycle_id: &CycleId) -> Result<bool> {
        let cycle = self.cycles.get(cycle_id).await?;
        let subscription = self.subscriptions.get(&cycle.subscription_id).await?;
        let results = self.rating.results_for_cycle(cycle_id).await?;

        let rated: HashSet<_> = results.iter().map(|r| r.subscription_item_id).collect();
        Ok(subscription.items.iter().all(|item| rated.contains(&item.id)))
    }
}
