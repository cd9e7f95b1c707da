//! In-memory repositories for development and testing.
//!
//! These mirror the Sql implementations' contracts, including the
//! conditional-write semantics of the cycle store: every check-and-swap
//! happens under a single write lock, so the CAS guarantees hold under
//! concurrent callers exactly as they do against Postgres.

use crate::domain::cycle::BillingCycle;
use crate::domain::invoice::Invoice;
use crate::domain::ledger::LedgerEntry;
use crate::domain::rating::RatingResult;
use crate::domain::subscription::Subscription;
use crate::domain::types::{
    CycleId, CycleState, InvoiceId, MeterCode, SubscriptionId, SubscriptionItemId, TenantId,
};
use crate::error::{BillingError, Result};
use crate::storage::cycles::CycleRepository;
use crate::storage::invoices::InvoiceRepository;
use crate::storage::ledger::LedgerRepository;
use crate::storage::rating::RatingRepository;
use crate::storage::subscriptions::SubscriptionRepository;
use crate::storage::usage::{UsageEvent, UsageRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemorySubscriptionRepository {
    subscriptions: Arc<RwLock<HashMap<SubscriptionId, Subscription>>>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, subscription: Subscription) {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(subscription.id, subscription);
    }

    pub async fn update(&self, subscription: Subscription) {
        self.insert(subscription).await;
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn get(&self, id: &SubscriptionId) -> Result<Subscription> {
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .get(id)
            .cloned()
            .ok_or_else(|| BillingError::SubscriptionNotFound { id: id.to_string() })
    }

    async fn active_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        let mut active: Vec<Subscription> = subscriptions
            .values()
            .filter(|s| s.status.is_billable() && s.start_at <= now)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }
}

#[derive(Default)]
pub struct InMemoryUsageRepository {
    events: Arc<RwLock<Vec<UsageEvent>>>,
    seen_keys: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn sum_quantity(
        &self,
        meter: &MeterCode,
        item: &SubscriptionItemId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Decimal> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| {
                e.meter_code == *meter
                    && e.subscription_item_id == *item
                    && e.recorded_at >= start
                    && e.recorded_at < end
            })
            .map(|e| e.quantity)
            .sum())
    }

    async fn record(&self, event: UsageEvent) -> Result<()> {
        let mut seen = self.seen_keys.write().await;
        if !seen.insert(event.idempotency_key.clone()) {
            return Ok(());
        }
        let mut events = self.events.write().await;
        events.push(event);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCycleRepository {
    cycles: Arc<RwLock<HashMap<CycleId, BillingCycle>>>,
}

impl InMemoryCycleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CycleRepository for InMemoryCycleRepository {
    async fn insert(&self, cycle: &BillingCycle) -> Result<()> {
        let mut cycles = self.cycles.write().await;
        // Mirror the Sql store's per-subscription period uniqueness: the
        // loser of a concurrent ensure race no-ops.
        let duplicate = cycles.values().any(|c| {
            c.subscription_id == cycle.subscription_id && c.period_start == cycle.period_start
        });
        if !duplicate {
            cycles.insert(cycle.id, cycle.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &CycleId) -> Result<BillingCycle> {
        let cycles = self.cycles.read().await;
        cycles
            .get(id)
            .cloned()
            .ok_or_else(|| BillingError::CycleNotFound { id: id.to_string() })
    }

    async fn latest_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<BillingCycle>> {
        let cycles = self.cycles.read().await;
        Ok(cycles
            .values()
            .filter(|c| c.subscription_id == *subscription_id)
            .max_by_key(|c| c.period_start)
            .cloned())
    }

    async fn due_for_close(&self, now: DateTime<Utc>) -> Result<Vec<CycleId>> {
        let cycles = self.cycles.read().await;
        let mut due: Vec<&BillingCycle> = cycles
            .values()
            .filter(|c| c.state == CycleState::Open && c.period_end <= now)
            .collect();
        due.sort_by_key(|c| c.period_end);
        Ok(due.iter().map(|c| c.id).collect())
    }

    async fn cycles_in_state(&self, state: CycleState) -> Result<Vec<BillingCycle>> {
        let cycles = self.cycles.read().await;
        let mut found: Vec<BillingCycle> = cycles
            .values()
            .filter(|c| c.state == state)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.period_end);
        Ok(found)
    }

    async fn recoverable(&self, cutoff: DateTime<Utc>, ceiling: u32) -> Result<Vec<BillingCycle>> {
        let cycles = self.cycles.read().await;
        let mut found: Vec<BillingCycle> = cycles
            .values()
            .filter(|c| {
                c.state == CycleState::Error && c.updated_at <= cutoff && c.error_count <= ceiling
            })
            .cloned()
            .collect();
        found.sort_by_key(|c| c.updated_at);
        Ok(found)
    }

    async fn transition_if_state(
        &self,
        id: &CycleId,
        expected: CycleState,
        next: CycleState,
    ) -> Result<bool> {
        if !expected.can_transition_to(next) {
            return Err(BillingError::InvalidStateTransition {
                from: expected.to_string(),
                to: next.to_string(),
            });
        }

        let mut cycles = self.cycles.write().await;
        let cycle = cycles
            .get_mut(id)
            .ok_or_else(|| BillingError::CycleNotFound { id: id.to_string() })?;

        if cycle.state != expected {
            return Ok(false);
        }
        cycle.state = next;
        cycle.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_error(&self, id: &CycleId) -> Result<u32> {
        let mut cycles = self.cycles.write().await;
        let cycle = cycles
            .get_mut(id)
            .ok_or_else(|| BillingError::CycleNotFound { id: id.to_string() })?;
        cycle.state = CycleState::Error;
        cycle.error_count += 1;
        cycle.updated_at = Utc::now();
        Ok(cycle.error_count)
    }

    async fn set_period_end(&self, id: &CycleId, period_end: DateTime<Utc>) -> Result<()> {
        let mut cycles = self.cycles.write().await;
        let cycle = cycles
            .get_mut(id)
            .ok_or_else(|| BillingError::CycleNotFound { id: id.to_string() })?;
        cycle.period_end = period_end;
        cycle.updated_at = Utc::now();
        Ok(())
    }

    async fn force_reopen(&self, id: &CycleId) -> Result<()> {
        let mut cycles = self.cycles.write().await;
        let cycle = cycles
            .get_mut(id)
            .ok_or_else(|| BillingError::CycleNotFound { id: id.to_string() })?;
        if cycle.state != CycleState::Closed {
            return Err(BillingError::InvalidStateTransition {
                from: cycle.state.to_string(),
                to: CycleState::Open.to_string(),
            });
        }
        cycle.state = CycleState::Open;
        cycle.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_error_count(&self, id: &CycleId) -> Result<()> {
        let mut cycles = self.cycles.write().await;
        let cycle = cycles
            .get_mut(id)
            .ok_or_else(|| BillingError::CycleNotFound { id: id.to_string() })?;
        cycle.error_count = 0;
        cycle.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRatingRepository {
    results: Arc<RwLock<HashMap<(CycleId, SubscriptionItemId), RatingResult>>>,
}

impl InMemoryRatingRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RatingRepository for InMemoryRatingRepository {
    async fn upsert_results(&self, results: &[RatingResult]) -> Result<()> {
        let mut stored = self.results.write().await;
        for result in results {
            stored.insert(
                (result.cycle_id, result.subscription_item_id),
                result.clone(),
            );
        }
        Ok(())
    }

    async fn results_for_cycle(&self, cycle_id: &CycleId) -> Result<Vec<RatingResult>> {
        let stored = self.results.read().await;
        let mut results: Vec<RatingResult> = stored
            .values()
            .filter(|r| r.cycle_id == *cycle_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.subscription_item_id.as_uuid());
        Ok(results)
    }
}

#[derive(Default)]
pub struct InMemoryInvoiceRepository {
    invoices: Arc<RwLock<HashMap<CycleId, Invoice>>>,
    sequences: Arc<RwLock<HashMap<TenantId, i64>>>,
}

impl InMemoryInvoiceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceRepository for InMemoryInvoiceRepository {
    async fn upsert(&self, invoice: &Invoice) -> Result<()> {
        let mut invoices = self.invoices.write().await;
        invoices.insert(invoice.cycle_id, invoice.clone());
        Ok(())
    }

    async fn get(&self, id: &InvoiceId) -> Result<Invoice> {
        let invoices = self.invoices.read().await;
        invoices
            .values()
            .find(|i| i.id == *id)
            .cloned()
            .ok_or_else(|| BillingError::InvoiceNotFound { id: id.to_string() })
    }

    async fn get_by_cycle(&self, cycle_id: &CycleId) -> Result<Option<Invoice>> {
        let invoices = self.invoices.read().await;
        Ok(invoices.get(cycle_id).cloned())
    }

    async fn next_sequence(&self, tenant_id: &TenantId) -> Result<i64> {
        let mut sequences = self.sequences.write().await;
        let value = sequences.entry(*tenant_id).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}

#[derive(Default)]
pub struct InMemoryLedgerRepository {
    entries: Arc<RwLock<Vec<LedgerEntry>>>,
}

impl InMemoryLedgerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_entries(&self) -> Vec<LedgerEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedgerRepository {
    async fn post(&self, entry: &LedgerEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.push(entry.clone());
        Ok(())
    }

    async fn entries_for_invoice(&self, invoice_id: &InvoiceId) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.invoice_id == Some(*invoice_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::subscription::Subscription;
    use crate::domain::types::{BillingInterval, Currency};

    fn open_cycle() -> BillingCycle {
        let subscription = Subscription::new(
            TenantId::new(),
            Currency::usd(),
            BillingInterval::monthly(),
            Utc::now() - chrono::Duration::days(40),
            vec![],
        );
        BillingCycle::first(&subscription)
    }

    #[tokio::test]
    async fn test_transition_if_state_single_winner() {
        let repo = Arc::new(InMemoryCycleRepository::new());
        let cycle = open_cycle();
        repo.insert(&cycle).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            let id = cycle.id;
            handles.push(tokio::spawn(async move {
                repo.transition_if_state(&id, CycleState::Open, CycleState::Closing)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let stored = repo.get(&cycle.id).await.unwrap();
        assert_eq!(stored.state, CycleState::Closing);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let repo = InMemoryCycleRepository::new();
        let cycle = open_cycle();
        repo.insert(&cycle).await.unwrap();

        let err = repo
            .transition_if_state(&cycle.id, CycleState::Open, CycleState::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_record_error_increments_count() {
        let repo = InMemoryCycleRepository::new();
        let cycle = open_cycle();
        repo.insert(&cycle).await.unwrap();

        assert_eq!(repo.record_error(&cycle.id).await.unwrap(), 1);
        assert_eq!(repo.record_error(&cycle.id).await.unwrap(), 2);

        let stored = repo.get(&cycle.id).await.unwrap();
        assert_eq!(stored.state, CycleState::Error);
    }

    #[tokio::test]
    async fn test_next_sequence_no_duplicates_under_contention() {
        let repo = Arc::new(InMemoryInvoiceRepository::new());
        let tenant = TenantId::new();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let repo = repo.clone();
            handles.push(tokio::spawn(
                async move { repo.next_sequence(&tenant).await.unwrap() },
            ));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_usage_dedupe_by_idempotency_key() {
        let repo = InMemoryUsageRepository::new();
        let meter = MeterCode::new("api_calls");
        let item = SubscriptionItemId::new();
        let now = Utc::now();

        let event = UsageEvent::new("key-1", meter.clone(), item, Decimal::from(5), now);
        repo.record(event.clone()).await.unwrap();
        repo.record(event).await.unwrap();

        let sum = repo
            .sum_quantity(
                &meter,
                &item,
                now - chrono::Duration::hours(1),
                now + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(sum, Decimal::from(5));
    }
}
