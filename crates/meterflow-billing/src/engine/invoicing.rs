use crate::domain::invoice::{Invoice, InvoiceItem, InvoiceStatus, InvoiceTaxLine};
use crate::domain::ledger::{AccountCode, LedgerEntry, LedgerEntryLine};
use crate::domain::rating::RatingResult;
use crate::domain::subscription::BillingMode;
use crate::domain::types::{CycleId, CycleState, InvoiceId};
use crate::engine::numbering::InvoiceNumberer;
use crate::error::{BillingError, Result};
use crate::storage::cycles::CycleRepository;
use crate::storage::invoices::InvoiceRepository;
use crate::storage::ledger::LedgerRepository;
use crate::storage::rating::RatingRepository;
use crate::storage::subscriptions::SubscriptionRepository;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Collaborator computing tax lines for a draft invoice.
#[async_trait]
pub trait TaxCalculator: Send + Sync {
    async fn compute_tax(&self, draft: &Invoice) -> Result<Vec<InvoiceTaxLine>>;
}

/// Tax-exempt default used when no provider is configured.
pub struct NullTaxCalculator;

#[async_trait]
impl TaxCalculator for NullTaxCalculator {
    async fn compute_tax(&self, _draft: &Invoice) -> Result<Vec<InvoiceTaxLine>> {
        Ok(Vec::new())
    }
}

/// Turns rated cycles into invoices and balanced ledger entries.
#[async_trait]
pub trait InvoicingOperations: Send + Sync {
    async fn invoice(&self, cycle_id: &CycleId) -> Result<()>;
}

pub struct InvoicingEngine {
    cycles: Arc<dyn CycleRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    rating: Arc<dyn RatingRepository>,
    invoices: Arc<dyn InvoiceRepository>,
    ledger: Arc<dyn LedgerRepository>,
    tax: Arc<dyn TaxCalculator>,
    numberer: InvoiceNumberer,
    /// Self-hosted deployments finalize in the same job; cloud mode
    /// leaves the draft for an external finalize action.
    finalize_immediately: bool,
}

impl InvoicingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cycles: Arc<dyn CycleRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        rating: Arc<dyn RatingRepository>,
        invoices: Arc<dyn InvoiceRepository>,
        ledger: Arc<dyn LedgerRepository>,
        tax: Arc<dyn TaxCalculator>,
        numberer: InvoiceNumberer,
        finalize_immediately: bool,
    ) -> Self {
        Self {
            cycles,
            subscriptions,
            rating,
            invoices,
            ledger,
            tax,
            numberer,
            finalize_immediately,
        }
    }

    fn invoice_items(results: &[RatingResult]) -> Vec<InvoiceItem> {
        results
            .iter()
            .map(|r| InvoiceItem {
                subscription_item_id: r.subscription_item_id,
                description: match (&r.billing_mode, &r.meter_code) {
                    (BillingMode::Metered, Some(meter)) => format!("Usage: {meter}"),
                    (BillingMode::Metered, None) => "Usage".to_string(),
                    (BillingMode::Licensed, _) => "Subscription".to_string(),
                },
                billing_mode: r.billing_mode,
                quantity: r.quantity,
                unit_amount: r.unit_amount,
                amount: r.amount,
            })
            .collect()
    }

    /// The balanced double-entry posting for a finalized invoice: debit
    /// accounts receivable for the total, credit the revenue accounts
    /// split by billing mode, credit tax payable.
    fn ledger_entry(invoice: &Invoice) -> Result<LedgerEntry> {
        let mut lines = vec![LedgerEntryLine::debit(
            AccountCode::AccountsReceivable,
            invoice.total,
            invoice.currency.clone(),
        )];

        let flat = invoice.subtotal_for(BillingMode::Licensed);
        if !flat.is_zero() {
            lines.push(LedgerEntryLine::credit(
                AccountCode::RevenueFlat,
                flat,
                invoice.currency.clone(),
            ));
        }

        let usage = invoice.subtotal_for(BillingMode::Metered);
        if !usage.is_zero() {
            lines.push(LedgerEntryLine::credit(
                AccountCode::RevenueUsage,
                usage,
                invoice.currency.clone(),
            ));
        }

        if !invoice.tax.is_zero() {
            lines.push(LedgerEntryLine::credit(
                AccountCode::TaxPayable,
                invoice.tax,
                invoice.currency.clone(),
            ));
        }

        let description = match &invoice.number {
            Some(number) => format!("invoice {number}"),
            None => format!("invoice {}", invoice.id),
        };
        LedgerEntry::new(invoice.tenant_id, Some(invoice.id), description, lines)
    }

    /// Post the invoice's ledger entry unless one already exists. Keeps
    /// re-entry after a crash between posting and the closing write from
    /// double-posting.
    async fn post_once(&self, invoice: &Invoice) -> Result<()> {
        if invoice.total.is_zero() {
            return Ok(());
        }
        let posted = self.ledger.entries_for_invoice(&invoice.id).await?;
        if posted.is_empty() {
            self.ledger.post(&Self::ledger_entry(invoice)?).await?;
        }
        Ok(())
    }

    /// Re-entry path for an already finalized invoice: complete the
    /// ledger posting if a crash interrupted it, then close the cycle.
    async fn complete_finalized(&self, cycle_id: &CycleId, invoice: &Invoice) -> Result<()> {
        if self.finalize_immediately {
            let posted = self.ledger.entries_for_invoice(&invoice.id).await?;
            if posted.is_empty() && !invoice.total.is_zero() {
                warn!(
                    invoice_id = %invoice.id,
                    cycle_id = %cycle_id,
                    "finalized invoice had no ledger entry; completing posting"
                );
            }
            self.post_once(invoice).await?;
        }
        self.close_cycle(cycle_id).await
    }

    async fn close_cycle(&self, cycle_id: &CycleId) -> Result<()> {
        // Losing this write means another worker already closed the cycle.
        self.cycles
            .transition_if_state(cycle_id, CycleState::Closing, CycleState::Closed)
            .await?;
        Ok(())
    }

    /// Void a finalized invoice. The original posting stays in the
    /// append-only ledger; a balancing reversal backs it out.
    pub async fn void_invoice(&self, invoice_id: &InvoiceId) -> Result<()> {
        let mut invoice = self.invoices.get(invoice_id).await?;
        invoice.void()?;
        self.invoices.upsert(&invoice).await?;

        let entries = self.ledger.entries_for_invoice(invoice_id).await?;
        for entry in &entries {
            let description = match &invoice.number {
                Some(number) => format!("void invoice {number}"),
                None => format!("void invoice {}", invoice.id),
            };
            self.ledger.post(&entry.reversal(description)?).await?;
        }

        info!(invoice_id = %invoice.id, "voided invoice");
        Ok(())
    }
}

#[async_trait]
impl InvoicingOperations for InvoicingEngine {
    async fn invoice(&self, cycle_id: &CycleId) -> Result<()> {
        let cycle = self.cycles.get(cycle_id).await?;
        if cycle.state != CycleState::Closing {
            return Err(BillingError::CycleNotClosing {
                id: cycle_id.to_string(),
                state: cycle.state.to_string(),
            });
        }

        let subscription = self.subscriptions.get(&cycle.subscription_id).await?;
        let results = self.rating.results_for_cycle(cycle_id).await?;

        let rated: std::collections::HashSet<_> =
            results.iter().map(|r| r.subscription_item_id).collect();
        if results.is_empty() || subscription.items.iter().any(|i| !rated.contains(&i.id)) {
            return Err(BillingError::MissingRatingResults {
                cycle_id: cycle_id.to_string(),
            });
        }

        for result in &results {
            if result.currency != subscription.currency {
                return Err(BillingError::CurrencyMismatch {
                    expected: subscription.currency.to_string(),
                    found: result.currency.to_string(),
                });
            }
        }

        // One invoice per cycle: reuse the existing row when re-run.
        let existing = self.invoices.get_by_cycle(cycle_id).await?;
        if let Some(invoice) = &existing {
            if invoice.status != InvoiceStatus::Draft {
                return self.complete_finalized(cycle_id, invoice).await;
            }
        }

        let mut invoice = match existing {
            Some(mut draft) => {
                draft.items = Self::invoice_items(&results);
                draft.recompute_totals();
                draft
            }
            None => {
                // Persist the draft before doing anything else so that a
                // concurrent worker adopts this row instead of minting a
                // second invoice for the cycle.
                let draft = Invoice::draft(
                    cycle.tenant_id,
                    cycle.id,
                    subscription.currency.clone(),
                    Self::invoice_items(&results),
                );
                self.invoices.upsert(&draft).await?;
                self.invoices.get_by_cycle(cycle_id).await?.ok_or_else(|| {
                    BillingError::InvariantViolation {
                        message: format!("invoice for cycle {cycle_id} missing after upsert"),
                    }
                })?
            }
        };

        let tax_lines = self.tax.compute_tax(&invoice).await?;
        invoice.set_tax_lines(tax_lines);

        if self.finalize_immediately {
            let issued_at = Utc::now();
            let number = self.numberer.next(&cycle.tenant_id, issued_at).await?;
            invoice.finalize(number, issued_at)?;
            self.invoices.upsert(&invoice).await?;

            // Ledger posting is deliberately the last write before the
            // cycle closes: a failure anywhere earlier leaves no
            // financial trace, and an observer never sees a CLOSED cycle
            // without its balanced entry.
            self.post_once(&invoice).await?;

            info!(
                cycle_id = %cycle.id,
                invoice_id = %invoice.id,
                number = invoice.number.as_deref().unwrap_or_default(),
                total_minor = invoice.total.as_minor(),
                "finalized invoice"
            );
        } else {
            self.invoices.upsert(&invoice).await?;
            info!(
                cycle_id = %cycle.id,
                invoice_id = %invoice.id,
                total_minor = invoice.total.as_minor(),
                "drafted invoice, finalization deferred"
            );
        }

        self.close_cycle(cycle_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cycle::BillingCycle;
    use crate::domain::ledger::Direction;
    use crate::domain::pricing::Price;
    use crate::domain::subscription::{Subscription, SubscriptionItem};
    use crate::domain::types::{Amount, BillingInterval, Currency, TenantId};
    use crate::engine::rating::{RatingEngine, RatingOperations};
    use crate::storage::memory::{
        InMemoryCycleRepository, InMemoryInvoiceRepository, InMemoryLedgerRepository,
        InMemoryRatingRepository, InMemorySubscriptionRepository, InMemoryUsageRepository,
    };
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Fixture {
        engine: InvoicingEngine,
        rating_engine: RatingEngine,
        cycles: Arc<InMemoryCycleRepository>,
        usage: Arc<InMemoryUsageRepository>,
        invoices: Arc<InMemoryInvoiceRepository>,
        ledger: Arc<InMemoryLedgerRepository>,
        cycle: BillingCycle,
    }

    async fn fixture(items: Vec<SubscriptionItem>, finalize_immediately: bool) -> Fixture {
        let subscriptions = Arc::new(InMemorySubscriptionRepository::new());
        let cycles = Arc::new(InMemoryCycleRepository::new());
        let usage = Arc::new(InMemoryUsageRepository::new());
        let rating = Arc::new(InMemoryRatingRepository::new());
        let invoices = Arc::new(InMemoryInvoiceRepository::new());
        let ledger = Arc::new(InMemoryLedgerRepository::new());

        let subscription = Subscription::new(
            TenantId::new(),
            Currency::usd(),
            BillingInterval::monthly(),
            Utc::now() - Duration::days(40),
            items,
        );
        subscriptions.insert(subscription.clone()).await;

        let mut cycle = BillingCycle::first(&subscription);
        cycle.state = CycleState::Closing;
        cycles.insert(&cycle).await.unwrap();

        let rating_engine = RatingEngine::new(
            cycles.clone(),
            subscriptions.clone(),
            usage.clone(),
            rating.clone(),
        );

        let numberer =
            InvoiceNumberer::new(invoices.clone(), "INV-{YYYY}{MM}{DD}-{SEQ6}");
        let engine = InvoicingEngine::new(
            cycles.clone(),
            subscriptions.clone(),
            rating.clone(),
            invoices.clone(),
            ledger.clone(),
            Arc::new(NullTaxCalculator),
            numberer,
            finalize_immediately,
        );

        Fixture {
            engine,
            rating_engine,
            cycles,
            usage,
            invoices,
            ledger,
            cycle,
        }
    }

    fn flat_licensed(amount_minor: i64) -> SubscriptionItem {
        SubscriptionItem::licensed(
            Price::flat(Currency::usd(), Decimal::from(amount_minor)),
            dec!(1),
        )
    }

    #[tokio::test]
    async fn test_invoice_requires_rating_results() {
        let fx = fixture(vec![flat_licensed(1000)], true).await;

        let err = fx.engine.invoice(&fx.cycle.id).await.unwrap_err();
        assert!(matches!(err, BillingError::MissingRatingResults { .. }));
    }

    #[tokio::test]
    async fn test_finalize_posts_balanced_ledger_and_closes_cycle() {
        let fx = fixture(vec![flat_licensed(1000)], true).await;

        fx.rating_engine.rate(&fx.cycle.id).await.unwrap();
        fx.engine.invoice(&fx.cycle.id).await.unwrap();

        let cycle = fx.cycles.get(&fx.cycle.id).await.unwrap();
        assert_eq!(cycle.state, CycleState::Closed);

        let invoice = fx
            .invoices
            .get_by_cycle(&fx.cycle.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Finalized);
        assert_eq!(invoice.total, Amount::from_minor(1000));
        assert!(invoice.number.as_deref().unwrap().starts_with("INV-"));
        assert!(invoice.issued_at.is_some());

        let entries = fx.ledger.entries_for_invoice(&invoice.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];

        let debit: i64 = entry
            .lines
            .iter()
            .filter(|l| l.direction == Direction::Debit)
            .map(|l| l.amount.as_minor())
            .sum();
        let credit: i64 = entry
            .lines
            .iter()
            .filter(|l| l.direction == Direction::Credit)
            .map(|l| l.amount.as_minor())
            .sum();
        assert_eq!(debit, 1000);
        assert_eq!(credit, 1000);

        let revenue_flat = entry
            .lines
            .iter()
            .find(|l| l.account == AccountCode::RevenueFlat)
            .unwrap();
        assert_eq!(revenue_flat.amount.as_minor(), 1000);
    }

    #[tokio::test]
    async fn test_deferred_mode_leaves_draft_and_closes_cycle() {
        let fx = fixture(vec![flat_licensed(1000)], false).await;

        fx.rating_engine.rate(&fx.cycle.id).await.unwrap();
        fx.engine.invoice(&fx.cycle.id).await.unwrap();

        let cycle = fx.cycles.get(&fx.cycle.id).await.unwrap();
        assert_eq!(cycle.state, CycleState::Closed);

        let invoice = fx
            .invoices
            .get_by_cycle(&fx.cycle.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Draft);
        assert!(invoice.number.is_none());
        assert!(invoice.issued_at.is_none());

        let entries = fx.ledger.entries_for_invoice(&invoice.id).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_rerun_reuses_invoice_and_does_not_double_post() {
        let fx = fixture(vec![flat_licensed(1000)], true).await;

        fx.rating_engine.rate(&fx.cycle.id).await.unwrap();
        fx.engine.invoice(&fx.cycle.id).await.unwrap();
        let invoice = fx
            .invoices
            .get_by_cycle(&fx.cycle.id)
            .await
            .unwrap()
            .unwrap();

        // Simulate a crash between ledger post and the closing write:
        // the cycle is forced back to CLOSING and the job re-runs.
        fx.cycles.force_reopen(&fx.cycle.id).await.unwrap();
        assert!(fx
            .cycles
            .transition_if_state(&fx.cycle.id, CycleState::Open, CycleState::Closing)
            .await
            .unwrap());

        fx.engine.invoice(&fx.cycle.id).await.unwrap();

        let cycle = fx.cycles.get(&fx.cycle.id).await.unwrap();
        assert_eq!(cycle.state, CycleState::Closed);

        let entries = fx.ledger.entries_for_invoice(&invoice.id).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_revenue_split_by_billing_mode() {
        use crate::domain::types::MeterCode;
        use crate::storage::usage::{UsageEvent, UsageRepository};

        let licensed = flat_licensed(700);
        let metered = SubscriptionItem::metered(
            Price::flat(Currency::usd(), dec!(3)),
            MeterCode::new("api_calls"),
        );
        let metered_id = metered.id;
        let fx = fixture(vec![licensed, metered], true).await;

        fx.usage
            .record(UsageEvent::new(
                "e1",
                MeterCode::new("api_calls"),
                metered_id,
                dec!(100),
                fx.cycle.period_start + Duration::days(1),
            ))
            .await
            .unwrap();

        fx.rating_engine.rate(&fx.cycle.id).await.unwrap();
        fx.engine.invoice(&fx.cycle.id).await.unwrap();

        let invoice = fx
            .invoices
            .get_by_cycle(&fx.cycle.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.total.as_minor(), 1000);

        let entries = fx.ledger.entries_for_invoice(&invoice.id).await.unwrap();
        let entry = &entries[0];

        let line_amount = |account: AccountCode| {
            entry
                .lines
                .iter()
                .find(|l| l.account == account)
                .map(|l| l.amount.as_minor())
        };
        assert_eq!(line_amount(AccountCode::AccountsReceivable), Some(1000));
        assert_eq!(line_amount(AccountCode::RevenueFlat), Some(700));
        assert_eq!(line_amount(AccountCode::RevenueUsage), Some(300));
    }

    #[tokio::test]
    async fn test_void_posts_balancing_reversal() {
        let fx = fixture(vec![flat_licensed(1000)], true).await;

        fx.rating_engine.rate(&fx.cycle.id).await.unwrap();
        fx.engine.invoice(&fx.cycle.id).await.unwrap();
        let invoice = fx
            .invoices
            .get_by_cycle(&fx.cycle.id)
            .await
            .unwrap()
            .unwrap();

        fx.engine.void_invoice(&invoice.id).await.unwrap();

        let voided = fx.invoices.get(&invoice.id).await.unwrap();
        assert_eq!(voided.status, InvoiceStatus::Void);

        // Original entry plus its reversal; receivable nets to zero.
        let entries = fx.ledger.entries_for_invoice(&invoice.id).await.unwrap();
        assert_eq!(entries.len(), 2);

        let receivable_net: i64 = entries
            .iter()
            .flat_map(|e| e.lines.iter())
            .filter(|l| l.account == AccountCode::AccountsReceivable)
            .map(|l| match l.direction {
                Direction::Debit => l.amount.as_minor(),
                Direction::Credit => -l.amount.as_minor(),
            })
            .sum();
        assert_eq!(receivable_net, 0);
    }
}
