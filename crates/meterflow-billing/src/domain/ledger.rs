use crate::domain::types::{Amount, Currency, EntryId, InvoiceId, TenantId};
use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Chart-of-accounts kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Asset,
    Liability,
    Income,
    Expense,
}

/// Chart of accounts the billing engine posts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountCode {
    AccountsReceivable,
    RevenueFlat,
    RevenueUsage,
    TaxPayable,
    CreditBalance,
    RefundLiability,
    PaymentFeeExpense,
    Adjustment,
}

impl AccountCode {
    pub fn kind(&self) -> AccountKind {
        match self {
            AccountCode::AccountsReceivable => AccountKind::Asset,
            AccountCode::RevenueFlat | AccountCode::RevenueUsage => AccountKind::Income,
            AccountCode::TaxPayable
            | AccountCode::CreditBalance
            | AccountCode::RefundLiability => AccountKind::Liability,
            AccountCode::PaymentFeeExpense => AccountKind::Expense,
            AccountCode::Adjustment => AccountKind::Income,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountCode::AccountsReceivable => "accounts_receivable",
            AccountCode::RevenueFlat => "revenue_flat",
            AccountCode::RevenueUsage => "revenue_usage",
            AccountCode::TaxPayable => "tax_payable",
            AccountCode::CreditBalance => "credit_balance",
            AccountCode::RefundLiability => "refund_liability",
            AccountCode::PaymentFeeExpense => "payment_fee_expense",
            AccountCode::Adjustment => "adjustment",
        }
    }
}

impl std::fmt::Display for AccountCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry line direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }
}

/// One side of a double-entry transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntryLine {
    pub account: AccountCode,
    pub direction: Direction,
    pub amount: Amount,
    pub currency: Currency,
}

impl LedgerEntryLine {
    pub fn debit(account: AccountCode, amount: Amount, currency: Currency) -> Self {
        Self {
            account,
            direction: Direction::Debit,
            amount,
            currency,
        }
    }

    pub fn credit(account: AccountCode, amount: Amount, currency: Currency) -> Self {
        Self {
            account,
            direction: Direction::Credit,
            amount,
            currency,
        }
    }
}

/// An immutable, balanced double-entry transaction. Construction is the
/// only way to obtain one, so an unbalanced entry can never be posted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub tenant_id: TenantId,
    pub invoice_id: Option<InvoiceId>,
    pub description: String,
    pub posted_at: DateTime<Utc>,
    pub lines: Vec<LedgerEntryLine>,
}

impl LedgerEntry {
    pub fn new(
        tenant_id: TenantId,
        invoice_id: Option<InvoiceId>,
        description: impl Into<String>,
        lines: Vec<LedgerEntryLine>,
    ) -> Result<Self> {
        let mut totals: HashMap<&Currency, (i64, i64)> = HashMap::new();
        for line in &lines {
            let entry = totals.entry(&line.currency).or_insert((0, 0));
            match line.direction {
                Direction::Debit => entry.0 += line.amount.as_minor(),
                Direction::Credit => entry.1 += line.amount.as_minor(),
            }
        }

        for (currency, (debits, credits)) in totals {
            if debits != credits {
                return Err(BillingError::UnbalancedLedgerEntry {
                    currency: currency.to_string(),
                    debits,
                    credits,
                });
            }
        }

        Ok(Self {
            id: EntryId::new(),
            tenant_id,
            invoice_id,
            description: description.into(),
            posted_at: Utc::now(),
            lines,
        })
    }

    /// A new balanced entry with every line's direction flipped, used to
    /// back out a posted invoice when it is voided.
    pub fn reversal(&self, description: impl Into<String>) -> Result<Self> {
        let lines = self
            .lines
            .iter()
            .map(|line| LedgerEntryLine {
                account: line.account,
                direction: match line.direction {
                    Direction::Debit => Direction::Credit,
                    Direction::Credit => Direction::Debit,
                },
                amount: line.amount,
                currency: line.currency.clone(),
            })
            .collect();
        Self::new(self.tenant_id, self.invoice_id, description, lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd() -> Currency {
        Currency::usd()
    }

    #[test]
    fn test_balanced_entry_accepted() {
        let entry = LedgerEntry::new(
            TenantId::new(),
            None,
            "invoice 1",
            vec![
                LedgerEntryLine::debit(
                    AccountCode::AccountsReceivable,
                    Amount::from_minor(1100),
                    usd(),
                ),
                LedgerEntryLine::credit(AccountCode::RevenueFlat, Amount::from_minor(1000), usd()),
                LedgerEntryLine::credit(AccountCode::TaxPayable, Amount::from_minor(100), usd()),
            ],
        )
        .unwrap();
        assert_eq!(entry.lines.len(), 3);
    }

    #[test]
    fn test_unbalanced_entry_rejected() {
        let err = LedgerEntry::new(
            TenantId::new(),
            None,
            "bad",
            vec![
                LedgerEntryLine::debit(
                    AccountCode::AccountsReceivable,
                    Amount::from_minor(1000),
                    usd(),
                ),
                LedgerEntryLine::credit(AccountCode::RevenueFlat, Amount::from_minor(900), usd()),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::UnbalancedLedgerEntry { .. }));
    }

    #[test]
    fn test_balance_checked_per_currency() {
        let err = LedgerEntry::new(
            TenantId::new(),
            None,
            "mixed",
            vec![
                LedgerEntryLine::debit(
                    AccountCode::AccountsReceivable,
                    Amount::from_minor(500),
                    usd(),
                ),
                LedgerEntryLine::credit(
                    AccountCode::RevenueUsage,
                    Amount::from_minor(500),
                    Currency::new("EUR"),
                ),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::UnbalancedLedgerEntry { .. }));
    }

    #[test]
    fn test_reversal_flips_directions() {
        let entry = LedgerEntry::new(
            TenantId::new(),
            None,
            "invoice 1",
            vec![
                LedgerEntryLine::debit(
                    AccountCode::AccountsReceivable,
                    Amount::from_minor(1000),
                    usd(),
                ),
                LedgerEntryLine::credit(AccountCode::RevenueUsage, Amount::from_minor(1000), usd()),
            ],
        )
        .unwrap();

        let reversal = entry.reversal("void invoice 1").unwrap();
        assert_eq!(reversal.lines[0].direction, Direction::Credit);
        assert_eq!(reversal.lines[1].direction, Direction::Debit);
    }
}
