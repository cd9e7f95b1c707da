use crate::domain::subscription::BillingMode;
use crate::domain::types::{
    Amount, Currency, CycleId, InvoiceId, SubscriptionItemId, TenantId,
};
use crate::error::{BillingError, Result};
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Finalized => "finalized",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "finalized" => InvoiceStatus::Finalized,
            "void" => InvoiceStatus::Void,
            _ => InvoiceStatus::Draft,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One invoice line, derived from a rating result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub subscription_item_id: SubscriptionItemId,
    pub description: String,
    pub billing_mode: BillingMode,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    pub amount: Amount,
}

/// Tax line computed by the tax collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceTaxLine {
    pub name: String,
    pub rate: Decimal,
    pub amount: Amount,
}

/// A tenant invoice for one billing cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub tenant_id: TenantId,
    pub cycle_id: CycleId,
    pub status: InvoiceStatus,
    pub currency: Currency,
    pub subtotal: Amount,
    pub tax: Amount,
    pub total: Amount,
    /// Human-readable number, assigned only at finalization.
    pub number: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub items: Vec<InvoiceItem>,
    pub tax_lines: Vec<InvoiceTaxLine>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn draft(
        tenant_id: TenantId,
        cycle_id: CycleId,
        currency: Currency,
        items: Vec<InvoiceItem>,
    ) -> Self {
        let now = Utc::now();
        let mut invoice = Self {
            id: InvoiceId::new(),
            tenant_id,
            cycle_id,
            status: InvoiceStatus::Draft,
            currency,
            subtotal: Amount::zero(),
            tax: Amount::zero(),
            total: Amount::zero(),
            number: None,
            issued_at: None,
            items,
            tax_lines: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        invoice.recompute_totals();
        invoice
    }

    pub fn set_tax_lines(&mut self, tax_lines: Vec<InvoiceTaxLine>) {
        self.tax_lines = tax_lines;
        self.recompute_totals();
    }

    pub fn recompute_totals(&mut self) {
        self.subtotal = self.items.iter().map(|i| i.amount).sum();
        self.tax = self.tax_lines.iter().map(|t| t.amount).sum();
        self.total = self.subtotal.add(self.tax);
        self.updated_at = Utc::now();
    }

    pub fn subtotal_for(&self, mode: BillingMode) -> Amount {
        self.items
            .iter()
            .filter(|i| i.billing_mode == mode)
            .map(|i| i.amount)
            .sum()
    }

    pub fn finalize(&mut self, number: String, issued_at: DateTime<Utc>) -> Result<()> {
        if self.status != InvoiceStatus::Draft {
            return Err(BillingError::InvalidStateTransition {
                from: self.status.to_string(),
                to: InvoiceStatus::Finalized.to_string(),
            });
        }
        self.status = InvoiceStatus::Finalized;
        self.number = Some(number);
        self.issued_at = Some(issued_at);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn void(&mut self) -> Result<()> {
        if self.status != InvoiceStatus::Finalized {
            return Err(BillingError::InvalidStateTransition {
                from: self.status.to_string(),
                to: InvoiceStatus::Void.to_string(),
            });
        }
        self.status = InvoiceStatus::Void;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Render an invoice number from a template with `{YYYY}{MM}{DD}` date
/// tokens and a zero-padded `{SEQn}` sequence token. Pure; fails if any
/// `{...}` token is left unresolved.
pub fn format_invoice_number(
    template: &str,
    issued_at: DateTime<Utc>,
    sequence: i64,
) -> Result<String> {
    let date = issued_at.date_naive();
    let mut number = template
        .replace("{YYYY}", &format!("{:04}", date.year()))
        .replace("{MM}", &format!("{:02}", date.month()))
        .replace("{DD}", &format!("{:02}", date.day()));

    while let Some(start) = number.find("{SEQ") {
        let end = match number[start..].find('}') {
            Some(offset) => start + offset,
            None => {
                return Err(BillingError::InvalidNumberTemplate {
                    template: template.to_string(),
                    token: number[start..].to_string(),
                })
            }
        };
        let width: usize = number[start + 4..end].parse().map_err(|_| {
            BillingError::InvalidNumberTemplate {
                template: template.to_string(),
                token: number[start..=end].to_string(),
            }
        })?;
        let padded = format!("{:0width$}", sequence, width = width);
        number.replace_range(start..=end, &padded);
    }

    if let Some(start) = number.find('{') {
        let end = number[start..]
            .find('}')
            .map(|offset| start + offset + 1)
            .unwrap_or(number.len());
        return Err(BillingError::InvalidNumberTemplate {
            template: template.to_string(),
            token: number[start..end].to_string(),
        });
    }

    Ok(number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_invoice_number() {
        let issued = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let number = format_invoice_number("INV-{YYYY}{MM}{DD}-{SEQ6}", issued, 1).unwrap();
        assert_eq!(number, "INV-20240131-000001");

        let number = format_invoice_number("{YYYY}/{SEQ4}", issued, 420).unwrap();
        assert_eq!(number, "2024/0420");
    }

    #[test]
    fn test_format_rejects_unresolved_tokens() {
        let issued = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let err = format_invoice_number("INV-{TENANT}-{SEQ6}", issued, 1).unwrap_err();
        assert!(matches!(err, BillingError::InvalidNumberTemplate { .. }));

        let err = format_invoice_number("INV-{SEQ}", issued, 1).unwrap_err();
        assert!(matches!(err, BillingError::InvalidNumberTemplate { .. }));
    }

    #[test]
    fn test_sequence_wider_than_padding() {
        let issued = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let number = format_invoice_number("{SEQ2}", issued, 1234).unwrap();
        assert_eq!(number, "1234");
    }

    #[test]
    fn test_finalize_only_from_draft() {
        let mut invoice = Invoice::draft(
            TenantId::new(),
            CycleId::new(),
            Currency::usd(),
            Vec::new(),
        );
        invoice
            .finalize("INV-1".to_string(), Utc::now())
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Finalized);

        let err = invoice.finalize("INV-2".to_string(), Utc::now()).unwrap_err();
        assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_void_only_from_finalized() {
        let mut invoice = Invoice::draft(
            TenantId::new(),
            CycleId::new(),
            Currency::usd(),
            Vec::new(),
        );
        assert!(invoice.void().is_err());

        invoice.finalize("INV-1".to_string(), Utc::now()).unwrap();
        invoice.void().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Void);
    }
}
