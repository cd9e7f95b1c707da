use crate::domain::invoice::format_invoice_number;
use crate::domain::types::TenantId;
use crate::error::Result;
use crate::storage::invoices::InvoiceRepository;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Produces gapless, strictly increasing invoice numbers per tenant.
///
/// The sequence itself lives in the invoice store as a per-tenant atomic
/// counter, independent of the cycle state machine: invoices for
/// different cycles of the same tenant may finalize concurrently. A
/// number consumed by a finalization that later fails is burned, never
/// reused.
pub struct InvoiceNumberer {
    invoices: Arc<dyn InvoiceRepository>,
    template: String,
}

impl InvoiceNumberer {
    pub fn new(invoices: Arc<dyn InvoiceRepository>, template: impl Into<String>) -> Self {
        Self {
            invoices,
            template: template.into(),
        }
    }

    pub async fn next(&self, tenant_id: &TenantId, issued_at: DateTime<Utc>) -> Result<String> {
        let sequence = self.invoices.next_sequence(tenant_id).await?;
        format_invoice_number(&self.template, issued_at, sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryInvoiceRepository;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_numbers_are_strictly_increasing_per_tenant() {
        let invoices = Arc::new(InMemoryInvoiceRepository::new());
        let numberer = InvoiceNumberer::new(invoices, "INV-{YYYY}{MM}{DD}-{SEQ6}");
        let issued = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let tenant = TenantId::new();

        let first = numberer.next(&tenant, issued).await.unwrap();
        let second = numberer.next(&tenant, issued).await.unwrap();
        assert_eq!(first, "INV-20240131-000001");
        assert_eq!(second, "INV-20240131-000002");

        // Another tenant starts its own sequence.
        let other = numberer.next(&TenantId::new(), issued).await.unwrap();
        assert_eq!(other, "INV-20240131-000001");
    }
}
