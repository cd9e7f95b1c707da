use crate::domain::invoice::{Invoice, InvoiceItem, InvoiceStatus, InvoiceTaxLine};
use crate::domain::types::{Amount, Currency, CycleId, InvoiceId, TenantId};
use crate::error::{BillingError, Result};
use crate::storage::postgres::PgConnection;
use async_trait::async_trait;
use sqlx::Row;
use std::sync::Arc;

/// Store for invoices and the per-tenant invoice number sequence.
#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    /// Insert or overwrite the cycle's invoice. Invoices are keyed
    /// uniquely by cycle, so the invoicing job can safely re-run.
    async fn upsert(&self, invoice: &Invoice) -> Result<()>;

    async fn get(&self, id: &InvoiceId) -> Result<Invoice>;
    async fn get_by_cycle(&self, cycle_id: &CycleId) -> Result<Option<Invoice>>;

    /// Atomically increment and return the tenant's invoice sequence.
    /// Numbers consumed by a failed finalization stay burned; gapless
    /// reuse would break audit-grade numbering.
    async fn next_sequence(&self, tenant_id: &TenantId) -> Result<i64>;
}

pub struct SqlInvoiceRepository {
    connection: Arc<PgConnection>,
}

impl SqlInvoiceRepository {
    pub fn new(connection: Arc<PgConnection>) -> Self {
        Self { connection }
    }

    fn row_to_invoice(row: &sqlx::postgres::PgRow) -> Result<Invoice> {
        let items: Vec<InvoiceItem> =
            serde_json::from_value(row.get("items")).map_err(|e| BillingError::DatabaseError {
                operation: "decode_invoice_items".to_string(),
                source: Box::new(e),
            })?;
        let tax_lines: Vec<InvoiceTaxLine> = serde_json::from_value(row.get("tax_lines"))
            .map_err(|e| BillingError::DatabaseError {
                operation: "decode_invoice_tax_lines".to_string(),
                source: Box::new(e),
            })?;

        Ok(Invoice {
            id: InvoiceId::from_uuid(row.get("invoice_id")),
            tenant_id: TenantId::from_uuid(row.get("tenant_id")),
            cycle_id: CycleId::from_uuid(row.get("cycle_id")),
            status: InvoiceStatus::from_string(&row.get::<String, _>("status")),
            currency: Currency::new(row.get::<String, _>("currency")),
            subtotal: Amount::from_minor(row.get("subtotal_minor")),
            tax: Amount::from_minor(row.get("tax_minor")),
            total: Amount::from_minor(row.get("total_minor")),
            number: row.get("number"),
            issued_at: row.get("issued_at"),
            items,
            tax_lines,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl InvoiceRepository for SqlInvoiceRepository {
    async fn upsert(&self, invoice: &Invoice) -> Result<()> {
        let items = serde_json::to_value(&invoice.items).map_err(|e| {
            BillingError::DatabaseError {
                operation: "encode_invoice_items".to_string(),
                source: Box::new(e),
            }
        })?;
        let tax_lines = serde_json::to_value(&invoice.tax_lines).map_err(|e| {
            BillingError::DatabaseError {
                operation: "encode_invoice_tax_lines".to_string(),
                source: Box::new(e),
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO billing.invoices
                (invoice_id, tenant_id, cycle_id, status, currency,
                 subtotal_minor, tax_minor, total_minor, number, issued_at,
                 items, tax_lines, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (cycle_id) DO UPDATE SET
                status = EXCLUDED.status,
                subtotal_minor = EXCLUDED.subtotal_minor,
                tax_minor = EXCLUDED.tax_minor,
                total_minor = EXCLUDED.total_minor,
                number = EXCLUDED.number,
                issued_at = EXCLUDED.issued_at,
                items = EXCLUDED.items,
                tax_lines = EXCLUDED.tax_lines,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(invoice.id.as_uuid())
        .bind(invoice.tenant_id.as_uuid())
        .bind(invoice.cycle_id.as_uuid())
        .bind(invoice.status.as_str())
        .bind(invoice.currency.as_str())
        .bind(invoice.subtotal.as_minor())
        .bind(invoice.tax.as_minor())
        .bind(invoice.total.as_minor())
        .bind(&invoice.number)
        .bind(invoice.issued_at)
        .bind(items)
        .bind(tax_lines)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "upsert_invoice".to_string(),
            source: Box::new(e),
        })?;

        Ok(())
    }

    async fn get(&self, id: &InvoiceId) -> Result<Invoice> {
        let row = sqlx::query(
            r#"
            SELECT invoice_id, tenant_id, cycle_id, status, currency,
                   subtotal_minor, tax_minor, total_minor, number, issued_at,
                   items, tax_lines, created_at, updated_at
            FROM billing.invoices
            WHERE invoice_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "get_invoice".to_string(),
            source: Box::new(e),
        })?
        .ok_or_else(|| BillingError::InvoiceNotFound { id: id.to_string() })?;

        Self::row_to_invoice(&row)
    }

    async fn get_by_cycle(&self, cycle_id: &CycleId) -> Result<Option<Invoice>> {
        let row = sqlx::query(
            r#"
            SELECT invoice_id, tenant_id, cycle_id, status, currency,
                   subtotal_minor, tax_minor, total_minor, number, issued_at,
                   items, tax_lines, created_at, updated_at
            FROM billing.invoices
            WHERE cycle_id = $1
            "#,
        )
        .bind(cycle_id.as_uuid())
        .fetch_optional(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "get_invoice_by_cycle".to_string(),
            source: Box::new(e),
        })?;

        row.as_ref().map(Self::row_to_invoice).transpose()
    }

    async fn next_sequence(&self, tenant_id: &TenantId) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO billing.invoice_sequences (tenant_id, value)
            VALUES ($1, 1)
            ON CONFLICT (tenant_id)
                DO UPDATE SET value = invoice_sequences.value + 1
            RETURNING value
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "next_invoice_sequence".to_string(),
            source: Box::new(e),
        })?;

        Ok(row.get("value"))
    }
}
