use crate::domain::ledger::{LedgerEntry, LedgerEntryLine};
use crate::domain::types::{EntryId, InvoiceId, TenantId};
use crate::error::{BillingError, Result};
use crate::storage::postgres::PgConnection;
use async_trait::async_trait;
use sqlx::Row;
use std::sync::Arc;

/// Append-only store for double-entry transactions. Entries are never
/// updated or deleted; corrections are posted as reversals.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn post(&self, entry: &LedgerEntry) -> Result<()>;
    async fn entries_for_invoice(&self, invoice_id: &InvoiceId) -> Result<Vec<LedgerEntry>>;
}

pub struct SqlLedgerRepository {
    connection: Arc<PgConnection>,
}

impl SqlLedgerRepository {
    pub fn new(connection: Arc<PgConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl LedgerRepository for SqlLedgerRepository {
    async fn post(&self, entry: &LedgerEntry) -> Result<()> {
        let lines = serde_json::to_value(&entry.lines).map_err(|e| {
            BillingError::DatabaseError {
                operation: "encode_ledger_lines".to_string(),
                source: Box::new(e),
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO billing.ledger_entries
                (entry_id, tenant_id, invoice_id, description, posted_at, lines)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.tenant_id.as_uuid())
        .bind(entry.invoice_id.map(|i| i.as_uuid()))
        .bind(&entry.description)
        .bind(entry.posted_at)
        .bind(lines)
        .execute(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "post_ledger_entry".to_string(),
            source: Box::new(e),
        })?;

        Ok(())
    }

    async fn entries_for_invoice(&self, invoice_id: &InvoiceId) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, tenant_id, invoice_id, description, posted_at, lines
            FROM billing.ledger_entries
            WHERE invoice_id = $1
            ORDER BY posted_at ASC
            "#,
        )
        .bind(invoice_id.as_uuid())
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "entries_for_invoice".to_string(),
            source: Box::new(e),
        })?;

        rows.iter()
            .map(|row| {
                let lines: Vec<LedgerEntryLine> = serde_json::from_value(row.get("lines"))
                    .map_err(|e| BillingError::DatabaseError {
                        operation: "decode_ledger_lines".to_string(),
                        source: Box::new(e),
                    })?;
                Ok(LedgerEntry {
                    id: EntryId::from_uuid(row.get("entry_id")),
                    tenant_id: TenantId::from_uuid(row.get("tenant_id")),
                    invoice_id: row
                        .get::<Option<uuid::Uuid>, _>("invoice_id")
                        .map(InvoiceId::from_uuid),
                    description: row.get("description"),
                    posted_at: row.get("posted_at"),
                    lines,
                })
            })
            .collect()
    }
}
