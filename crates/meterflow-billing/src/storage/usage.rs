use crate::domain::types::{MeterCode, SubscriptionItemId};
use crate::error::{BillingError, Result};
use crate::storage::postgres::PgConnection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;
use uuid::Uuid;

/// An ingested usage event. Events are immutable: rating only ever reads
/// them, which is what makes usage re-aggregation naturally idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_id: Uuid,
    /// Dedupe key assigned by the ingestion layer; the same key is never
    /// rated twice.
    pub idempotency_key: String,
    pub meter_code: MeterCode,
    pub subscription_item_id: SubscriptionItemId,
    pub quantity: Decimal,
    pub recorded_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        idempotency_key: impl Into<String>,
        meter_code: MeterCode,
        subscription_item_id: SubscriptionItemId,
        quantity: Decimal,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            idempotency_key: idempotency_key.into(),
            meter_code,
            subscription_item_id,
            quantity,
            recorded_at,
        }
    }
}

/// Read side of the immutable usage log.
#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Sum of event quantities for a meter and subscription item with
    /// `recorded_at` inside the half-open window `[start, end)`.
    async fn sum_quantity(
        &self,
        meter: &MeterCode,
        item: &SubscriptionItemId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Decimal>;

    /// Append an already-admitted event. Duplicate idempotency keys are
    /// ignored, matching the ingestion layer's dedupe guarantee.
    async fn record(&self, event: UsageEvent) -> Result<()>;
}

pub struct SqlUsageRepository {
    connection: Arc<PgConnection>,
}

impl SqlUsageRepository {
    pub fn new(connection: Arc<PgConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl UsageRepository for SqlUsageRepository {
    async fn sum_quantity(
        &self,
        meter: &MeterCode,
        item: &SubscriptionItemId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Decimal> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(quantity), 0) AS total
            FROM billing.usage_events
            WHERE meter_code = $1
                AND subscription_item_id = $2
                AND recorded_at >= $3
                AND recorded_at < $4
            "#,
        )
        .bind(meter.as_str())
        .bind(item.as_uuid())
        .bind(start)
        .bind(end)
        .fetch_one(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "sum_quantity".to_string(),
            source: Box::new(e),
        })?;

        Ok(row.get("total"))
    }

    async fn record(&self, event: UsageEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing.usage_events
                (event_id, idempotency_key, meter_code, subscription_item_id, quantity, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(&event.idempotency_key)
        .bind(event.meter_code.as_str())
        .bind(event.subscription_item_id.as_uuid())
        .bind(event.quantity)
        .bind(event.recorded_at)
        .execute(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "record_usage_event".to_string(),
            source: Box::new(e),
        })?;

        Ok(())
    }
}
