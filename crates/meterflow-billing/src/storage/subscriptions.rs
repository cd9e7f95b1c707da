use crate::domain::subscription::{CollectionMode, Subscription, SubscriptionItem, SubscriptionStatus};
use crate::domain::types::{
    BillingInterval, Currency, IntervalUnit, SubscriptionId, TenantId,
};
use crate::error::{BillingError, Result};
use crate::storage::postgres::PgConnection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;

/// Read-only view of the subscription catalog. The engine never writes
/// subscriptions; it only selects what is billable.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn get(&self, id: &SubscriptionId) -> Result<Subscription>;
    async fn active_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>>;
}

pub struct SqlSubscriptionRepository {
    connection: Arc<PgConnection>,
}

impl SqlSubscriptionRepository {
    pub fn new(connection: Arc<PgConnection>) -> Self {
        Self { connection }
    }

    fn row_to_subscription(row: &sqlx::postgres::PgRow) -> Result<Subscription> {
        let items: Vec<SubscriptionItem> =
            serde_json::from_value(row.get("items")).map_err(|e| BillingError::DatabaseError {
                operation: "decode_subscription_items".to_string(),
                source: Box::new(e),
            })?;

        let unit = match row.get::<String, _>("interval_unit").as_str() {
            "day" => IntervalUnit::Day,
            "week" => IntervalUnit::Week,
            "year" => IntervalUnit::Year,
            _ => IntervalUnit::Month,
        };

        let collection_mode = match row.get::<String, _>("collection_mode").as_str() {
            "send_invoice" => CollectionMode::SendInvoice,
            _ => CollectionMode::ChargeAutomatically,
        };

        Ok(Subscription {
            id: SubscriptionId::from_uuid(row.get("subscription_id")),
            tenant_id: TenantId::from_uuid(row.get("tenant_id")),
            status: SubscriptionStatus::from_string(&row.get::<String, _>("status")),
            currency: Currency::new(row.get::<String, _>("currency")),
            interval: BillingInterval::new(unit, row.get::<i32, _>("interval_count") as u32),
            collection_mode,
            start_at: row.get("start_at"),
            items,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl SubscriptionRepository for SqlSubscriptionRepository {
    async fn get(&self, id: &SubscriptionId) -> Result<Subscription> {
        let row = sqlx::query(
            r#"
            SELECT subscription_id, tenant_id, status, currency, interval_unit,
                   interval_count, collection_mode, start_at, items, created_at, updated_at
            FROM billing.subscriptions
            WHERE subscription_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "get_subscription".to_string(),
            source: Box::new(e),
        })?
        .ok_or_else(|| BillingError::SubscriptionNotFound { id: id.to_string() })?;

        Self::row_to_subscription(&row)
    }

    async fn active_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            r#"
            SELECT subscription_id, tenant_id, status, currency, interval_unit,
                   interval_count, collection_mode, start_at, items, created_at, updated_at
            FROM billing.subscriptions
            WHERE status = 'active' AND start_at <= $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "active_subscriptions".to_string(),
            source: Box::new(e),
        })?;

        rows.iter().map(Self::row_to_subscription).collect()
    }
}
