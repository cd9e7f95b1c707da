use crate::domain::rating::RatingResult;
use crate::domain::subscription::BillingMode;
use crate::domain::types::{Amount, Currency, CycleId, MeterCode, SubscriptionItemId};
use crate::error::{BillingError, Result};
use crate::storage::postgres::PgConnection;
use async_trait::async_trait;
use sqlx::Row;
use std::sync::Arc;

/// Store for rated line items. Rows are keyed `(cycle_id, item_id)` and
/// written as upserts, never plain inserts, so re-rating a cycle after a
/// partial failure overwrites instead of duplicating.
#[async_trait]
pub trait RatingRepository: Send + Sync {
    async fn upsert_results(&self, results: &[RatingResult]) -> Result<()>;
    async fn results_for_cycle(&self, cycle_id: &CycleId) -> Result<Vec<RatingResult>>;
}

pub struct SqlRatingRepository {
    connection: Arc<PgConnection>,
}

impl SqlRatingRepository {
    pub fn new(connection: Arc<PgConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl RatingRepository for SqlRatingRepository {
    async fn upsert_results(&self, results: &[RatingResult]) -> Result<()> {
        let mut tx = self
            .connection
            .pool()
            .begin()
            .await
            .map_err(|e| BillingError::DatabaseError {
                operation: "begin_upsert_rating_results".to_string(),
                source: Box::new(e),
            })?;

        for result in results {
            sqlx::query(
                r#"
                INSERT INTO billing.rating_results
                    (cycle_id, subscription_item_id, billing_mode, meter_code,
                     currency, quantity, unit_amount, amount_minor, rated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (cycle_id, subscription_item_id) DO UPDATE SET
                    billing_mode = EXCLUDED.billing_mode,
                    meter_code = EXCLUDED.meter_code,
                    currency = EXCLUDED.currency,
                    quantity = EXCLUDED.quantity,
                    unit_amount = EXCLUDED.unit_amount,
                    amount_minor = EXCLUDED.amount_minor,
                    rated_at = EXCLUDED.rated_at
                "#,
            )
            .bind(result.cycle_id.as_uuid())
            .bind(result.subscription_item_id.as_uuid())
            .bind(result.billing_mode.as_str())
            .bind(result.meter_code.as_ref().map(|m| m.as_str().to_string()))
            .bind(result.currency.as_str())
            .bind(result.quantity)
            .bind(result.unit_amount)
            .bind(result.amount.as_minor())
            .bind(result.rated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::DatabaseError {
                operation: "upsert_rating_result".to_string(),
                source: Box::new(e),
            })?;
        }

        tx.commit().await.map_err(|e| BillingError::DatabaseError {
            operation: "commit_upsert_rating_results".to_string(),
            source: Box::new(e),
        })?;

        Ok(())
    }

    async fn results_for_cycle(&self, cycle_id: &CycleId) -> Result<Vec<RatingResult>> {
        let rows = sqlx::query(
            r#"
            SELECT cycle_id, subscription_item_id, billing_mode, meter_code,
                   currency, quantity, unit_amount, amount_minor, rated_at
            FROM billing.rating_results
            WHERE cycle_id = $1
            ORDER BY subscription_item_id ASC
            "#,
        )
        .bind(cycle_id.as_uuid())
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "results_for_cycle".to_string(),
            source: Box::new(e),
        })?;

        Ok(rows
            .iter()
            .map(|row| RatingResult {
                cycle_id: CycleId::from_uuid(row.get("cycle_id")),
                subscription_item_id: SubscriptionItemId::from_uuid(
                    row.get("subscription_item_id"),
                ),
                billing_mode: match row.get::<String, _>("billing_mode").as_str() {
                    "metered" => BillingMode::Metered,
                    _ => BillingMode::Licensed,
                },
                meter_code: row
                    .get::<Option<String>, _>("meter_code")
                    .map(MeterCode::new),
                currency: Currency::new(row.get::<String, _>("currency")),
                quantity: row.get("quantity"),
                unit_amount: row.get("unit_amount"),
                amount: Amount::from_minor(row.get("amount_minor")),
                rated_at: row.get("rated_at"),
            })
            .collect())
    }
}
