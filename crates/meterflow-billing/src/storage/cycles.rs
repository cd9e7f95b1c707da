use crate::domain::cycle::BillingCycle;
use crate::domain::types::{CycleId, CycleState, SubscriptionId, TenantId};
use crate::error::{BillingError, Result};
use crate::storage::postgres::PgConnection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;
use tracing::debug;

/// Store for the billing-cycle state machine.
///
/// `transition_if_state` is the only concurrency primitive the engine
/// relies on: a transition from A to B succeeds only if the stored state
/// is still A at write time, so concurrent scheduler instances race on
/// the conditional write instead of an external lock. A caller that
/// loses the race treats the cycle as handled elsewhere and moves on.
#[async_trait]
pub trait CycleRepository: Send + Sync {
    async fn insert(&self, cycle: &BillingCycle) -> Result<()>;
    async fn get(&self, id: &CycleId) -> Result<BillingCycle>;

    /// The subscription's most recent cycle by period_start, if any.
    async fn latest_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<BillingCycle>>;

    /// OPEN cycles whose period has ended.
    async fn due_for_close(&self, now: DateTime<Utc>) -> Result<Vec<CycleId>>;

    async fn cycles_in_state(&self, state: CycleState) -> Result<Vec<BillingCycle>>;

    /// ERROR cycles last touched at or before `cutoff` whose error_count
    /// has not passed `ceiling`; the recovery sweep's work list.
    async fn recoverable(&self, cutoff: DateTime<Utc>, ceiling: u32) -> Result<Vec<BillingCycle>>;

    /// Conditional write: move the cycle from `expected` to `next` only
    /// if its stored state is still `expected`. Returns whether this
    /// caller won the write. Illegal state pairs are rejected outright.
    async fn transition_if_state(
        &self,
        id: &CycleId,
        expected: CycleState,
        next: CycleState,
    ) -> Result<bool>;

    /// Mark the cycle ERROR and bump its error count; returns the new
    /// count.
    async fn record_error(&self, id: &CycleId) -> Result<u32>;

    // Testing-only mutations, reachable solely through the gated
    // operational surface.
    async fn set_period_end(&self, id: &CycleId, period_end: DateTime<Utc>) -> Result<()>;
    async fn force_reopen(&self, id: &CycleId) -> Result<()>;
    async fn reset_error_count(&self, id: &CycleId) -> Result<()>;
}

pub struct SqlCycleRepository {
    connection: Arc<PgConnection>,
}

impl SqlCycleRepository {
    pub fn new(connection: Arc<PgConnection>) -> Self {
        Self { connection }
    }

    fn row_to_cycle(row: &sqlx::postgres::PgRow) -> BillingCycle {
        BillingCycle {
            id: CycleId::from_uuid(row.get("cycle_id")),
            tenant_id: TenantId::from_uuid(row.get("tenant_id")),
            subscription_id: SubscriptionId::from_uuid(row.get("subscription_id")),
            period_start: row.get("period_start"),
            period_end: row.get("period_end"),
            state: CycleState::from_string(&row.get::<String, _>("state")),
            error_count: row.get::<i32, _>("error_count") as u32,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

const CYCLE_COLUMNS: &str = "cycle_id, tenant_id, subscription_id, period_start, period_end, \
                             state, error_count, created_at, updated_at";

#[async_trait]
impl CycleRepository for SqlCycleRepository {
    async fn insert(&self, cycle: &BillingCycle) -> Result<()> {
        // Concurrent ensure jobs race on the per-subscription period
        // uniqueness; the loser's insert is a no-op.
        sqlx::query(
            r#"
            INSERT INTO billing.billing_cycles
                (cycle_id, tenant_id, subscription_id, period_start, period_end,
                 state, error_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (subscription_id, period_start) DO NOTHING
            "#,
        )
        .bind(cycle.id.as_uuid())
        .bind(cycle.tenant_id.as_uuid())
        .bind(cycle.subscription_id.as_uuid())
        .bind(cycle.period_start)
        .bind(cycle.period_end)
        .bind(cycle.state.as_str())
        .bind(cycle.error_count as i32)
        .bind(cycle.created_at)
        .bind(cycle.updated_at)
        .execute(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "insert_cycle".to_string(),
            source: Box::new(e),
        })?;

        Ok(())
    }

    async fn get(&self, id: &CycleId) -> Result<BillingCycle> {
        let row = sqlx::query(&format!(
            "SELECT {CYCLE_COLUMNS} FROM billing.billing_cycles WHERE cycle_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "get_cycle".to_string(),
            source: Box::new(e),
        })?
        .ok_or_else(|| BillingError::CycleNotFound { id: id.to_string() })?;

        Ok(Self::row_to_cycle(&row))
    }

    async fn latest_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<BillingCycle>> {
        let row = sqlx::query(&format!(
            "SELECT {CYCLE_COLUMNS} FROM billing.billing_cycles \
             WHERE subscription_id = $1 ORDER BY period_start DESC LIMIT 1"
        ))
        .bind(subscription_id.as_uuid())
        .fetch_optional(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "latest_cycle_for_subscription".to_string(),
            source: Box::new(e),
        })?;

        Ok(row.as_ref().map(Self::row_to_cycle))
    }

    async fn due_for_close(&self, now: DateTime<Utc>) -> Result<Vec<CycleId>> {
        let rows = sqlx::query(
            r#"
            SELECT cycle_id FROM billing.billing_cycles
            WHERE state = 'open' AND period_end <= $1
            ORDER BY period_end ASC
            "#,
        )
        .bind(now)
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "due_for_close".to_string(),
            source: Box::new(e),
        })?;

        Ok(rows
            .iter()
            .map(|r| CycleId::from_uuid(r.get("cycle_id")))
            .collect())
    }

    async fn cycles_in_state(&self, state: CycleState) -> Result<Vec<BillingCycle>> {
        let rows = sqlx::query(&format!(
            "SELECT {CYCLE_COLUMNS} FROM billing.billing_cycles \
             WHERE state = $1 ORDER BY period_end ASC"
        ))
        .bind(state.as_str())
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "cycles_in_state".to_string(),
            source: Box::new(e),
        })?;

        Ok(rows.iter().map(Self::row_to_cycle).collect())
    }

    async fn recoverable(&self, cutoff: DateTime<Utc>, ceiling: u32) -> Result<Vec<BillingCycle>> {
        let rows = sqlx::query(&format!(
            "SELECT {CYCLE_COLUMNS} FROM billing.billing_cycles \
             WHERE state = 'error' AND updated_at <= $1 AND error_count <= $2 \
             ORDER BY updated_at ASC"
        ))
        .bind(cutoff)
        .bind(ceiling as i32)
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "recoverable_cycles".to_string(),
            source: Box::new(e),
        })?;

        Ok(rows.iter().map(Self::row_to_cycle).collect())
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

        let result = sqlx::query(
            r#"
            UPDATE billing.billing_cycles
            SET state = $3, updated_at = NOW()
            WHERE cycle_id = $1 AND state = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "transition_cycle".to_string(),
            source: Box::new(e),
        })?;

        let won = result.rows_affected() == 1;
        if !won {
            debug!(cycle_id = %id, %expected, %next, "lost cycle state transition");
        }
        Ok(won)
    }

    async fn record_error(&self, id: &CycleId) -> Result<u32> {
        let row = sqlx::query(
            r#"
            UPDATE billing.billing_cycles
            SET state = 'error', error_count = error_count + 1, updated_at = NOW()
            WHERE cycle_id = $1
            RETURNING error_count
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "record_cycle_error".to_string(),
            source: Box::new(e),
        })?
        .ok_or_else(|| BillingError::CycleNotFound { id: id.to_string() })?;

        Ok(row.get::<i32, _>("error_count") as u32)
    }

    async fn set_period_end(&self, id: &CycleId, period_end: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE billing.billing_cycles
            SET period_end = $2, updated_at = NOW()
            WHERE cycle_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(period_end)
        .execute(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "set_cycle_period_end".to_string(),
            source: Box::new(e),
        })?;

        if result.rows_affected() == 0 {
            return Err(BillingError::CycleNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn force_reopen(&self, id: &CycleId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE billing.billing_cycles
            SET state = 'open', updated_at = NOW()
            WHERE cycle_id = $1 AND state = 'closed'
            "#,
        )
        .bind(id.as_uuid())
        .execute(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "force_reopen_cycle".to_string(),
            source: Box::new(e),
        })?;

        if result.rows_affected() == 0 {
            return Err(BillingError::InvalidStateTransition {
                from: "non-closed".to_string(),
                to: CycleState::Open.to_string(),
            });
        }
        Ok(())
    }

    async fn reset_error_count(&self, id: &CycleId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE billing.billing_cycles
            SET error_count = 0, updated_at = NOW()
            WHERE cycle_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .execute(self.connection.pool())
        .await
        .map_err(|e| BillingError::DatabaseError {
            operation: "reset_cycle_error_count".to_string(),
            source: Box::new(e),
        })?;

        if result.rows_affected() == 0 {
            return Err(BillingError::CycleNotFound { id: id.to_string() });
        }
        Ok(())
    }
}
