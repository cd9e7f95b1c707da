use crate::domain::types::{CycleId, CycleState, Environment, SubscriptionId};
use crate::error::{BillingError, Result};
use crate::scheduler::{JobKind, JobReport, Scheduler, TickReport};
use crate::storage::cycles::CycleRepository;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Introspection view of a billing cycle for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleStatusView {
    pub cycle_id: CycleId,
    pub subscription_id: SubscriptionId,
    pub state: CycleState,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub seconds_until_end: i64,
    pub can_close: bool,
    pub error_count: u32,
}

/// Operational surface over the engine: manual triggers, cycle
/// introspection, and the testing-only mutations. The mutations bypass
/// the state machine's normal transitions, so they are refused outright
/// in production.
pub struct BillingOps {
    scheduler: Arc<Scheduler>,
    cycles: Arc<dyn CycleRepository>,
    environment: Environment,
}

impl BillingOps {
    pub fn new(
        scheduler: Arc<Scheduler>,
        cycles: Arc<dyn CycleRepository>,
        environment: Environment,
    ) -> Self {
        Self {
            scheduler,
            cycles,
            environment,
        }
    }

    /// Manual tick, returning the aggregate per-job report.
    pub async fn run_once(&self) -> TickReport {
        self.scheduler.run_once().await
    }

    pub async fn run_job(&self, kind: JobKind) -> JobReport {
        self.scheduler.run_job(kind).await
    }

    pub async fn cycle_status(&self, cycle_id: &CycleId) -> Result<CycleStatusView> {
        let cycle = self.cycles.get(cycle_id).await?;
        let now = Utc::now();
        Ok(CycleStatusView {
            cycle_id: cycle.id,
            subscription_id: cycle.subscription_id,
            state: cycle.state,
            period_start: cycle.period_start,
            period_end: cycle.period_end,
            seconds_until_end: cycle.seconds_until_end(now),
            can_close: cycle.can_close(now),
            error_count: cycle.error_count,
        })
    }

    /// Testing only: pull a cycle's period end forward so it becomes due.
    pub async fn fast_forward(&self, cycle_id: &CycleId, period_end: DateTime<Utc>) -> Result<()> {
        self.guard("fast_forward")?;
        warn!(cycle_id = %cycle_id, %period_end, "fast-forwarding cycle period end");
        self.cycles.set_period_end(cycle_id, period_end).await
    }

    /// Testing only: reopen a CLOSED cycle.
    pub async fn force_reopen(&self, cycle_id: &CycleId) -> Result<()> {
        self.guard("force_reopen")?;
        warn!(cycle_id = %cycle_id, "force-reopening closed cycle");
        self.cycles.force_reopen(cycle_id).await
    }

    /// Testing only: clear a cycle's error count.
    pub async fn reset_errors(&self, cycle_id: &CycleId) -> Result<()> {
        self.guard("reset_errors")?;
        warn!(cycle_id = %cycle_id, "resetting cycle error count");
        self.cycles.reset_error_count(cycle_id).await
    }

    fn guard(&self, operation: &str) -> Result<()> {
        if self.environment.is_production() {
            return Err(BillingError::ProductionOperation {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}
