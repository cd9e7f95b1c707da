use crate::config::SchedulerConfig;
use crate::domain::cycle::BillingCycle;
use crate::domain::types::{CycleId, CycleState};
use crate::engine::invoicing::InvoicingOperations;
use crate::engine::rating::RatingOperations;
use crate::error::{BillingError, Result};
use crate::storage::cycles::CycleRepository;
use crate::storage::subscriptions::SubscriptionRepository;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// The scheduler's jobs, in tick order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    EnsureCycles,
    CloseCycles,
    Rating,
    Invoicing,
    RecoverySweep,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::EnsureCycles => "ensure_cycles",
            JobKind::CloseCycles => "close_cycles",
            JobKind::Rating => "rating",
            JobKind::Invoicing => "invoicing",
            JobKind::RecoverySweep => "recovery_sweep",
        }
    }
}

/// Per-job outcome of one tick. Failures are per-cycle: one bad cycle
/// never blocks the rest of the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobReport {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub errors: Vec<String>,
}

impl JobReport {
    fn success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    fn skipped(&mut self) {
        self.processed += 1;
    }

    fn failure(&mut self, context: &str, err: &BillingError) {
        self.processed += 1;
        self.failed += 1;
        self.errors.push(format!("{context}: {err}"));
    }
}

/// Aggregate outcome of one scheduler tick, surfaced by the manual
/// run-once trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ensure: JobReport,
    pub close: JobReport,
    pub rating: JobReport,
    pub invoicing: JobReport,
    pub recovery: JobReport,
}

impl TickReport {
    pub fn total_failed(&self) -> u32 {
        self.ensure.failed
            + self.close.failed
            + self.rating.failed
            + self.invoicing.failed
            + self.recovery.failed
    }
}

/// The billing orchestration loop.
///
/// One tick runs Ensure, Close, Rating, Invoicing and Recovery in order,
/// each job idempotent on its own. Several scheduler processes may run
/// the same tick concurrently: every cycle mutation goes through the
/// cycle store's conditional writes, so workers race on those instead of
/// holding a lock, and a lost write just means another worker got there
/// first.
pub struct Scheduler {
    cycles: Arc<dyn CycleRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    rating: Arc<dyn RatingOperations>,
    invoicing: Arc<dyn InvoicingOperations>,
    config: SchedulerConfig,
    is_running: Arc<RwLock<bool>>,
}

impl Scheduler {
    pub fn new(
        cycles: Arc<dyn CycleRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        rating: Arc<dyn RatingOperations>,
        invoicing: Arc<dyn InvoicingOperations>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            cycles,
            subscriptions,
            rating,
            invoicing,
            config,
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// Spawn the tick loop. Fails if the scheduler is already running.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.is_running.write().await;
        if *running {
            return Err(BillingError::InvalidState {
                message: "scheduler is already running".to_string(),
            });
        }
        *running = true;
        drop(running);

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.tick_loop().await;
        });

        info!("billing scheduler started");
        Ok(())
    }

    /// Cooperative stop: the flag is only checked between ticks, so a
    /// tick in progress always finishes (or fails) its current cycle
    /// cleanly before the loop exits.
    pub async fn stop(&self) {
        let mut running = self.is_running.write().await;
        *running = false;

        info!("billing scheduler stopped");
    }

    async fn tick_loop(&self) {
        let mut ticker = interval(StdDuration::from_secs(self.config.tick_interval_seconds));

        while *self.is_running.read().await {
            ticker.tick().await;

            let report = self.run_once().await;
            if report.total_failed() > 0 {
                warn!(failed = report.total_failed(), "scheduler tick had failures");
            }
        }
    }

    /// One full tick. Every job continues past failures of individual
    /// cycles; nothing here panics the process.
    pub async fn run_once(&self) -> TickReport {
        let started_at = Utc::now();

        let ensure = self.ensure_cycles_job().await;
        let close = self.close_cycles_job().await;
        let rating = self.rating_job().await;
        let invoicing = self.invoicing_job().await;
        let recovery = self.recovery_sweep_job().await;

        let report = TickReport {
            started_at,
            finished_at: Utc::now(),
            ensure,
            close,
            rating,
            invoicing,
            recovery,
        };

        info!(
            ensured = report.ensure.succeeded,
            closed = report.close.succeeded,
            rated = report.rating.succeeded,
            invoiced = report.invoicing.succeeded,
            recovered = report.recovery.succeeded,
            failed = report.total_failed(),
            "scheduler tick complete"
        );
        report
    }

    pub async fn run_job(&self, kind: JobKind) -> JobReport {
        debug!(job = kind.as_str(), "running billing job");
        match kind {
            JobKind::EnsureCycles => self.ensure_cycles_job().await,
            JobKind::CloseCycles => self.close_cycles_job().await,
            JobKind::Rating => self.rating_job().await,
            JobKind::Invoicing => self.invoicing_job().await,
            JobKind::RecoverySweep => self.recovery_sweep_job().await,
        }
    }

    /// Create or advance the current cycle of every active subscription.
    /// The next cycle is only created once the previous one is CLOSED,
    /// keeping at most one non-CLOSED cycle per subscription.
    async fn ensure_cycles_job(&self) -> JobReport {
        let mut report = JobReport::default();
        let now = Utc::now();

        let subscriptions = match self.subscriptions.active_subscriptions(now).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!("failed to list active subscriptions: {e}");
                report.failure("active_subscriptions", &e);
                return report;
            }
        };

        for subscription in subscriptions {
            if !subscription.status.is_billable() {
                continue;
            }

            let next = match self.cycles.latest_for_subscription(&subscription.id).await {
                Ok(None) => Some(BillingCycle::first(&subscription)),
                Ok(Some(latest)) if latest.state == CycleState::Closed => {
                    Some(BillingCycle::following(&subscription, &latest))
                }
                Ok(Some(_)) => None,
                Err(e) => {
                    report.failure(&format!("subscription {}", subscription.id), &e);
                    continue;
                }
            };

            match next {
                Some(cycle) => match self.cycles.insert(&cycle).await {
                    Ok(()) => {
                        debug!(
                            subscription_id = %subscription.id,
                            cycle_id = %cycle.id,
                            period_start = %cycle.period_start,
                            period_end = %cycle.period_end,
                            "opened billing cycle"
                        );
                        report.success();
                    }
                    Err(e) => report.failure(&format!("subscription {}", subscription.id), &e),
                },
                None => report.skipped(),
            }
        }

        report
    }

    /// Flip due OPEN cycles to CLOSING. Only CAS winners proceed.
    async fn close_cycles_job(&self) -> JobReport {
        let mut report = JobReport::default();
        let now = Utc::now();

        let due = match self.cycles.due_for_close(now).await {
            Ok(due) => due,
            Err(e) => {
                report.failure("due_for_close", &e);
                return report;
            }
        };

        for cycle_id in due {
            match self
                .cycles
                .transition_if_state(&cycle_id, CycleState::Open, CycleState::Closing)
                .await
            {
                Ok(true) => report.success(),
                Ok(false) => report.skipped(),
                Err(e) => report.failure(&format!("cycle {cycle_id}"), &e),
            }
        }

        report
    }

    /// Rate CLOSING cycles that do not yet have complete rating results.
    async fn rating_job(&self) -> JobReport {
        let mut report = JobReport::default();

        let closing = match self.cycles.cycles_in_state(CycleState::Closing).await {
            Ok(closing) => closing,
            Err(e) => {
                report.failure("cycles_in_state", &e);
                return report;
            }
        };

        for cycle in closing {
            match self.rating.has_complete_results(&cycle.id).await {
                Ok(true) => {
                    report.skipped();
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    report.failure(&format!("cycle {}", cycle.id), &e);
                    continue;
                }
            }

            match self.rating.rate(&cycle.id).await {
                Ok(()) => report.success(),
                Err(e) => self.fail_cycle(&mut report, &cycle.id, e).await,
            }
        }

        report
    }

    /// Invoice CLOSING cycles whose rating results are complete; success
    /// leaves the cycle CLOSED.
    async fn invoicing_job(&self) -> JobReport {
        let mut report = JobReport::default();

        let closing = match self.cycles.cycles_in_state(CycleState::Closing).await {
            Ok(closing) => closing,
            Err(e) => {
                report.failure("cycles_in_state", &e);
                return report;
            }
        };

        for cycle in closing {
            match self.rating.has_complete_results(&cycle.id).await {
                Ok(false) => {
                    report.skipped();
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    report.failure(&format!("cycle {}", cycle.id), &e);
                    continue;
                }
            }

            match self.invoicing.invoice(&cycle.id).await {
                Ok(()) => report.success(),
                Err(e) => self.fail_cycle(&mut report, &cycle.id, e).await,
            }
        }

        report
    }

    /// Retry ERROR cycles past the grace period by moving them back to
    /// CLOSING and re-running rating and invoicing. Cycles over the
    /// error-count ceiling are excluded from the work list and stay put
    /// for manual intervention.
    async fn recovery_sweep_job(&self) -> JobReport {
        let mut report = JobReport::default();
        let cutoff = Utc::now() - Duration::seconds(self.config.recovery_grace_seconds);

        let stuck = match self
            .cycles
            .recoverable(cutoff, self.config.error_count_ceiling)
            .await
        {
            Ok(stuck) => stuck,
            Err(e) => {
                report.failure("recoverable", &e);
                return report;
            }
        };

        for cycle in stuck {
            let won = match self
                .cycles
                .transition_if_state(&cycle.id, CycleState::Error, CycleState::Closing)
                .await
            {
                Ok(won) => won,
                Err(e) => {
                    report.failure(&format!("cycle {}", cycle.id), &e);
                    continue;
                }
            };
            if !won {
                report.skipped();
                continue;
            }

            let outcome = async {
                if !self.rating.has_complete_results(&cycle.id).await? {
                    self.rating.rate(&cycle.id).await?;
                }
                self.invoicing.invoice(&cycle.id).await
            }
            .await;

            match outcome {
                Ok(()) => {
                    info!(cycle_id = %cycle.id, "recovered billing cycle");
                    report.success();
                }
                Err(e) => self.fail_cycle(&mut report, &cycle.id, e).await,
            }
        }

        report
    }

    async fn fail_cycle(&self, report: &mut JobReport, cycle_id: &CycleId, err: BillingError) {
        error!(cycle_id = %cycle_id, "billing job failed: {err}");
        if let Err(record_err) = self.cycles.record_error(cycle_id).await {
            error!(cycle_id = %cycle_id, "failed to record cycle error: {record_err}");
        }
        report.failure(&format!("cycle {cycle_id}"), &err);
    }
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            cycles: self.cycles.clone(),
            subscriptions: self.subscriptions.clone(),
            rating: self.rating.clone(),
            invoicing: self.invoicing.clone(),
            config: self.config.clone(),
            is_running: self.is_running.clone(),
        }
    }
}
