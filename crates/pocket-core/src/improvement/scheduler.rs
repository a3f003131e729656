//! Maintenance Scheduler - Background task for the self-improvement pass
//!
//! Runs the review every `period` (4 hours by default), skips a tick when the
//! run constraint says the device should be left alone, and retries a failed
//! pass with exponential backoff. Stops on its cancellation token.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HealthSummary, SelfImprovementLoop};
use crate::retry::{calculate_delay, classify_error, RetryConfig};

/// Gate checked before every run (e.g. battery not low)
pub trait RunConstraint: Send + Sync {
    fn allows_run(&self) -> bool;
}

/// No constraint
pub struct AlwaysRun;

impl RunConstraint for AlwaysRun {
    fn allows_run(&self) -> bool {
        true
    }
}

/// The blocking pass the scheduler drives
pub trait MaintenanceJob: Send + Sync + 'static {
    fn run(&self) -> Result<HealthSummary>;
}

impl MaintenanceJob for SelfImprovementLoop {
    fn run(&self) -> Result<HealthSummary> {
        self.run_once()
    }
}

/// Result of one scheduled cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(HealthSummary),
    /// The run constraint was not met
    Skipped,
    /// Every allowed attempt failed; the next tick tries again
    Failed(String),
    Cancelled,
}

pub struct MaintenanceScheduler {
    job: Arc<dyn MaintenanceJob>,
    constraint: Arc<dyn RunConstraint>,
    period: Duration,
    retry: RetryConfig,
    shutdown_token: CancellationToken,
}

impl MaintenanceScheduler {
    pub fn new(job: Arc<dyn MaintenanceJob>, period: Duration) -> Self {
        Self {
            job,
            constraint: Arc::new(AlwaysRun),
            period,
            retry: RetryConfig::default(),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: Arc<dyn RunConstraint>) -> Self {
        self.constraint = constraint;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Stop the scheduler when `token` (or a parent of it) is cancelled
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = token;
        self
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the scheduler background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Tick loop with graceful shutdown. The first run happens one period
    /// after start.
    async fn run(&self) {
        info!(
            period_secs = self.period.as_secs(),
            max_attempts = self.retry.max_attempts,
            "Starting maintenance scheduler"
        );

        let mut tick = interval_at(Instant::now() + self.period, self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.run_cycle().await == CycleOutcome::Cancelled {
                        break;
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping maintenance scheduler");
                    break;
                }
            }
        }

        info!("Maintenance scheduler stopped");
    }

    /// One cycle: constraint check, then up to `max_attempts` runs with backoff
    pub async fn run_cycle(&self) -> CycleOutcome {
        let mut attempt = 0;
        loop {
            if !self.constraint.allows_run() {
                info!("Run constraint not met, skipping maintenance cycle");
                return CycleOutcome::Skipped;
            }

            debug!("Running maintenance cycle (attempt {})", attempt + 1);
            let job = Arc::clone(&self.job);
            let error = match tokio::task::spawn_blocking(move || job.run()).await {
                Ok(Ok(summary)) => return CycleOutcome::Completed(summary),
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("maintenance task aborted: {}", e),
            };

            let kind = classify_error(&error);
            warn!(
                "Maintenance attempt {} failed ({:?}): {}",
                attempt + 1,
                kind,
                error
            );
            if !self.retry.allows_retry(attempt, kind) {
                return CycleOutcome::Failed(error);
            }

            let delay = calculate_delay(attempt, &self.retry);
            debug!("Retrying maintenance after {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_token.cancelled() => return CycleOutcome::Cancelled,
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PruneReport;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn summary() -> HealthSummary {
        HealthSummary {
            lessons: Vec::new(),
            pruned: PruneReport::default(),
            recent_successes: 0,
            recent_failures: 0,
            positive_feedback: 0,
            negative_feedback: 0,
            skill_count: 0,
            top_skills: Vec::new(),
        }
    }

    /// Fails the first `failures` runs with `message`, then succeeds
    struct FlakyJob {
        failures: u32,
        message: &'static str,
        calls: AtomicU32,
    }

    impl FlakyJob {
        fn new(failures: u32, message: &'static str) -> Arc<Self> {
            Arc::new(Self {
                failures,
                message,
                calls: AtomicU32::new(0),
            })
        }
    }

    impl MaintenanceJob for FlakyJob {
        fn run(&self) -> Result<HealthSummary> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(anyhow!(self.message))
            } else {
                Ok(summary())
            }
        }
    }

    struct BatteryLow(AtomicBool);

    impl RunConstraint for BatteryLow {
        fn allows_run(&self) -> bool {
            !self.0.load(Ordering::SeqCst)
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_cycle_retries_then_completes() {
        let job = FlakyJob::new(2, "Failed to commit: disk busy");
        let scheduler = MaintenanceScheduler::new(job.clone(), Duration::from_secs(3600))
            .with_retry(fast_retry(3));

        assert_eq!(scheduler.run_cycle().await, CycleOutcome::Completed(summary()));
        assert_eq!(job.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cycle_gives_up_after_max_attempts() {
        let job = FlakyJob::new(10, "Failed to commit: disk busy");
        let scheduler = MaintenanceScheduler::new(job.clone(), Duration::from_secs(3600))
            .with_retry(fast_retry(2));

        assert!(matches!(scheduler.run_cycle().await, CycleOutcome::Failed(_)));
        assert_eq!(job.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let job = FlakyJob::new(10, "Failed to deserialize turn: bad tag");
        let scheduler = MaintenanceScheduler::new(job.clone(), Duration::from_secs(3600))
            .with_retry(fast_retry(5));

        assert!(matches!(scheduler.run_cycle().await, CycleOutcome::Failed(_)));
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_constraint_skips_cycle() {
        let job = FlakyJob::new(0, "");
        let scheduler = MaintenanceScheduler::new(job.clone(), Duration::from_secs(3600))
            .with_constraint(Arc::new(BatteryLow(AtomicBool::new(true))));

        assert_eq!(scheduler.run_cycle().await, CycleOutcome::Skipped);
        assert_eq!(job.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scheduler_ticks_and_stops_on_shutdown() {
        let job = FlakyJob::new(0, "");
        let scheduler = Arc::new(MaintenanceScheduler::new(job.clone(), Duration::from_millis(10)));
        let token = scheduler.shutdown_token();
        let handle = scheduler.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        assert!(job.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_real_review_runs_under_scheduler() {
        let store = Arc::new(crate::memory::MemoryStore::open_in_memory().unwrap());
        store.remember("hello there", "hi", &[], true).unwrap();
        let review = Arc::new(SelfImprovementLoop::new(store, Default::default()));
        let scheduler = MaintenanceScheduler::new(review, Duration::from_secs(3600));

        match scheduler.run_cycle().await {
            CycleOutcome::Completed(summary) => assert_eq!(summary.recent_successes, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
