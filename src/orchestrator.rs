//! Runs one abort scenario against a pool while polling its statistics.
//!
//! The run moves through three phases: `Starting` builds the pool, `Running` drives
//! the simulator and samples stats on every tick, `Done` records the final stats.
//! The pool is closed on every path once it has been built.

use crate::config::PoolConfig;
use crate::db::{ConnectionPool, PoolStats, QueryTarget};
use crate::error::{DbError, DbResult};
use crate::simulator::{AbortScenario, AbortSimulator, ScenarioReport};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Running,
    Done,
}

/// Everything observed during one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub initial_stats: PoolStats,
    /// One snapshot per stats tick while clients were running.
    pub samples: Vec<PoolStats>,
    pub final_stats: PoolStats,
    pub scenario: ScenarioReport,
}

impl RunReport {
    /// Highest `in_use` seen across every snapshot.
    pub fn peak_in_use(&self) -> u64 {
        self.samples
            .iter()
            .chain([&self.initial_stats, &self.final_stats])
            .map(|s| s.in_use)
            .max()
            .unwrap_or_default()
    }
}

pub struct Orchestrator {
    stats_interval: Duration,
    phase: Phase,
    /// Parent of every client token. Never cancelled here.
    root: CancellationToken,
}

impl Orchestrator {
    pub fn new(stats_interval: Duration) -> Self {
        Self {
            stats_interval,
            phase: Phase::Starting,
            root: CancellationToken::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Build a pool for `target`, run `scenario` against it, and close it.
    ///
    /// A pool that cannot be built is returned as an error before any client starts.
    pub async fn run(
        &mut self,
        target: &str,
        config: PoolConfig,
        scenario: &AbortScenario,
    ) -> DbResult<RunReport> {
        scenario.validate()?;
        if self.stats_interval.is_zero() {
            return Err(DbError::invalid_input("stats interval must be greater than 0"));
        }
        self.enter(Phase::Starting);

        let pool = Arc::new(ConnectionPool::new(target, config).await?);
        let result = self.run_scenario(Arc::clone(&pool), scenario).await;
        let closed = pool.close().await;

        let report = result?;
        closed?;
        Ok(report)
    }

    /// Run `scenario` against an existing target, sampling its stats until every
    /// client has finished.
    pub async fn run_scenario<P: QueryTarget>(
        &mut self,
        pool: Arc<P>,
        scenario: &AbortScenario,
    ) -> DbResult<RunReport> {
        let initial_stats = pool.stats();
        initial_stats.log("initial");

        self.enter(Phase::Running);
        let (done_tx, mut done_rx) = oneshot::channel();
        let simulator = AbortSimulator::new(Arc::clone(&pool), self.root.clone());
        let scenario = *scenario;
        let driver = tokio::spawn(async move {
            let report = simulator.run(&scenario).await;
            let _ = done_tx.send(report);
        });

        let mut ticker = interval(self.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut samples = Vec::new();
        let received = loop {
            tokio::select! {
                biased;
                received = &mut done_rx => break received,
                _ = ticker.tick() => {
                    let stats = pool.stats();
                    stats.log("periodic");
                    samples.push(stats);
                }
            }
        };

        let driver_result = driver.await;
        let scenario_report = match (received, driver_result) {
            (Ok(report), _) => report,
            (Err(_), Err(join_err)) => {
                error!(error = %join_err, "Simulator task died");
                self.enter(Phase::Done);
                return Err(DbError::internal(format!("simulator task died: {join_err}")));
            }
            (Err(_), Ok(())) => {
                self.enter(Phase::Done);
                return Err(DbError::internal("simulator finished without a report"));
            }
        };
        info!("Client abort simulation finished");

        let final_stats = pool.stats();
        final_stats.log("final");
        self.enter(Phase::Done);

        Ok(RunReport {
            initial_stats,
            samples,
            final_stats,
            scenario: scenario_report,
        })
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            info!(from = ?self.phase, to = ?phase, "Phase transition");
        }
        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::target::fake::FakeTarget;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_five_clients_abort_and_release_their_connections() {
        let target = Arc::new(FakeTarget::new());
        let mut orchestrator = Orchestrator::new(Duration::from_secs(5));
        assert_eq!(orchestrator.phase(), Phase::Starting);

        let report = orchestrator
            .run_scenario(
                Arc::clone(&target),
                &AbortScenario::new(5, 15 * MINUTE, 10 * MINUTE),
            )
            .await
            .unwrap();

        assert_eq!(orchestrator.phase(), Phase::Done);
        assert_eq!(report.scenario.aborted, 5);
        assert_eq!(report.scenario.total(), 5);
        assert_eq!(report.initial_stats.in_use, 0);
        assert_eq!(report.peak_in_use(), 5);
        assert_eq!(report.final_stats.in_use, 0);
        // Ticks every 5s for the 10 minutes the clients were waiting.
        assert!(report.samples.len() >= 119, "got {} samples", report.samples.len());
        assert!(report.samples.len() <= 120, "got {} samples", report.samples.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_scenario_finishes_without_samples() {
        let target = Arc::new(FakeTarget::new());
        let mut orchestrator = Orchestrator::new(Duration::from_secs(5));
        let report = orchestrator
            .run_scenario(
                target,
                &AbortScenario::new(2, Duration::from_secs(1), Duration::from_secs(3)),
            )
            .await
            .unwrap();

        assert_eq!(report.scenario.completed, 2);
        assert!(report.samples.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_before_running() {
        let mut orchestrator = Orchestrator::new(Duration::from_secs(5));
        let result = orchestrator
            .run(
                "sqlite:/nonexistent-dir/nested/pool.db",
                PoolConfig::default(),
                &AbortScenario::new(1, MINUTE, MINUTE),
            )
            .await;

        assert!(matches!(result, Err(DbError::Connection { .. })));
        assert_eq!(orchestrator.phase(), Phase::Starting);
    }

    #[tokio::test]
    async fn test_zero_clients_is_rejected() {
        let mut orchestrator = Orchestrator::new(Duration::from_secs(5));
        let result = orchestrator
            .run(
                "sqlite::memory:",
                PoolConfig::default(),
                &AbortScenario::new(0, MINUTE, MINUTE),
            )
            .await;
        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    }
}
