//! Concurrent client-abort simulation.
//!
//! Each simulated client issues one long-running statement through a shared
//! [`QueryTarget`] and gives up after its own deadline. The simulator waits for
//! every client, including ones that panic, before it reports.

use crate::db::QueryTarget;
use crate::error::{DbError, DbResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How many clients to run, how long their statement would take, and when they give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AbortScenario {
    pub client_count: u32,
    pub query_duration: Duration,
    /// Measured from each client's own start.
    pub abort_after: Duration,
}

impl AbortScenario {
    pub fn new(client_count: u32, query_duration: Duration, abort_after: Duration) -> Self {
        Self {
            client_count,
            query_duration,
            abort_after,
        }
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.client_count == 0 {
            return Err(DbError::invalid_input("client count must be greater than 0"));
        }
        Ok(())
    }

    /// True when clients are expected to give up before their statement finishes.
    pub fn expects_abort(&self) -> bool {
        self.abort_after < self.query_duration
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed { rows: u64 },
    Aborted,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientOutcome {
    pub client_id: u32,
    pub outcome: OutcomeKind,
    pub elapsed: Duration,
}

/// Every client's outcome, sorted by client id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub outcomes: Vec<ClientOutcome>,
    pub completed: u32,
    pub aborted: u32,
    pub failed: u32,
}

impl ScenarioReport {
    pub fn from_outcomes(mut outcomes: Vec<ClientOutcome>) -> Self {
        outcomes.sort_by_key(|o| o.client_id);
        let mut report = Self::default();
        for outcome in &outcomes {
            match outcome.outcome {
                OutcomeKind::Completed { .. } => report.completed += 1,
                OutcomeKind::Aborted => report.aborted += 1,
                OutcomeKind::Failed { .. } => report.failed += 1,
            }
        }
        report.outcomes = outcomes;
        report
    }

    pub fn total(&self) -> u32 {
        self.completed + self.aborted + self.failed
    }
}

/// Drives `client_count` concurrent clients against one shared target.
pub struct AbortSimulator<P: QueryTarget> {
    pool: Arc<P>,
    ctx: CancellationToken,
}

impl<P: QueryTarget> AbortSimulator<P> {
    /// `ctx` is the parent of every client's token; cancelling it aborts them all.
    pub fn new(pool: Arc<P>, ctx: CancellationToken) -> Self {
        Self { pool, ctx }
    }

    /// Run every client to completion and collect their outcomes.
    ///
    /// Returns only once each spawned client has finished, one outcome per client.
    pub async fn run(&self, scenario: &AbortScenario) -> ScenarioReport {
        info!(
            clients = scenario.client_count,
            query_duration = ?scenario.query_duration,
            abort_after = ?scenario.abort_after,
            "Simulating client aborts"
        );

        let mut clients = JoinSet::new();
        let mut client_ids = HashMap::with_capacity(scenario.client_count as usize);

        for client_id in 1..=scenario.client_count {
            let pool = Arc::clone(&self.pool);
            let ctx = self.ctx.child_token();
            let query_duration = scenario.query_duration;
            let abort_after = scenario.abort_after;

            let handle = clients.spawn(async move {
                simulate_client_abort(pool.as_ref(), &ctx, client_id, query_duration, abort_after)
                    .await
            });
            client_ids.insert(handle.id(), client_id);
        }

        let mut outcomes = Vec::with_capacity(scenario.client_count as usize);
        while let Some(joined) = clients.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => outcomes.push(outcome),
                Err(err) => {
                    let client_id = client_ids.get(&err.id()).copied().unwrap_or_default();
                    let error = describe_join_error(err);
                    warn!(client_id, error = %error, "Client task died");
                    outcomes.push(ClientOutcome {
                        client_id,
                        outcome: OutcomeKind::Failed { error },
                        elapsed: Duration::ZERO,
                    });
                }
            }
        }

        let report = ScenarioReport::from_outcomes(outcomes);
        info!(
            completed = report.completed,
            aborted = report.aborted,
            failed = report.failed,
            "All clients finished"
        );
        report
    }
}

/// Run one client: issue a statement lasting `query_duration`, give up after `abort_after`.
pub async fn simulate_client_abort<P: QueryTarget>(
    pool: &P,
    ctx: &CancellationToken,
    client_id: u32,
    query_duration: Duration,
    abort_after: Duration,
) -> ClientOutcome {
    let statement = pool.sleep_statement(query_duration);
    info!(
        client_id,
        query_duration = ?query_duration,
        abort_after = ?abort_after,
        "Starting query"
    );

    let started = Instant::now();
    let outcome = match pool.execute_with_deadline(ctx, &statement, abort_after).await {
        Ok(summary) => {
            info!(client_id, elapsed = ?summary.elapsed, "Query completed");
            OutcomeKind::Completed { rows: summary.rows }
        }
        Err(e) if e.is_abort() => {
            info!(client_id, error = %e, "Client aborted query");
            OutcomeKind::Aborted
        }
        Err(e) => {
            warn!(client_id, error = %e, "Query failed");
            OutcomeKind::Failed {
                error: e.to_string(),
            }
        }
    };

    ClientOutcome {
        client_id,
        outcome,
        elapsed: started.elapsed(),
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("client panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("client panicked: {msg}")
    } else {
        "client panicked".to_string()
    }
}
