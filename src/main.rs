//! DB Pool Simulator - Main entry point.
//!
//! Opens a connection pool, runs concurrent clients that abort long queries, and
//! reports pool statistics while they run.

use clap::Parser;
use db_pool_sim::config::Config;
use db_pool_sim::models::mask_connection_string;
use db_pool_sim::orchestrator::Orchestrator;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so `--json-report` output on stdout stays parseable.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let target = config.target()?;
    let scenario = config.scenario()?;
    let stats_interval = config.stats_interval()?;

    info!(
        database = %mask_connection_string(&target.connection_string),
        clients = scenario.client_count,
        query_duration = ?scenario.query_duration,
        abort_after = ?scenario.abort_after,
        "Starting DB Pool Simulator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut orchestrator = Orchestrator::new(stats_interval);
    let report = match orchestrator
        .run(&target.connection_string, target.pool, &scenario)
        .await
    {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, suggestion = ?e.suggestion(), "Simulation failed");
            return Err(e.into());
        }
    };

    info!(
        completed = report.scenario.completed,
        aborted = report.scenario.aborted,
        failed = report.scenario.failed,
        peak_in_use = report.peak_in_use(),
        "Simulation complete"
    );

    if config.json_report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}
