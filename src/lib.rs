//! DB Pool Simulator Library
//!
//! This library provides a bounded SQL connection pool (MySQL, PostgreSQL, SQLite)
//! with deadline-bound queries and live statistics, plus a simulator that drives
//! concurrent clients which give up on long-running queries.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod simulator;

pub use config::{Config, PoolConfig};
pub use db::{ConnectionPool, PoolStats, QueryTarget};
pub use error::{DbError, DbResult};
pub use orchestrator::{Orchestrator, Phase, RunReport};
pub use simulator::{AbortScenario, AbortSimulator, ClientOutcome, OutcomeKind, ScenarioReport};
