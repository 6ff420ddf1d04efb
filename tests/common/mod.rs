//! Shared helpers for SQLite-backed integration tests.

#![allow(dead_code)]

use db_pool_sim::config::PoolConfig;
use db_pool_sim::db::ConnectionPool;
use db_pool_sim::models::Statement;
use std::time::Duration;
use tempfile::TempPath;

const SQLITE_SCHEMA: &str = include_str!("../../sql/sqlite.sql");

/// A SQLite database file that lives as long as the returned path.
pub fn sqlite_target() -> (TempPath, String) {
    let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
    let url = format!("sqlite:{}?mode=rwc", path.display());
    (path, url)
}

/// Limits that never close a connection on their own.
pub fn unlimited(max_open: u32, max_idle: u32) -> PoolConfig {
    PoolConfig::new(max_open, max_idle, Duration::ZERO, Duration::ZERO)
}

/// Create the `users` / `orders` tables.
pub async fn apply_schema(pool: &ConnectionPool) {
    for sql in SQLITE_SCHEMA.split(';') {
        let has_sql = sql
            .lines()
            .any(|line| !line.trim().is_empty() && !line.trim_start().starts_with("--"));
        if has_sql {
            pool.execute(&Statement::new(sql)).await.unwrap();
        }
    }
}
