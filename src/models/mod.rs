//! Data models for the pool simulator.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod query;
pub mod row;

// Re-export commonly used types
pub use connection::{DatabaseType, mask_connection_string};
pub use query::{ExecutionSummary, QueryParam, Statement};
pub use row::{Order, User};
