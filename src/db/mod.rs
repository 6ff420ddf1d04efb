//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management with deadline-bound execution
//! - Connection lifecycle limits
//! - Pool statistics
//! - Row helpers for the `users` / `orders` schema
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod lifecycle;
pub mod params;
pub mod pool;
pub mod repository;
pub mod stats;
pub mod target;

pub use pool::{ConnectionPool, DbPool, RowMapped};
pub use repository::{NewOrder, Repository};
pub use stats::PoolStats;
pub use target::QueryTarget;
