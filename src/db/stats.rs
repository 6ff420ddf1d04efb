//! Pool statistics.
//!
//! `PoolCounters` holds the live atomics the pool layer updates; `snapshot` is a pure
//! read of those atomics plus the store client's own size/idle figures. Reads never
//! take a lock, so polling stats cannot stall in-flight queries.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Point-in-time view of a connection pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections currently established, in use or idle.
    pub open_connections: u32,
    pub in_use: u64,
    pub idle: u32,
    /// Total number of acquisitions that had to wait for a connection.
    pub wait_count: u64,
    /// Total time spent waiting for connections.
    pub wait_duration: Duration,
    /// Connections closed because the idle set was full.
    pub max_idle_closed: u64,
    /// Connections closed because they sat idle too long.
    pub max_idle_time_closed: u64,
    /// Connections closed because they reached their maximum lifetime.
    pub max_lifetime_closed: u64,
}

impl PoolStats {
    /// Emit this snapshot as one structured log event.
    pub fn log(&self, label: &str) {
        info!(
            label,
            open_connections = self.open_connections,
            in_use = self.in_use,
            idle = self.idle,
            wait_count = self.wait_count,
            wait_duration = ?self.wait_duration,
            max_idle_closed = self.max_idle_closed,
            max_idle_time_closed = self.max_idle_time_closed,
            max_lifetime_closed = self.max_lifetime_closed,
            "Connection pool stats"
        );
    }
}

/// Live counters maintained by the pool layer.
#[derive(Debug, Default)]
pub struct PoolCounters {
    in_use: AtomicU64,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
    max_idle_closed: AtomicU64,
    max_idle_time_closed: AtomicU64,
    max_lifetime_closed: AtomicU64,
}

impl PoolCounters {
    pub fn lease_started(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at 0.
    pub fn lease_ended(&self) {
        let _ = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Start timing a wait for a connection. The wait is counted immediately and its
    /// duration is added when the returned guard drops, whether or not it succeeded.
    pub fn begin_wait(&self) -> WaitGuard<'_> {
        self.wait_count.fetch_add(1, Ordering::AcqRel);
        WaitGuard {
            counters: self,
            started: Instant::now(),
        }
    }

    pub fn record_max_idle_closed(&self) {
        self.max_idle_closed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_max_idle_time_closed(&self) {
        self.max_idle_time_closed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_max_lifetime_closed(&self) {
        self.max_lifetime_closed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Adds the elapsed wait to the counters on drop.
pub struct WaitGuard<'a> {
    counters: &'a PoolCounters,
    started: Instant,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let nanos = self.started.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.counters.wait_nanos.fetch_add(nanos, Ordering::AcqRel);
    }
}

/// Read the counters into an immutable snapshot.
///
/// `open` and `idle` come from the store client; everything else from `counters`.
pub fn snapshot(open: u32, idle: usize, counters: &PoolCounters) -> PoolStats {
    PoolStats {
        open_connections: open,
        in_use: counters.in_use.load(Ordering::Acquire),
        idle: idle as u32,
        wait_count: counters.wait_count.load(Ordering::Acquire),
        wait_duration: Duration::from_nanos(counters.wait_nanos.load(Ordering::Acquire)),
        max_idle_closed: counters.max_idle_closed.load(Ordering::Acquire),
        max_idle_time_closed: counters.max_idle_time_closed.load(Ordering::Acquire),
        max_lifetime_closed: counters.max_lifetime_closed.load(Ordering::Acquire),
    }
}
