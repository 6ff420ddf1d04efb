//! Connection lifecycle limits.
//!
//! sqlx has no idle-count limit and closes aged connections without telling anyone,
//! so the idle-count, idle-time and lifetime limits are applied from the pool's
//! `after_release` / `before_acquire` hooks instead. sqlx's reaper is disabled; a
//! hook returning `false` makes sqlx close the connection, and the hook records why.

use crate::config::PoolConfig;
use crate::db::pool::DbPool;
use crate::db::stats::PoolCounters;
use sqlx::Database;
use sqlx::pool::PoolOptions;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// How long an idle claim may go unseen in the pool's idle count before it lapses.
///
/// sqlx pings a released connection after `after_release` has kept it, and closes
/// it when the ping fails; such a claim never reaches the idle set.
pub const IDLE_CLAIM_GRACE: Duration = Duration::from_secs(5);

/// Idle slots granted on release but not yet visible in the pool's idle count.
#[derive(Debug, Default)]
struct IdleClaims {
    /// Grant times, oldest first.
    pending: VecDeque<Instant>,
    /// Connections seen entering the idle set so far.
    admitted: u64,
    /// Idle connections handed out so far.
    checkouts: u64,
}

impl IdleClaims {
    /// Match pending claims against connections that reached the idle set, then
    /// drop claims older than [`IDLE_CLAIM_GRACE`].
    fn reconcile(&mut self, idle_now: usize, now: Instant) {
        let entered = idle_now as u64 + self.checkouts;
        while self.admitted < entered {
            if self.pending.pop_front().is_none() {
                self.admitted = entered;
                break;
            }
            self.admitted += 1;
        }
        while self
            .pending
            .front()
            .is_some_and(|granted| now.duration_since(*granted) >= IDLE_CLAIM_GRACE)
        {
            self.pending.pop_front();
        }
    }
}

/// Decides whether a connection stays in the pool.
#[derive(Debug)]
pub struct LifecyclePolicy {
    max_idle: u32,
    lifetime: Option<Duration>,
    idle_time: Option<Duration>,
    counters: Arc<PoolCounters>,
    claims: Mutex<IdleClaims>,
    /// The pool these hooks belong to, unset once it closes.
    pool: Mutex<Option<DbPool>>,
}

impl LifecyclePolicy {
    pub fn new(config: &PoolConfig, counters: Arc<PoolCounters>) -> Self {
        Self {
            max_idle: config.max_idle_connections,
            lifetime: config.lifetime_limit(),
            idle_time: config.idle_time_limit(),
            counters,
            claims: Mutex::new(IdleClaims::default()),
            pool: Mutex::new(None),
        }
    }

    /// Read idle counts from `pool` from now on.
    pub fn watch(&self, pool: DbPool) {
        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(pool);
    }

    /// Stop reading from the watched pool. Its options hold this policy, so the
    /// handle has to be released for the pool to be freed.
    pub fn unwatch(&self) {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Idle connections in the watched pool, 0 when nothing is watched.
    pub fn idle_count(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |pool| pool.num_idle().min(pool.size() as usize))
    }

    /// Called when a caller hands a connection back. `true` keeps it idle.
    ///
    /// `idle_now` is the pool's idle count, which does not yet include this connection.
    pub fn on_release(&self, age: Duration, idle_now: usize) -> bool {
        if self.lifetime.is_some_and(|limit| age >= limit) {
            debug!(age = ?age, "Closing connection past its lifetime on release");
            self.counters.record_max_lifetime_closed();
            return false;
        }

        let now = Instant::now();
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        claims.reconcile(idle_now, now);
        if idle_now + claims.pending.len() >= self.max_idle as usize {
            drop(claims);
            debug!(
                max_idle = self.max_idle,
                idle = idle_now,
                "Idle set full, closing released connection"
            );
            self.counters.record_max_idle_closed();
            return false;
        }
        claims.pending.push_back(now);
        true
    }

    /// Called when an idle connection is about to be handed out. `true` lets it through.
    pub fn on_checkout(&self, age: Duration, idle_for: Duration) -> bool {
        // Whatever happens next, the connection has left the idle set.
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .checkouts += 1;

        if self.idle_time.is_some_and(|limit| idle_for >= limit) {
            debug!(idle_for = ?idle_for, "Closing connection idle past its limit");
            self.counters.record_max_idle_time_closed();
            return false;
        }
        if self.lifetime.is_some_and(|limit| age >= limit) {
            debug!(age = ?age, "Closing connection past its lifetime on checkout");
            self.counters.record_max_lifetime_closed();
            return false;
        }
        true
    }
}

/// Build sqlx pool options that apply `config` through `policy`.
pub fn pool_options<DB: Database>(
    config: &PoolConfig,
    policy: &Arc<LifecyclePolicy>,
) -> PoolOptions<DB> {
    let on_release = Arc::clone(policy);
    let on_checkout = Arc::clone(policy);

    PoolOptions::<DB>::new()
        .max_connections(config.max_open_connections)
        .min_connections(0)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .test_before_acquire(false)
        .after_release(move |_conn, meta| {
            let keep = on_release.on_release(meta.age, on_release.idle_count());
            Box::pin(async move { Ok::<_, sqlx::Error>(keep) })
        })
        .before_acquire(move |_conn, meta| {
            let keep = on_checkout.on_checkout(meta.age, meta.idle_for);
            Box::pin(async move { Ok::<_, sqlx::Error>(keep) })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::stats::snapshot;

    fn policy(max_idle: u32, lifetime_secs: u64, idle_secs: u64) -> (LifecyclePolicy, Arc<PoolCounters>) {
        let counters = Arc::new(PoolCounters::default());
        let config = PoolConfig::new(
            10,
            max_idle,
            Duration::from_secs(lifetime_secs),
            Duration::from_secs(idle_secs),
        );
        (LifecyclePolicy::new(&config, Arc::clone(&counters)), counters)
    }

    #[test]
    fn test_release_keeps_up_to_max_idle() {
        let (policy, counters) = policy(2, 0, 0);
        assert!(policy.on_release(Duration::from_secs(1), 0));
        assert!(policy.on_release(Duration::from_secs(1), 0));
        assert!(!policy.on_release(Duration::from_secs(1), 0));
        assert_eq!(snapshot(0, 0, &counters).max_idle_closed, 1);
    }

    #[test]
    fn test_claim_seen_in_idle_count_is_not_counted_twice() {
        let (policy, counters) = policy(2, 0, 0);
        assert!(policy.on_release(Duration::ZERO, 0));
        // The first connection is now idle; one slot is left.
        assert!(policy.on_release(Duration::ZERO, 1));
        assert!(!policy.on_release(Duration::ZERO, 2));
        assert_eq!(snapshot(0, 0, &counters).max_idle_closed, 1);
    }

    #[test]
    fn test_checkout_frees_an_idle_slot() {
        let (policy, _counters) = policy(1, 0, 0);
        assert!(policy.on_release(Duration::ZERO, 0));
        assert!(!policy.on_release(Duration::ZERO, 1));
        assert!(policy.on_checkout(Duration::ZERO, Duration::ZERO));
        assert!(policy.on_release(Duration::ZERO, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_for_connection_closed_outside_hooks_lapses() {
        let (policy, counters) = policy(1, 0, 0);
        // Kept on release, then closed by sqlx before reaching the idle set.
        assert!(policy.on_release(Duration::ZERO, 0));
        assert!(!policy.on_release(Duration::ZERO, 0));

        tokio::time::advance(IDLE_CLAIM_GRACE).await;
        assert!(policy.on_release(Duration::ZERO, 0));
        assert!(!policy.on_release(Duration::ZERO, 0));
        assert_eq!(snapshot(0, 0, &counters).max_idle_closed, 2);
    }

    #[test]
    fn test_unwatched_policy_reports_no_idle_connections() {
        let (policy, _counters) = policy(1, 0, 0);
        assert_eq!(policy.idle_count(), 0);
        policy.unwatch();
        assert_eq!(policy.idle_count(), 0);
    }

    #[test]
    fn test_zero_max_idle_closes_every_release() {
        let (policy, counters) = policy(0, 0, 0);
        assert!(!policy.on_release(Duration::ZERO, 0));
        assert!(!policy.on_release(Duration::ZERO, 0));
        assert_eq!(snapshot(0, 0, &counters).max_idle_closed, 2);
    }

    #[test]
    fn test_lifetime_limit_on_release_and_checkout() {
        let (policy, counters) = policy(5, 60, 0);
        assert!(!policy.on_release(Duration::from_secs(61), 0));
        assert!(policy.on_release(Duration::from_secs(59), 0));
        assert!(!policy.on_checkout(Duration::from_secs(60), Duration::ZERO));
        let stats = snapshot(0, 0, &counters);
        assert_eq!(stats.max_lifetime_closed, 2);
        assert_eq!(stats.max_idle_closed, 0);
    }

    #[test]
    fn test_idle_time_limit_on_checkout() {
        let (policy, counters) = policy(5, 0, 1);
        assert!(policy.on_checkout(Duration::from_secs(100), Duration::from_millis(500)));
        assert!(!policy.on_checkout(Duration::from_secs(100), Duration::from_secs(2)));
        assert_eq!(snapshot(0, 0, &counters).max_idle_time_closed, 1);
    }

    #[test]
    fn test_unlimited_durations_never_close() {
        let (policy, counters) = policy(5, 0, 0);
        let ancient = Duration::from_secs(86_400 * 365);
        assert!(policy.on_checkout(ancient, ancient));
        assert!(policy.on_release(ancient, 0));
        let stats = snapshot(0, 0, &counters);
        assert_eq!(stats.max_lifetime_closed + stats.max_idle_time_closed, 0);
    }
}
