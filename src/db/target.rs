//! The seam between the pool and the code that drives it.
//!
//! The abort simulator and the orchestrator only need deadline-bound execution, a
//! way to spell a long-running statement, and a stats snapshot. `ConnectionPool`
//! implements this for real stores.

use crate::db::stats::PoolStats;
use crate::error::{DbError, DbResult};
use crate::models::{ExecutionSummary, Statement};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub trait QueryTarget: Send + Sync + 'static {
    /// Run `statement`, giving up once `deadline` elapses or `ctx` is cancelled.
    ///
    /// Giving up yields [`DbError::ClientAborted`]; store failures yield
    /// [`DbError::Query`] or another non-abort variant.
    fn execute_with_deadline(
        &self,
        ctx: &CancellationToken,
        statement: &Statement,
        deadline: Duration,
    ) -> impl Future<Output = DbResult<ExecutionSummary>> + Send;

    /// A statement that keeps the store busy for `duration`.
    fn sleep_statement(&self, duration: Duration) -> Statement;

    fn stats(&self) -> PoolStats;
}

/// Race `work` against `deadline` and `ctx`.
///
/// `work` is dropped as soon as either fires, which is what cancels it. A result
/// that is ready on the same poll as the deadline wins.
pub async fn race_deadline<F, T>(ctx: &CancellationToken, deadline: Duration, work: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    let started = Instant::now();
    tokio::select! {
        biased;
        result = work => result,
        () = tokio::time::sleep(deadline) => Err(DbError::client_aborted(started.elapsed())),
        () = ctx.cancelled() => Err(DbError::client_aborted(started.elapsed())),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_work_finishing_first_wins() {
        let ctx = CancellationToken::new();
        let result = race_deadline(&ctx, Duration::from_secs(10), async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok::<_, DbError>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_first_aborts() {
        let ctx = CancellationToken::new();
        let result = race_deadline(&ctx, Duration::from_secs(600), async {
            tokio::time::sleep(Duration::from_secs(900)).await;
            Ok::<_, DbError>(())
        })
        .await;
        match result {
            Err(DbError::ClientAborted { elapsed_ms }) => assert_eq!(elapsed_ms, 600_000),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_error_is_not_an_abort() {
        let ctx = CancellationToken::new();
        let result: DbResult<()> = race_deadline(&ctx, Duration::from_secs(1), async {
            Err(DbError::query("syntax error", None, "check syntax"))
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));
        assert!(!err.is_abort());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_aborts() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = race_deadline(&ctx, Duration::from_secs(60), std::future::pending::<DbResult<()>>())
            .await;
        assert!(result.unwrap_err().is_abort());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_work_runs_its_destructors() {
        struct Flag(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Flag(dropped.clone());
        let ctx = CancellationToken::new();
        let _ = race_deadline(&ctx, Duration::from_millis(10), async move {
            let _flag = flag;
            std::future::pending::<DbResult<()>>().await
        })
        .await;
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
