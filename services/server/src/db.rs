//! Database pool and retry helpers.
//!
//! Postgres reports serialization failures as SQLSTATE `40001`; those are
//! the only database errors the server retries locally.  Everything else
//! bubbles up through the error taxonomy.

use futures_util::future::BoxFuture;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::warn;

const SERIALIZATION_FAILURE: &str = "40001";
const UNIQUE_VIOLATION: &str = "23505";
const MAX_RETRIES: u32 = 5;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(SERIALIZATION_FAILURE))
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

/// Reissue `f` while it fails with a serialization failure, up to a bounded
/// number of attempts.  `f` must be safe to re-run from scratch (it owns its
/// own transaction or is a single statement).
pub async fn execute_retryable<T, F, Fut>(f: F) -> Result<T, sqlx::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Err(err) if is_serialization_failure(&err) && attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(attempt, "retrying statement after serialization failure");
            }
            other => return other,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// The retry path could not roll back to the savepoint; the transaction
    /// is unusable and the caller must restart it.
    #[error("transaction restart required: {0}")]
    TxnRestart(#[source] sqlx::Error),
    /// `RELEASE SAVEPOINT` (or the commit) failed after the work succeeded;
    /// the caller cannot know whether the write landed.
    #[error("ambiguous commit: {0}")]
    AmbiguousCommit(#[source] sqlx::Error),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Run `f` inside a transaction, wrapped between `SAVEPOINT` and
/// `RELEASE SAVEPOINT`.  On a serialization failure the savepoint is rolled
/// back and `f` re-runs on the same transaction.
pub async fn execute_in_tx<T, F>(pool: &PgPool, mut f: F) -> Result<T, TxError>
where
    F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T, sqlx::Error>>,
{
    let mut tx = pool.begin().await?;
    sqlx::query("SAVEPOINT arena_tx").execute(&mut *tx).await?;

    let mut attempt = 0;
    loop {
        match f(&mut *tx).await {
            Ok(value) => {
                if let Err(err) = sqlx::query("RELEASE SAVEPOINT arena_tx")
                    .execute(&mut *tx)
                    .await
                {
                    return Err(TxError::AmbiguousCommit(err));
                }
                if let Err(err) = tx.commit().await {
                    return Err(TxError::AmbiguousCommit(err));
                }
                return Ok(value);
            }
            Err(err) if is_serialization_failure(&err) && attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(attempt, "retrying transaction after serialization failure");
                if let Err(rollback_err) = sqlx::query("ROLLBACK TO SAVEPOINT arena_tx")
                    .execute(&mut *tx)
                    .await
                {
                    return Err(TxError::TxnRestart(rollback_err));
                }
            }
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(TxError::Db(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn execute_retryable_passes_through_success_and_plain_errors() {
        let calls = AtomicU32::new(0);
        let out = execute_retryable(|| async {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, sqlx::Error>(7)
        })
        .await;
        assert_eq!(out.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let out: Result<(), _> = execute_retryable(|| async {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            Err(sqlx::Error::RowNotFound)
        })
        .await;
        assert!(out.is_err());
        // RowNotFound is not a serialization failure; no retry happens.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_database_errors_are_not_serialization_failures() {
        assert!(!is_serialization_failure(&sqlx::Error::RowNotFound));
        assert!(!is_unique_violation(&sqlx::Error::PoolClosed));
    }
}
