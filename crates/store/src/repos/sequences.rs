//! Named integer sequences.

use crate::error::{StatementError, StoreError, StoreResult};
use crate::scheduler::TxnHandle;
use async_trait::async_trait;

/// Repository for monotonically increasing named counters.
#[async_trait]
pub trait SequenceRepo: Send + Sync {
    /// Allocate the next value of `name` in its own transaction.
    async fn next_in_sequence(&self, name: &str) -> StoreResult<i64>;
}

/// Allocate the next value of `name` within an open transaction.
///
/// The first value of a new sequence is 1. The allocation is only durable
/// if the transaction commits, so roll back when the value goes unused.
pub async fn seq_next(txn: &mut TxnHandle, name: &str) -> StoreResult<i64> {
    let conn = txn.conn()?;
    let current: Option<i64> = sqlx::query_scalar("SELECT next_id FROM seq WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| sequence_error(name, e))?;
    let ours = current.unwrap_or(1);

    sqlx::query("INSERT OR REPLACE INTO seq (name, next_id) VALUES (?, ?)")
        .bind(name)
        .bind(ours + 1)
        .execute(&mut *conn)
        .await
        .map_err(|e| sequence_error(name, e))?;

    Ok(ours)
}

fn sequence_error(name: &str, source: sqlx::Error) -> StoreError {
    StatementError::new(format!("getting next in sequence \"{name}\""), source).into()
}
