//! Store and transaction error types.

use provis_core::{BoxError, MultiError};
use std::path::PathBuf;
use thiserror::Error;

/// A SQL statement issued by the scheduler itself failed.
#[derive(Debug, Error)]
#[error("{context}: {source}")]
pub struct StatementError {
    pub context: String,
    #[source]
    pub source: sqlx::Error,
}

impl StatementError {
    pub fn new(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self {
            context: context.into(),
            source,
        }
    }
}

/// Failure of one scheduled transaction.
///
/// Every variant carries the id the scheduler assigned at submission.
#[derive(Debug, Error)]
pub enum TxnError {
    /// The begin statement failed; the work function never ran.
    #[error("transaction {txn_id}: {statement} failed: {source}")]
    Begin {
        txn_id: u64,
        statement: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// The work reported an error, the commit/rollback statement failed, or both.
    #[error("transaction {txn_id} failed: {errors}")]
    Failed { txn_id: u64, errors: MultiError },

    /// The connection was used after the transaction finished.
    #[error("transaction {txn_id} is not open")]
    NotOpen { txn_id: u64 },

    /// The scheduler failed to open, was closed, or lost its connection.
    #[error("transaction {txn_id}: scheduler is not accepting transactions")]
    Unavailable { txn_id: u64 },

    /// The task running the work function panicked. The open transaction,
    /// if any, was rolled back.
    #[error("transaction {txn_id} aborted: {reason}")]
    Aborted { txn_id: u64, reason: String },
}

impl TxnError {
    /// Id of the transaction that failed.
    pub fn txn_id(&self) -> u64 {
        match self {
            Self::Begin { txn_id, .. }
            | Self::Failed { txn_id, .. }
            | Self::NotOpen { txn_id }
            | Self::Unavailable { txn_id }
            | Self::Aborted { txn_id, .. } => *txn_id,
        }
    }

    /// Causes recorded for a failed transaction, in order.
    pub fn causes(&self) -> &[BoxError] {
        match self {
            Self::Failed { errors, .. } => errors.errors(),
            _ => &[],
        }
    }
}

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite startup error: file \"{}\": {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: MultiError,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Statement(#[from] StatementError),

    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error(transparent)]
    Core(#[from] provis_core::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
