//! Persistent state for the provisioning gateway.
//!
//! This crate provides:
//! - A transaction scheduler serializing work over one SQLite connection
//! - Table declarations applied at open
//! - Repository traits and the `SqliteStore` implementation

pub mod error;
pub mod models;
pub mod repos;
pub mod scheduler;
pub mod schema;
pub mod store;

pub use error::{StatementError, StoreError, StoreResult, TxnError};
pub use scheduler::{
    Completion, Finished, Scheduler, SchedulerOptions, SchedulerState, TxnHandle, TxnKind,
};
pub use schema::{TableDecl, provis_tables};
pub use store::{ProvisStore, SqliteStore};
