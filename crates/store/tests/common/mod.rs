//! Common test utilities and fixtures.

use provis_core::config::StorageConfig;
use provis_store::{Scheduler, SchedulerOptions, SqliteStore, TableDecl, TxnKind};
use std::path::PathBuf;
use tempfile::TempDir;

/// A database location that is removed on drop.
#[allow(dead_code)]
pub struct TestDb {
    pub path: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestDb {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let path = temp_dir.path().join("var").join("test.sqlite3");
        Self {
            path,
            _temp_dir: temp_dir,
        }
    }

    /// Options declaring a single key/value table.
    pub fn options(&self) -> SchedulerOptions {
        let kv = TableDecl::new("kv", ["k TEXT PRIMARY KEY", "v INTEGER NOT NULL"])
            .expect("valid table");
        SchedulerOptions::new(&self.path, vec![kv])
    }

    pub async fn scheduler(&self) -> Scheduler {
        Scheduler::open(self.options())
            .await
            .expect("Failed to open scheduler")
    }

    pub async fn store(&self) -> SqliteStore {
        let config = StorageConfig {
            path: self.path.clone(),
            busy_timeout_secs: 5,
        };
        SqliteStore::open(&config)
            .await
            .expect("Failed to open store")
    }
}

/// Insert or replace a key in the `kv` table in its own transaction.
#[allow(dead_code)]
pub async fn put(scheduler: &Scheduler, k: &str, v: i64) {
    let k = k.to_string();
    scheduler
        .submit(TxnKind::Immediate, move |mut txn| async move {
            let outcome = async {
                sqlx::query("INSERT OR REPLACE INTO kv (k, v) VALUES (?, ?)")
                    .bind(&k)
                    .bind(v)
                    .execute(txn.conn()?)
                    .await?;
                Ok::<_, provis_store::StoreError>(())
            }
            .await;
            txn.complete(outcome).await
        })
        .await
        .expect("put failed");
}

/// Read a key from the `kv` table in its own transaction.
#[allow(dead_code)]
pub async fn get(scheduler: &Scheduler, k: &str) -> Option<i64> {
    let k = k.to_string();
    scheduler
        .submit(TxnKind::Deferred, move |mut txn| async move {
            let outcome = async {
                let v: Option<i64> = sqlx::query_scalar("SELECT v FROM kv WHERE k = ?")
                    .bind(&k)
                    .fetch_optional(txn.conn()?)
                    .await?;
                Ok::<_, provis_store::StoreError>(v)
            }
            .await;
            txn.complete(outcome).await
        })
        .await
        .expect("get failed")
}
