//! Gateway store trait and its SQLite implementation.

use crate::error::{StoreError, StoreResult};
use crate::repos::{ChatUserRepo, HostRepo, KeyRepo, SequenceRepo};
use crate::scheduler::{Scheduler, SchedulerOptions, TxnHandle, TxnKind};
use crate::schema::provis_tables;
use async_trait::async_trait;
use provis_core::config::StorageConfig;
use std::future::Future;

/// Combined gateway store trait.
#[async_trait]
pub trait ProvisStore: HostRepo + KeyRepo + SequenceRepo + ChatUserRepo + Send + Sync {
    /// Check database connectivity.
    async fn health_check(&self) -> StoreResult<()>;

    /// Close the database once queued work has finished.
    async fn close(&self) -> StoreResult<()>;
}

/// SQLite-backed store. Every operation is one scheduled transaction.
#[derive(Clone)]
pub struct SqliteStore {
    scheduler: Scheduler,
}

impl SqliteStore {
    /// Open (creating if needed) the database described by `config`.
    pub async fn open(config: &StorageConfig) -> StoreResult<Self> {
        let mut options = SchedulerOptions::new(&config.path, provis_tables());
        options.busy_timeout = config.busy_timeout();
        let scheduler = Scheduler::open(options).await?;
        Ok(Self { scheduler })
    }

    pub fn from_scheduler(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run `work` in a transaction that commits iff it returns `Ok`.
    ///
    /// `work` hands the transaction back together with its outcome. It runs
    /// on a spawned task, so it owns everything it uses.
    async fn within<R, F, Fut>(&self, kind: TxnKind, work: F) -> StoreResult<R>
    where
        F: FnOnce(TxnHandle) -> Fut + Send + 'static,
        Fut: Future<Output = (TxnHandle, StoreResult<R>)> + Send + 'static,
        R: Send + 'static,
    {
        let result = self
            .scheduler
            .submit(kind, move |txn| async move {
                let (txn, outcome) = work(txn).await;
                txn.complete(outcome).await
            })
            .await;
        result.map_err(StoreError::from)
    }
}

#[async_trait]
impl ProvisStore for SqliteStore {
    async fn health_check(&self) -> StoreResult<()> {
        self.within(TxnKind::Deferred, |mut txn| async move {
            let outcome = txn.run_statement("SELECT 1").await.map(|_| ());
            (txn, outcome)
        })
        .await
    }

    async fn close(&self) -> StoreResult<()> {
        self.scheduler.close().await
    }
}

// Implement the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::seq_next;
    use serde_json::Value;

    #[async_trait]
    impl HostRepo for SqliteStore {
        async fn etchosts(&self) -> StoreResult<Vec<EtcHostRow>> {
            self.within(TxnKind::Deferred, |mut txn| async move {
                let outcome = async {
                    let rows = sqlx::query_as::<_, EtcHostRow>(
                        "SELECT ipaddr, hostname, environ FROM etchosts ORDER BY ipaddr",
                    )
                    .fetch_all(txn.conn()?)
                    .await?;
                    Ok::<_, StoreError>(rows)
                }
                .await;
                (txn, outcome)
            })
            .await
        }

        async fn upsert_etchost(&self, row: &EtcHostRow) -> StoreResult<()> {
            let row = row.clone();
            self.within(TxnKind::Immediate, move |mut txn| async move {
                let outcome = async {
                    sqlx::query(
                        "INSERT OR REPLACE INTO etchosts (ipaddr, hostname, environ) VALUES (?, ?, ?)",
                    )
                    .bind(&row.ipaddr)
                    .bind(&row.hostname)
                    .bind(&row.environ)
                    .execute(txn.conn()?)
                    .await?;
                    Ok::<_, StoreError>(())
                }
                .await;
                (txn, outcome)
            })
            .await
        }

        async fn hostid_pubkey(&self, hostid: &str) -> StoreResult<Option<String>> {
            let hostid = hostid.to_string();
            self.within(TxnKind::Deferred, move |mut txn| async move {
                let outcome = async {
                    let row = sqlx::query_as::<_, HostIdRow>(
                        "SELECT hostid, hostname, pubkey FROM hostid WHERE hostid = ?",
                    )
                    .bind(&hostid)
                    .fetch_optional(txn.conn()?)
                    .await?;
                    Ok::<_, StoreError>(row.map(|r| r.pubkey))
                }
                .await;
                (txn, outcome)
            })
            .await
        }

        async fn register_hostid(
            &self,
            hostid: &str,
            hostname: &str,
            pubkey: &str,
        ) -> StoreResult<()> {
            let row = HostIdRow {
                hostid: hostid.to_string(),
                hostname: hostname.to_string(),
                pubkey: pubkey.to_string(),
            };
            self.within(TxnKind::Immediate, move |mut txn| async move {
                let outcome = async {
                    sqlx::query(
                        "INSERT OR REPLACE INTO hostid (hostid, hostname, pubkey) VALUES (?, ?, ?)",
                    )
                    .bind(&row.hostid)
                    .bind(&row.hostname)
                    .bind(&row.pubkey)
                    .execute(txn.conn()?)
                    .await?;
                    Ok::<_, StoreError>(())
                }
                .await;
                (txn, outcome)
            })
            .await
        }
    }

    #[async_trait]
    impl KeyRepo for SqliteStore {
        async fn get_key(&self, uuid: &str) -> StoreResult<Option<KeyRow>> {
            let uuid = uuid.to_string();
            self.within(TxnKind::Deferred, move |mut txn| async move {
                let outcome = async {
                    let row = sqlx::query_as::<_, KeyRow>(
                        "SELECT uuid, alias, ssh_key FROM keys WHERE uuid = ?",
                    )
                    .bind(&uuid)
                    .fetch_optional(txn.conn()?)
                    .await?;
                    Ok::<_, StoreError>(row)
                }
                .await;
                (txn, outcome)
            })
            .await
        }

        async fn add_key(&self, key: &KeyRow) -> StoreResult<()> {
            let key = key.clone();
            self.within(TxnKind::Immediate, move |mut txn| async move {
                let outcome = async {
                    let conn = txn.conn()?;
                    let existing: Option<String> =
                        sqlx::query_scalar("SELECT uuid FROM keys WHERE uuid = ?")
                            .bind(&key.uuid)
                            .fetch_optional(&mut *conn)
                            .await?;
                    if existing.is_some() {
                        return Err(StoreError::AlreadyExists(format!(
                            "key for machine {}",
                            key.uuid
                        )));
                    }

                    sqlx::query("INSERT INTO keys (uuid, alias, ssh_key) VALUES (?, ?, ?)")
                        .bind(&key.uuid)
                        .bind(&key.alias)
                        .bind(&key.ssh_key)
                        .execute(&mut *conn)
                        .await?;
                    Ok::<_, StoreError>(())
                }
                .await;
                (txn, outcome)
            })
            .await
        }
    }

    #[async_trait]
    impl SequenceRepo for SqliteStore {
        async fn next_in_sequence(&self, name: &str) -> StoreResult<i64> {
            let name = name.to_string();
            self.within(TxnKind::Immediate, move |mut txn| async move {
                let outcome = seq_next(&mut txn, &name).await;
                (txn, outcome)
            })
            .await
        }
    }

    #[async_trait]
    impl ChatUserRepo for SqliteStore {
        async fn load_chat_user(&self, id: i64, from: &Value) -> StoreResult<ChatUser> {
            let from = from.clone();
            self.within(TxnKind::Immediate, move |mut txn| async move {
                let outcome = async {
                    let conn = txn.conn()?;
                    let row = sqlx::query_as::<_, ChatUserRow>(
                        "SELECT id, json, allow, notified FROM chat_user WHERE id = ?",
                    )
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await?;
                    if let Some(row) = row {
                        return ChatUser::try_from(row);
                    }

                    sqlx::query("INSERT INTO chat_user (id, json) VALUES (?, ?)")
                        .bind(id)
                        .bind(serde_json::to_string(&from)?)
                        .execute(&mut *conn)
                        .await?;
                    tracing::info!(chat_user = id, "new chat user recorded");
                    Ok(ChatUser::new(id, from))
                }
                .await;
                (txn, outcome)
            })
            .await
        }
    }
}
