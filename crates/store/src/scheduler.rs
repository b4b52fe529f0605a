//! Transaction scheduler over a single SQLite connection.
//!
//! SQLite tolerates one live transaction per connection. The scheduler owns
//! that connection on a dedicated task and lends it to at most one
//! transaction at a time, in strict submission order:
//!
//! 1. `submit` assigns an id and enqueues the request immediately, so FIFO
//!    order is call order even before the returned future is polled.
//! 2. The worker issues `BEGIN IMMEDIATE` / `BEGIN DEFERRED` and hands the
//!    connection to the caller's work function inside a [`TxnHandle`]. The
//!    work runs on its own task, so it makes progress even while the
//!    submitter is awaiting something else.
//! 3. [`TxnHandle::finish`] returns the connection; the worker issues
//!    `COMMIT` or `ROLLBACK`, begins the next queued transaction, and only
//!    then reports the outcome back to the finishing caller.
//!
//! There is no per-transaction timeout: a work function that never finishes
//! stalls the queue.

use crate::error::{StatementError, StoreError, StoreResult, TxnError};
use crate::schema::TableDecl;
use provis_core::{BoxError, MultiError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteQueryResult};
use sqlx::{Connection, SqliteConnection};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Begin mode for a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnKind {
    /// Takes the write lock at `BEGIN`.
    Immediate,
    /// Takes locks lazily on first access.
    Deferred,
}

impl TxnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Deferred => "deferred",
        }
    }

    fn begin_statement(&self) -> &'static str {
        match self {
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Deferred => "BEGIN DEFERRED",
        }
    }
}

/// Scheduler lifecycle. Every state except `Open` is visited at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Preopen,
    Opening,
    SetJournalMode,
    InitTables,
    Open,
    Closing,
    Closed,
    Error,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preopen => "preopen",
            Self::Opening => "opening",
            Self::SetJournalMode => "set_journal_mode",
            Self::InitTables => "init_tables",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }

    fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::Preopen | Self::Opening | Self::SetJournalMode | Self::InitTables
        )
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how to open the storage connection.
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    pub path: PathBuf,
    pub tables: Vec<TableDecl>,
    pub busy_timeout: Duration,
}

impl SchedulerOptions {
    pub fn new(path: impl Into<PathBuf>, tables: Vec<TableDecl>) -> Self {
        Self {
            path: path.into(),
            tables,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

struct Queued {
    id: u64,
    kind: TxnKind,
    admit: oneshot::Sender<Result<TxnHandle, TxnError>>,
}

enum Command {
    Txn(Queued),
    Close(oneshot::Sender<StoreResult<()>>),
}

/// The connection coming back from a transaction.
struct LeaseReturn {
    conn: SqliteConnection,
    commit: bool,
    /// `None` when the handle was dropped without `finish`.
    reply: Option<oneshot::Sender<Result<(), StatementError>>>,
}

struct Shared {
    queue: mpsc::UnboundedSender<Command>,
    next_txn_id: AtomicU64,
    state: Arc<watch::Sender<SchedulerState>>,
    path: PathBuf,
}

/// Cloneable handle to the transaction scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Shared>,
}

impl Scheduler {
    /// Open the connection, apply pragmas and tables, and return once the
    /// scheduler is ready. Any setup failure is returned and leaves the
    /// scheduler unusable.
    pub async fn open(options: SchedulerOptions) -> StoreResult<Self> {
        let (scheduler, opened) = Self::start(options);
        opened.await.map_err(|_| {
            StoreError::InvalidState("scheduler setup task ended unexpectedly".to_string())
        })??;
        Ok(scheduler)
    }

    /// Start opening in the background and return immediately.
    ///
    /// Transactions submitted before setup completes wait in the queue and
    /// run once the scheduler is open. Setup failures are logged; use
    /// [`Scheduler::wait_open`] to observe them.
    pub fn spawn(options: SchedulerOptions) -> Self {
        Self::start(options).0
    }

    fn start(options: SchedulerOptions) -> (Self, oneshot::Receiver<StoreResult<()>>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SchedulerState::Preopen);
        let state = Arc::new(state_tx);
        let (opened_tx, opened_rx) = oneshot::channel();

        let worker = Worker {
            options: options.clone(),
            queue: queue_rx,
            state: state.clone(),
        };
        tokio::spawn(worker.run(opened_tx));

        let scheduler = Self {
            inner: Arc::new(Shared {
                queue: queue_tx,
                next_txn_id: AtomicU64::new(1),
                state,
                path: options.path,
            }),
        };
        (scheduler, opened_rx)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    pub fn path(&self) -> &std::path::Path {
        &self.inner.path
    }

    /// Wait until setup has finished, successfully or not.
    pub async fn wait_open(&self) -> StoreResult<()> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| !s.is_setup())
            .await
            .map(|s| *s)
            .map_err(|_| StoreError::InvalidState("scheduler task is gone".to_string()))?;
        match state {
            SchedulerState::Open => Ok(()),
            other => Err(StoreError::InvalidState(format!(
                "scheduler is {other}, not open"
            ))),
        }
    }

    /// Queue a transaction.
    ///
    /// The request is enqueued before this returns, and once admitted
    /// `work` runs on its own task whether or not the returned future is
    /// polled. `work` receives a [`TxnHandle`] holding the connection and
    /// must end by calling [`TxnHandle::finish`] (or
    /// [`TxnHandle::complete`]). The returned future resolves to the
    /// committed result or to an error carrying the transaction id.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit<R, F, Fut>(
        &self,
        kind: TxnKind,
        work: F,
    ) -> impl Future<Output = Result<R, TxnError>> + use<R, F, Fut>
    where
        F: FnOnce(TxnHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Finished<R>> + Send + 'static,
        R: Send + 'static,
    {
        let completion = self.submit_completion(kind, work);
        async move { completion.await.into_result() }
    }

    /// Like [`Scheduler::submit`], but reports the aggregated error and any
    /// results side by side, so results of a transaction whose commit
    /// failed (or that was committed alongside a work error) are not lost.
    pub fn submit_completion<R, F, Fut>(
        &self,
        kind: TxnKind,
        work: F,
    ) -> impl Future<Output = Completion<R>> + use<R, F, Fut>
    where
        F: FnOnce(TxnHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Finished<R>> + Send + 'static,
        R: Send + 'static,
    {
        let txn_id = self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let (admit_tx, admit_rx) = oneshot::channel();
        let accepting = !matches!(
            self.state(),
            SchedulerState::Closing | SchedulerState::Closed | SchedulerState::Error
        );
        let enqueued = accepting
            && self
                .inner
                .queue
                .send(Command::Txn(Queued {
                    id: txn_id,
                    kind,
                    admit: admit_tx,
                }))
                .is_ok();
        tracing::trace!(txn_id, kind = kind.as_str(), enqueued, "transaction queued");

        // Admission must not depend on the caller polling: an idle future
        // for an earlier transaction would otherwise hold up the queue.
        let task = enqueued.then(|| {
            tokio::spawn(async move {
                match admit_rx.await {
                    Ok(Ok(handle)) => work(handle).await.into_completion(),
                    Ok(Err(e)) => Completion::failed(e),
                    Err(_) => Completion::failed(TxnError::Unavailable { txn_id }),
                }
            })
        });

        async move {
            let Some(task) = task else {
                return Completion::failed(TxnError::Unavailable { txn_id });
            };
            match task.await {
                Ok(completion) => completion,
                Err(e) => {
                    tracing::error!(txn_id, error = %e, "transaction task aborted");
                    Completion::failed(TxnError::Aborted {
                        txn_id,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    /// Close the connection after every transaction already queued.
    ///
    /// Only valid while open; a second call fails with `InvalidState`.
    pub async fn close(&self) -> StoreResult<()> {
        let mut previous = SchedulerState::Open;
        let accepted = self.inner.state.send_if_modified(|state| {
            previous = *state;
            if *state == SchedulerState::Open {
                *state = SchedulerState::Closing;
                true
            } else {
                false
            }
        });
        if !accepted {
            return Err(StoreError::InvalidState(format!(
                "close() called while {previous}"
            )));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .queue
            .send(Command::Close(reply_tx))
            .map_err(|_| StoreError::InvalidState("scheduler task is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| StoreError::InvalidState("scheduler task is gone".to_string()))?
    }
}

/// A transaction admitted by the scheduler.
///
/// Holds the connection while the transaction is open. `finish` consumes
/// the handle, so the connection cannot be used afterwards and a second
/// finish cannot be expressed. Dropping the handle without finishing rolls
/// the transaction back.
pub struct TxnHandle {
    id: u64,
    kind: TxnKind,
    conn: Option<SqliteConnection>,
    lease: Option<oneshot::Sender<LeaseReturn>>,
}

impl TxnHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TxnKind {
        self.kind
    }

    /// The connection, valid only while the transaction is open.
    pub fn conn(&mut self) -> Result<&mut SqliteConnection, TxnError> {
        self.conn
            .as_mut()
            .ok_or(TxnError::NotOpen { txn_id: self.id })
    }

    /// Run one statement without bound parameters.
    pub async fn run_statement(&mut self, sql: &str) -> StoreResult<SqliteQueryResult> {
        let conn = self.conn()?;
        Ok(sqlx::query(sql).execute(&mut *conn).await?)
    }

    /// End the transaction.
    ///
    /// Issues `COMMIT` when `commit` is set and `ROLLBACK` otherwise,
    /// regardless of `outcome`; rolling back on error is the caller's call.
    /// A failing commit/rollback is recorded after the work error, if any.
    pub async fn finish<R>(self, commit: bool, outcome: Result<R, BoxError>) -> Finished<R> {
        match outcome {
            Ok(results) => self.finish_with(commit, None, Some(results)).await,
            Err(e) => self.finish_with(commit, Some(e), None).await,
        }
    }

    /// End the transaction reporting a work error and results together.
    pub async fn finish_with<R>(
        mut self,
        commit: bool,
        error: Option<BoxError>,
        results: Option<R>,
    ) -> Finished<R> {
        let mut errors: Vec<BoxError> = error.into_iter().collect();

        match (self.conn.take(), self.lease.take()) {
            (Some(conn), Some(lease)) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let returned = lease.send(LeaseReturn {
                    conn,
                    commit,
                    reply: Some(reply_tx),
                });
                match returned {
                    Ok(()) => match reply_rx.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => errors.push(Box::new(e)),
                        Err(_) => errors.push(Box::new(TxnError::Unavailable { txn_id: self.id })),
                    },
                    Err(_) => errors.push(Box::new(TxnError::Unavailable { txn_id: self.id })),
                }
            }
            _ => errors.push(Box::new(TxnError::NotOpen { txn_id: self.id })),
        }

        Finished {
            txn_id: self.id,
            errors,
            results,
        }
    }

    /// Commit on `Ok`, roll back on `Err`.
    pub async fn complete<R, E>(self, outcome: Result<R, E>) -> Finished<R>
    where
        E: Into<BoxError>,
    {
        let commit = outcome.is_ok();
        self.finish(commit, outcome.map_err(Into::into)).await
    }
}

impl Drop for TxnHandle {
    fn drop(&mut self) {
        if let (Some(conn), Some(lease)) = (self.conn.take(), self.lease.take()) {
            tracing::warn!(
                txn_id = self.id,
                "transaction dropped without finish, rolling back"
            );
            let _ = lease.send(LeaseReturn {
                conn,
                commit: false,
                reply: None,
            });
        }
    }
}

impl fmt::Debug for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

/// Proof that a transaction was finished, carrying its outcome.
#[must_use = "return the finished transaction from the work function"]
pub struct Finished<R> {
    txn_id: u64,
    errors: Vec<BoxError>,
    results: Option<R>,
}

impl<R> Finished<R> {
    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    fn into_completion(self) -> Completion<R> {
        let txn_id = self.txn_id;
        Completion {
            txn_id,
            error: MultiError::from_list(self.errors)
                .map(|errors| TxnError::Failed { txn_id, errors }),
            results: self.results,
        }
    }
}

/// Outcome of a transaction: the aggregated error, if any, and whatever
/// results the work function reported.
#[derive(Debug)]
pub struct Completion<R> {
    pub txn_id: u64,
    pub error: Option<TxnError>,
    pub results: Option<R>,
}

impl<R> Completion<R> {
    fn failed(error: TxnError) -> Self {
        Self {
            txn_id: error.txn_id(),
            error: Some(error),
            results: None,
        }
    }

    /// `Ok` only when nothing failed.
    pub fn into_result(self) -> Result<R, TxnError> {
        match (self.error, self.results) {
            (Some(error), _) => Err(error),
            (None, Some(results)) => Ok(results),
            (None, None) => Err(TxnError::NotOpen {
                txn_id: self.txn_id,
            }),
        }
    }
}

/// What the serve loop does next.
enum Step {
    /// A transaction whose begin statement has already been issued.
    Admitted(Queued, Result<(), sqlx::Error>),
    Close(oneshot::Sender<StoreResult<()>>),
}

struct Worker {
    options: SchedulerOptions,
    queue: mpsc::UnboundedReceiver<Command>,
    state: Arc<watch::Sender<SchedulerState>>,
}

impl Worker {
    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    async fn run(mut self, opened: oneshot::Sender<StoreResult<()>>) {
        let conn = match self.setup().await {
            Ok(conn) => conn,
            Err(e) => {
                self.set_state(SchedulerState::Error);
                tracing::error!(error = %e, "storage setup failed");
                let _ = opened.send(Err(e));
                return;
            }
        };

        self.set_state(SchedulerState::Open);
        tracing::info!(path = %self.options.path.display(), "storage open");
        let _ = opened.send(Ok(()));

        self.serve(conn).await;
    }

    async fn setup(&self) -> StoreResult<SqliteConnection> {
        let path = &self.options.path;
        self.set_state(SchedulerState::Opening);

        let open_error = |source: MultiError| StoreError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return Err(open_error(MultiError::single(e.into())));
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(self.options.busy_timeout);
        let mut conn = SqliteConnection::connect_with(&opts)
            .await
            .map_err(|e| open_error(MultiError::single(StatementError::new("open", e).into())))?;

        if let Err(e) = self.configure(&mut conn).await {
            let mut errors: MultiError = MultiError::single(e.into());
            if let Err(close_err) = conn.close().await {
                tracing::warn!(error = %close_err, "closing half-open database failed");
                errors.push(StatementError::new("close", close_err).into());
            }
            return Err(open_error(errors));
        }

        Ok(conn)
    }

    async fn configure(&self, conn: &mut SqliteConnection) -> Result<(), StatementError> {
        self.set_state(SchedulerState::SetJournalMode);
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await
            .map_err(|e| StatementError::new("set journal mode to WAL", e))?;

        self.set_state(SchedulerState::InitTables);
        for table in &self.options.tables {
            let q = table.create_statement();
            sqlx::query(&q)
                .execute(&mut *conn)
                .await
                .map_err(|e| StatementError::new(format!("create table \"{}\"", table.name()), e))?;
        }
        Ok(())
    }

    async fn begin(conn: &mut SqliteConnection, queued: &Queued) -> Result<(), sqlx::Error> {
        sqlx::query(queued.kind.begin_statement())
            .execute(&mut *conn)
            .await
            .map(|_| ())
    }

    /// Take the next command without waiting and, if it is a transaction,
    /// issue its begin statement.
    async fn admit_next(&mut self, conn: &mut SqliteConnection) -> Option<Step> {
        match self.queue.try_recv().ok()? {
            Command::Txn(queued) => {
                let begun = Self::begin(conn, &queued).await;
                Some(Step::Admitted(queued, begun))
            }
            Command::Close(reply) => Some(Step::Close(reply)),
        }
    }

    async fn serve(mut self, mut conn: SqliteConnection) {
        let mut next: Option<Step> = None;

        loop {
            let step = match next.take() {
                Some(step) => step,
                None => match self.queue.recv().await {
                    Some(Command::Txn(queued)) => {
                        let begun = Self::begin(&mut conn, &queued).await;
                        Step::Admitted(queued, begun)
                    }
                    Some(Command::Close(reply)) => Step::Close(reply),
                    None => break,
                },
            };

            let queued = match step {
                Step::Close(reply) => {
                    let _ = reply.send(self.close(conn).await);
                    return;
                }
                Step::Admitted(queued, Err(e)) => {
                    let statement = queued.kind.begin_statement();
                    tracing::warn!(txn_id = queued.id, error = %e, "{statement} failed");
                    let _ = queued.admit.send(Err(TxnError::Begin {
                        txn_id: queued.id,
                        statement,
                        source: e,
                    }));
                    continue;
                }
                Step::Admitted(queued, Ok(())) => queued,
            };

            let txn_id = queued.id;
            tracing::trace!(txn_id, kind = queued.kind.as_str(), "transaction open");

            let (lease_tx, lease_rx) = oneshot::channel();
            let handle = TxnHandle {
                id: txn_id,
                kind: queued.kind,
                conn: Some(conn),
                lease: Some(lease_tx),
            };
            // A submitter that went away drops the handle, which rolls back.
            let _ = queued.admit.send(Ok(handle));

            let LeaseReturn {
                conn: returned,
                commit,
                reply,
            } = match lease_rx.await {
                Ok(lease) => lease,
                Err(_) => {
                    tracing::error!(txn_id, "connection lost by transaction");
                    self.set_state(SchedulerState::Error);
                    return;
                }
            };
            conn = returned;

            let statement = if commit { "COMMIT" } else { "ROLLBACK" };
            let finished = sqlx::query(statement)
                .execute(&mut conn)
                .await
                .map(|_| ())
                .map_err(|e| StatementError::new(format!("transaction {txn_id} {statement}"), e));
            if finished.is_err() && commit {
                // Leave the connection outside any transaction for the next one.
                if let Err(e) = sqlx::query("ROLLBACK").execute(&mut conn).await {
                    tracing::debug!(txn_id, error = %e, "rollback after failed commit");
                }
            }
            tracing::trace!(txn_id, statement, ok = finished.is_ok(), "transaction finished");

            // The next transaction begins before the previous caller hears back.
            next = self.admit_next(&mut conn).await;

            match reply {
                Some(reply) => {
                    let _ = reply.send(finished);
                }
                None => {
                    if let Err(e) = finished {
                        tracing::warn!(txn_id, error = %e, "rollback of abandoned transaction failed");
                    }
                }
            }
        }

        // Every scheduler handle is gone.
        if let Err(e) = conn.close().await {
            tracing::warn!(error = %e, "closing database failed");
        }
        self.set_state(SchedulerState::Closed);
    }

    async fn close(&self, conn: SqliteConnection) -> StoreResult<()> {
        match conn.close().await {
            Ok(()) => {
                self.set_state(SchedulerState::Closed);
                tracing::info!(path = %self.options.path.display(), "storage closed");
                Ok(())
            }
            Err(e) => {
                self.set_state(SchedulerState::Error);
                Err(StoreError::InvalidState(format!("closing database: {e}")))
            }
        }
    }
}
