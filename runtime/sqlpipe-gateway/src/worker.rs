//! Worker tasks and the bounded pool that runs them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlpipe_db::{AcquireError, AsyncPooled, CancelToken, PgConn, PgPool};
use tokio::runtime;
use tokio::sync::{Notify, Semaphore};

use crate::error::{ErrorKind, GatewayError, Result, driver_error};
use crate::output::OutputSink;
use crate::protocol::{Command, ack};
use crate::query::{PendingQuery, QueryEngine};
use crate::report::Reporter;
use crate::state::{Discard, StateStore};

/// A pooled PostgreSQL connection as held by the state store.
pub type Handle = AsyncPooled<PgConn>;

/// One unit of work handed from the reader to the pool.
pub enum Task {
    Connect { conn: i32 },
    Begin { conn: i32, handle: Arc<Handle> },
    Commit { conn: i32, handle: Arc<Handle> },
    Rollback { conn: i32, handle: Arc<Handle> },
    Query { query: PendingQuery, handle: Arc<Handle> },
}

impl Task {
    pub fn conn(&self) -> i32 {
        match self {
            Task::Connect { conn }
            | Task::Begin { conn, .. }
            | Task::Commit { conn, .. }
            | Task::Rollback { conn, .. } => *conn,
            Task::Query { query, .. } => query.conn,
        }
    }
}

/// Everything a task needs: store, provider, output and the query engine.
pub struct Worker {
    store: Arc<StateStore<Handle>>,
    out: OutputSink,
    reporter: Reporter<Handle>,
    provider: Arc<PgPool>,
    engine: QueryEngine,
    shutdown: CancelToken,
}

impl Worker {
    pub fn new(
        store: Arc<StateStore<Handle>>,
        out: OutputSink,
        provider: Arc<PgPool>,
        statement_timeout: Option<Duration>,
        shutdown: CancelToken,
    ) -> Self {
        Self {
            reporter: Reporter::new(store.clone(), out.clone()),
            engine: QueryEngine::new(out.clone(), statement_timeout),
            store,
            out,
            provider,
            shutdown,
        }
    }

    /// Runs the task; any failure is reported, never returned.
    pub async fn run(&self, task: Task) {
        let conn = task.conn();
        if let Err(err) = self.execute(task).await {
            self.reporter.report(err.with_conn(conn));
        }
    }

    async fn execute(&self, task: Task) -> Result<()> {
        match task {
            Task::Connect { conn } => self.connect(conn).await,
            Task::Begin { conn, handle } => {
                handle
                    .client()
                    .batch_execute("BEGIN")
                    .await
                    .map_err(|err| driver_error(&err))?;
                acknowledge_begin(&self.store, &self.out, conn, &*handle);
                Ok(())
            }
            Task::Commit { conn, handle } => {
                handle
                    .client()
                    .batch_execute("COMMIT")
                    .await
                    .map_err(|err| driver_error(&err))?;
                self.store.end_txn(conn);
                self.out.normal(ack(conn, Command::Commit));
                Ok(())
            }
            Task::Rollback { conn, handle } => {
                self.store.end_txn(conn);
                handle
                    .client()
                    .batch_execute("ROLLBACK")
                    .await
                    .map_err(|err| driver_error(&err))?;
                self.out.normal(ack(conn, Command::Rollback));
                Ok(())
            }
            Task::Query { query, handle } => self.engine.execute(query, handle).await,
        }
    }

    async fn connect(&self, conn: i32) -> Result<()> {
        match self.provider.acquire(Some(&self.shutdown)).await {
            Ok(handle) => {
                self.store.register(conn, Arc::new(handle));
                tracing::debug!(conn, "connection registered");
                self.out.normal(ack(conn, Command::Connect));
                Ok(())
            }
            Err(err) => {
                self.store.abandon(conn);
                Err(match err {
                    AcquireError::Timeout => GatewayError::connect_timeout(),
                    other => GatewayError::from_error(ErrorKind::Execution, &other),
                })
            }
        }
    }
}

/// Flags the transaction and acks it. A connection closed while `BEGIN` was
/// in flight gets no ack, and its handle is discarded since the server side
/// is still inside the transaction.
fn acknowledge_begin<H: Discard>(store: &StateStore<H>, out: &OutputSink, conn: i32, handle: &H) {
    if store.begin(conn) {
        out.normal(ack(conn, Command::Begin));
    } else {
        tracing::warn!(conn, "connection closed before BEGIN completed");
        handle.discard();
    }
}

struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

/// Fixed number of concurrently running tasks over an unbounded backlog.
pub struct WorkerPool {
    runtime: runtime::Handle,
    permits: Arc<Semaphore>,
    pending: Arc<Pending>,
    worker: Arc<Worker>,
}

impl WorkerPool {
    pub fn new(runtime: runtime::Handle, threads: usize, worker: Worker) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(threads.max(1))),
            pending: Arc::new(Pending {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            worker: Arc::new(worker),
        }
    }

    /// Queues the task without blocking the caller.
    pub fn submit(&self, task: Task) {
        let permits = self.permits.clone();
        let pending = self.pending.clone();
        let worker = self.worker.clone();
        pending.count.fetch_add(1, Ordering::SeqCst);
        self.runtime.spawn(async move {
            if let Ok(_permit) = permits.acquire_owned().await {
                worker.run(task).await;
            }
            if pending.count.fetch_sub(1, Ordering::SeqCst) == 1 {
                pending.idle.notify_waiters();
            }
        });
    }

    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Blocks until every submitted task has finished or `grace` runs out.
    /// Returns whether the backlog fully drained.
    pub fn drain(&self, grace: Duration) -> bool {
        let pending = self.pending.clone();
        self.runtime.block_on(async move {
            tokio::time::timeout(grace, async {
                loop {
                    let idle = pending.idle.notified();
                    if pending.count.load(Ordering::SeqCst) == 0 {
                        return;
                    }
                    idle.await;
                }
            })
            .await
            .is_ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output;
    use sqlpipe_db::PgPoolConfig;

    fn unreachable_provider() -> Arc<PgPool> {
        let mut config = PgPoolConfig::new("postgres://nobody@127.0.0.1:1/none".to_string());
        config.connect_timeout = Duration::from_millis(200);
        config.max_wait = Duration::from_millis(200);
        Arc::new(PgPool::new(config).expect("valid dsn"))
    }

    #[test]
    fn failed_connect_releases_the_reservation() {
        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("runtime");
        let store = Arc::new(StateStore::new());
        let (sink, rx) = output::channel();
        let worker = Worker::new(
            store.clone(),
            sink,
            unreachable_provider(),
            None,
            CancelToken::new(),
        );
        let pool = WorkerPool::new(rt.handle().clone(), 2, worker);
        assert!(store.reserve(4));
        pool.submit(Task::Connect { conn: 4 });
        assert!(pool.drain(Duration::from_secs(10)));
        assert_eq!(pool.pending(), 0);
        assert!(!store.contains(4));
        assert!(store.reserve(4));
        let first = rx.try_iter().next().expect("error line");
        assert!(first.payload.starts_with("4,"), "{}", first.payload);
        assert!(!first.payload.contains("4,connect"));
    }

    #[test]
    fn cancelled_connect_is_reported_against_the_connection() {
        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("runtime");
        let store = Arc::new(StateStore::new());
        let (sink, rx) = output::channel();
        let shutdown = CancelToken::new();
        shutdown.cancel();
        let worker = Worker::new(store.clone(), sink, unreachable_provider(), None, shutdown);
        let pool = WorkerPool::new(rt.handle().clone(), 1, worker);
        store.reserve(2);
        pool.submit(Task::Connect { conn: 2 });
        assert!(pool.drain(Duration::from_secs(5)));
        let lines: Vec<String> = rx.try_iter().map(|line| line.payload).collect();
        assert_eq!(lines[0], "2,connection acquire cancelled");
        assert!(lines[1].starts_with("i,"));
    }

    #[derive(Default)]
    struct Tracked {
        discarded: std::sync::atomic::AtomicBool,
    }

    impl Discard for Tracked {
        fn discard(&self) {
            self.discarded.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn begin_is_acked_only_while_the_connection_is_registered() {
        let store = StateStore::new();
        let (sink, rx) = output::channel();
        let handle = Arc::new(Tracked::default());

        store.register(6, handle.clone());
        acknowledge_begin(&store, &sink, 6, &*handle);
        assert!(store.in_txn(6));
        assert_eq!(rx.try_recv().expect("ack").payload, "6,begin");
        assert!(!handle.discarded.load(Ordering::SeqCst));

        store.end_txn(6);
        store.remove(6);
        acknowledge_begin(&store, &sink, 6, &*handle);
        assert!(!store.in_txn(6));
        assert!(rx.try_iter().next().is_none());
        assert!(handle.discarded.load(Ordering::SeqCst));
    }

    #[test]
    fn drain_returns_immediately_when_idle() {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let (sink, _rx) = output::channel();
        let worker = Worker::new(
            Arc::new(StateStore::new()),
            sink,
            unreachable_provider(),
            None,
            CancelToken::new(),
        );
        let pool = WorkerPool::new(rt.handle().clone(), 1, worker);
        assert!(pool.drain(Duration::from_millis(10)));
    }
}
