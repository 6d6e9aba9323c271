//! Reader-side command handling: parse, check preconditions, hand off.

use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::output::OutputSink;
use crate::protocol::{self, BOOT, Command, Request};
use crate::query::{self, PendingQuery};
use crate::report::Reporter;
use crate::state::{Discard, StateStore};
use crate::worker::{Handle, Task, WorkerPool};

/// What the reader decided to do with one input line.
pub enum Action<H> {
    Boot,
    Connect { conn: i32 },
    Begin { conn: i32, handle: Arc<H> },
    Commit { conn: i32, handle: Arc<H> },
    Rollback { conn: i32, handle: Arc<H> },
    Query { query: PendingQuery, handle: Arc<H> },
    Close { conn: i32 },
    /// Accepted, nothing to do.
    Skip,
}

/// Validates a request line against the current connection state.
///
/// A successful `connect` plan holds a reservation on its id; the task that
/// carries it out must register or abandon it.
pub fn plan<H>(line: &str, store: &StateStore<H>) -> Result<Action<H>> {
    let (conn, command, fields) = match protocol::parse_request(line)? {
        Request::Boot => return Ok(Action::Boot),
        Request::Command {
            conn,
            command,
            fields,
        } => (conn, command, fields),
    };
    let fail = |message: &str| GatewayError::state(message).with_conn(conn);
    let action = match command {
        Command::Connect => {
            if !store.reserve(conn) {
                return Err(fail("preventing double connect"));
            }
            Action::Connect { conn }
        }
        Command::Query => {
            let handle = store.get(conn).ok_or_else(|| fail("query before connect"))?;
            let fields = protocol::parse_query_fields(conn, &fields)?;
            let sql = query::rewrite_placeholders(&fields.sql, fields.args.len())
                .map_err(|err| err.with_conn(conn).with_query(&fields.query_id))?;
            Action::Query {
                query: PendingQuery {
                    conn,
                    query_id: fields.query_id,
                    sql,
                    args: fields.args,
                },
                handle,
            }
        }
        Command::Begin => {
            let handle = store.get(conn).ok_or_else(|| fail("begin before connect"))?;
            if store.in_txn(conn) {
                return Err(fail("preventing double begin"));
            }
            Action::Begin { conn, handle }
        }
        Command::Commit => {
            if !store.in_txn(conn) {
                return Err(fail("commit before begin"));
            }
            let handle = store
                .get(conn)
                .ok_or_else(|| fail("connection null at commit"))?;
            Action::Commit { conn, handle }
        }
        Command::Rollback => match store.get(conn) {
            Some(handle) if store.in_txn(conn) => Action::Rollback { conn, handle },
            _ => Action::Skip,
        },
        Command::Close => Action::Close { conn },
    };
    Ok(action)
}

/// Closes a connection inline. A handle still inside a transaction is
/// discarded rather than returned to the idle set.
pub fn close<H: Discard>(store: &StateStore<H>, conn: i32) {
    let in_txn = store.end_txn(conn);
    let Some(handle) = store.remove(conn) else {
        return;
    };
    if in_txn {
        handle.discard();
    }
    tracing::debug!(conn, in_txn, "connection closed by client");
}

/// Reader-side entry point, called once per input line in order.
pub struct Dispatcher {
    store: Arc<StateStore<Handle>>,
    out: OutputSink,
    reporter: Reporter<Handle>,
    pool: WorkerPool,
}

impl Dispatcher {
    pub fn new(store: Arc<StateStore<Handle>>, out: OutputSink, pool: WorkerPool) -> Self {
        Self {
            reporter: Reporter::new(store.clone(), out.clone()),
            store,
            out,
            pool,
        }
    }

    pub fn on_input(&self, line: &str) {
        let action = match plan(line, &self.store) {
            Ok(action) => action,
            Err(err) => {
                self.reporter.report(err);
                return;
            }
        };
        let task = match action {
            Action::Boot => {
                self.out.normal(BOOT);
                return;
            }
            Action::Close { conn } => {
                close(&self.store, conn);
                return;
            }
            Action::Skip => return,
            Action::Connect { conn } => Task::Connect { conn },
            Action::Begin { conn, handle } => Task::Begin { conn, handle },
            Action::Commit { conn, handle } => Task::Commit { conn, handle },
            Action::Rollback { conn, handle } => Task::Rollback { conn, handle },
            Action::Query { query, handle } => Task::Query { query, handle },
        };
        self.pool.submit(task);
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
