use std::sync::Arc;

use crate::error::{ErrorKind, GatewayError};
use crate::output::OutputSink;
use crate::protocol::{closed_line, closed_notice, diagnostic_line, error_line};
use crate::state::{Discard, StateStore};

/// Turns errors into output lines; the only place errors leave the gateway.
pub struct Reporter<H> {
    store: Arc<StateStore<H>>,
    out: OutputSink,
}

impl<H> Clone for Reporter<H> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            out: self.out.clone(),
        }
    }
}

impl<H: Discard> Reporter<H> {
    pub fn new(store: Arc<StateStore<H>>, out: OutputSink) -> Self {
        Self { store, out }
    }

    pub fn report(&self, err: GatewayError) {
        if err.kind == ErrorKind::Closed {
            self.connection_lost(err.conn);
            return;
        }
        tracing::debug!(
            kind = %err.kind,
            conn = ?err.conn,
            query = ?err.query,
            "{}",
            err.message
        );
        self.out
            .error(error_line(err.conn, err.query.as_deref(), &err.message));
        if err.traced() {
            let detail = err.detail.as_deref().unwrap_or(&err.message);
            self.out.diagnostic(diagnostic_line(detail));
        }
    }

    /// Evicts the connection and emits the standard closed pair, once per call.
    pub fn connection_lost(&self, conn: Option<i32>) {
        if let Some(id) = conn {
            if let Some(handle) = self.store.remove(id) {
                handle.discard();
            }
            tracing::warn!(conn = id, "connection closed unexpectedly");
        }
        self.out.error(closed_line(conn));
        self.out.diagnostic(closed_notice(conn));
    }
}
