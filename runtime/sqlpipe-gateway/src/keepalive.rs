//! Periodic validation of registered connections.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout};

use crate::report::Reporter;
use crate::state::{Discard, StateStore};
use crate::worker::Handle;

/// What the monitor needs to know about a handle.
pub trait Liveness: Discard + Send + Sync + 'static {
    fn is_closed(&self) -> bool;

    /// Resolves to whether a round trip to the server succeeded.
    fn probe(&self) -> impl Future<Output = bool> + Send;
}

impl Liveness for Handle {
    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn probe(&self) -> impl Future<Output = bool> + Send {
        async move { self.ping().await.is_ok() }
    }
}

/// One pass over every registered connection.
///
/// Already-closed handles are dropped quietly; a failed or slow probe is
/// reported as an unexpected close.
pub async fn sweep<H: Liveness>(
    store: &StateStore<H>,
    reporter: &Reporter<H>,
    probe_timeout: Duration,
) {
    for conn in store.ids() {
        let Some(handle) = store.get(conn) else {
            continue;
        };
        if handle.is_closed() {
            if let Some(handle) = store.remove(conn) {
                handle.discard();
            }
            tracing::debug!(conn, "keepalive dropped a closed connection");
            continue;
        }
        let alive = matches!(timeout(probe_timeout, handle.probe()).await, Ok(true));
        if !alive {
            reporter.connection_lost(Some(conn));
        }
    }
}

/// Starts the monitor; the first sweep happens one `period` from now.
pub fn spawn<H: Liveness>(
    runtime: &runtime::Handle,
    period: Duration,
    probe_timeout: Duration,
    store: Arc<StateStore<H>>,
    reporter: Reporter<H>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        loop {
            ticks.tick().await;
            sweep(&store, &reporter, probe_timeout).await;
        }
    })
}
