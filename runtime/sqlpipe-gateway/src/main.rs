//! `sqlpipe`: PostgreSQL access for a host process over a line protocol on
//! stdin, stdout and stderr.

mod codec;
mod config;
mod dispatch;
mod error;
mod keepalive;
mod logging;
mod output;
mod protocol;
mod query;
mod report;
mod state;
mod worker;

use std::borrow::Cow;
use std::env;
use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use sqlpipe_db::{CancelToken, PgPool};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::report::Reporter;
use crate::state::StateStore;
use crate::worker::{Worker, WorkerPool};

/// How long outstanding tasks get to finish once stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => return fatal(&err.to_string()),
    };
    if let Err(err) = config.apply_args(env::args().skip(1)) {
        return fatal(&err.to_string());
    }
    if let Err(err) = logging::init(config.log_file.as_deref(), &config.log_level) {
        return fatal(&format!("failed to initialize logging: {err}"));
    }
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => fatal(&message),
    }
}

fn fatal(message: &str) -> ExitCode {
    tracing::error!("{message}");
    eprintln!("{}", protocol::error_line(None, None, message));
    ExitCode::FAILURE
}

/// One request without its line terminator. Bytes that are not UTF-8 are
/// replaced so a malformed line is answered rather than ending input.
fn request_line(raw: &[u8]) -> Cow<'_, str> {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw)
}

fn run(config: Config) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.threads)
        .thread_name("sqlpipe-worker")
        .enable_all()
        .build()
        .map_err(|err| format!("failed to start runtime: {err}"))?;
    let provider = Arc::new(PgPool::new(config.pool_config())?);

    let (out, rx) = output::channel();
    let writer = output::spawn_stdio(rx).map_err(|err| format!("failed to start output: {err}"))?;

    let store = Arc::new(StateStore::new());
    let shutdown = CancelToken::new();
    let worker = Worker::new(
        store.clone(),
        out.clone(),
        provider.clone(),
        config.query_timeout,
        shutdown.clone(),
    );
    let pool = WorkerPool::new(runtime.handle().clone(), config.threads, worker);
    let monitor = config.keep_alive.map(|period| {
        keepalive::spawn(
            runtime.handle(),
            period,
            config.probe_timeout(),
            store.clone(),
            Reporter::new(store.clone(), out.clone()),
        )
    });
    let dispatcher = Dispatcher::new(store.clone(), out, pool);
    tracing::info!(
        threads = config.threads,
        max_connections = config.max_connections,
        keep_alive = ?config.keep_alive,
        "gateway ready"
    );

    let mut stdin = io::stdin().lock();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match stdin.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => dispatcher.on_input(&request_line(&buf)),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!(error = %err, "stdin read failed");
                break;
            }
        }
    }
    drop(stdin);

    tracing::info!(open_connections = store.len(), "stdin closed, shutting down");
    if let Some(monitor) = monitor {
        monitor.abort();
    }
    if !dispatcher.pool().drain(SHUTDOWN_GRACE) {
        tracing::warn!(
            pending = dispatcher.pool().pending(),
            "abandoning outstanding tasks"
        );
    }
    shutdown.cancel();
    drop(dispatcher);
    drop(store);
    tracing::debug!(
        in_flight = provider.in_flight(),
        idle = provider.idle_count(),
        "releasing connection provider"
    );
    runtime.shutdown_timeout(Duration::from_secs(1));
    if writer.join().is_err() {
        tracing::error!("output thread panicked");
    }
    Ok(())
}
