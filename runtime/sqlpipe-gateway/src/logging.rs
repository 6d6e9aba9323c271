//! Log setup. stdout and stderr belong to the protocol, so logs only ever
//! go to a file.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

const QUIET_TARGETS: [(&str, &str); 3] = [
    ("tokio_postgres", "warn"),
    ("rustls", "warn"),
    ("tokio", "warn"),
];

/// Base level plus quieter defaults for driver crates.
pub fn build_env_filter(level: &str) -> Result<EnvFilter, String> {
    let mut directives = vec![level.to_string()];
    for (target, lvl) in QUIET_TARGETS {
        directives.push(format!("{target}={lvl}"));
    }
    let filter = directives.join(",");
    EnvFilter::try_new(&filter).map_err(|err| format!("invalid log filter '{filter}': {err}"))
}

/// Installs the global subscriber writing to `log_file`; without a file,
/// events are dropped.
pub fn init(log_file: Option<&Path>, level: &str) -> io::Result<()> {
    let Some(path) = log_file else {
        return Ok(());
    };
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let filter = build_env_filter(level).map_err(io::Error::other)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(io::Error::other)?;
    tracing::debug!(path = %path.display(), "logging initialized");
    Ok(())
}
