//! Startup configuration from the environment and command line.

use std::path::PathBuf;
use std::time::Duration;

use sqlpipe_db::PgPoolConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse env var to number")]
    Number { var: &'static str },
    #[error("database url is not set (database_url or jdbc_url)")]
    MissingUrl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub threads: usize,
    pub database_url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub max_connections: usize,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub query_timeout: Option<Duration>,
    pub keep_alive: Option<Duration>,
    pub ssl_root_cert: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let number = |name: &'static str| -> Result<Option<i64>, ConfigError> {
            text(name)
                .map(|value| value.trim().parse::<i64>())
                .transpose()
                .map_err(|_| ConfigError::Number { var: name })
        };
        let millis = |name: &'static str, default: i64| -> Result<Option<Duration>, ConfigError> {
            let value = number(name)?.unwrap_or(default);
            Ok((value > 0).then(|| Duration::from_millis(value as u64)))
        };

        let threads = match number("threads")? {
            Some(count) if count >= 1 => count as usize,
            _ => return Err(ConfigError::Number { var: "threads" }),
        };
        let max_connections = match number("max")? {
            None => 10,
            Some(count) if count >= 1 => count as usize,
            Some(_) => return Err(ConfigError::Number { var: "max" }),
        };
        let database_url = text("database_url")
            .or_else(|| text("jdbc_url"))
            .map(|url| url.strip_prefix("jdbc:").map(str::to_string).unwrap_or(url))
            .ok_or(ConfigError::MissingUrl)?;

        Ok(Self {
            threads,
            database_url,
            user: text("user"),
            password: text("password"),
            max_connections,
            connection_timeout: millis("connection_timeout_millis", 10_000)?
                .unwrap_or(Duration::from_secs(10)),
            idle_timeout: millis("idle_timeout_millis", 0)?,
            query_timeout: millis("query_timeout", 0)?,
            keep_alive: millis("keep_alive_millis", 0)?,
            ssl_root_cert: text("ssl_root_cert").map(PathBuf::from),
            log_file: text("log_file").map(PathBuf::from),
            log_level: text("log_level").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Applies command-line overrides (`--threads N`; `--stdio` is accepted).
    pub fn apply_args<I>(&mut self, args: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--threads" => {
                    if let Some(val) = args.next() {
                        self.threads = val
                            .parse::<usize>()
                            .ok()
                            .filter(|count| *count >= 1)
                            .ok_or(ConfigError::Number { var: "threads" })?;
                    }
                }
                "--stdio" => {}
                _ => {}
            }
        }
        Ok(())
    }

    /// Bound on one keepalive probe.
    pub fn probe_timeout(&self) -> Duration {
        self.query_timeout.unwrap_or(self.connection_timeout)
    }

    pub fn pool_config(&self) -> PgPoolConfig {
        let mut pool = PgPoolConfig::new(self.database_url.clone());
        pool.user = self.user.clone();
        pool.password = self.password.clone();
        pool.max_conns = self.max_connections;
        pool.max_idle = self.idle_timeout;
        pool.connect_timeout = self.connection_timeout;
        pool.max_wait = self.connection_timeout;
        pool.ssl_root_cert = self.ssl_root_cert.clone();
        pool
    }
}
