//! Async Postgres connector backing the gateway's connection provider.

use crate::{AcquireError, AsyncPool, AsyncPooled, CancelToken};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config, Error as PgError, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;

#[derive(Clone, Debug)]
pub struct PgPoolConfig {
    pub dsn: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub max_conns: usize,
    pub max_idle: Option<Duration>,
    pub connect_timeout: Duration,
    pub max_wait: Duration,
    pub ssl_root_cert: Option<std::path::PathBuf>,
}

impl PgPoolConfig {
    pub fn new(dsn: String) -> Self {
        Self {
            dsn,
            user: None,
            password: None,
            max_conns: 10,
            max_idle: None,
            connect_timeout: Duration::from_secs(10),
            max_wait: Duration::from_secs(10),
            ssl_root_cert: None,
        }
    }

    /// Parses the DSN and applies the credential and timeout overrides.
    pub fn pg_config(&self) -> Result<Config, String> {
        let mut pg_config =
            Config::from_str(&self.dsn).map_err(|err| format!("invalid Postgres DSN: {err}"))?;
        if let Some(user) = self.user.as_deref() {
            pg_config.user(user);
        }
        if let Some(password) = self.password.as_deref() {
            pg_config.password(password);
        }
        pg_config.connect_timeout(self.connect_timeout);
        Ok(pg_config)
    }
}

pub struct PgConn {
    client: Client,
    cancel_token: tokio_postgres::CancelToken,
    tls: PgTls,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

impl PgConn {
    async fn connect(config: &PgPoolConfig) -> Result<Self, String> {
        let pg_config = config.pg_config()?;
        let tls = match pg_config.get_ssl_mode() {
            SslMode::Disable => None,
            // `prefer` falls back to plaintext when no trust roots are available.
            SslMode::Prefer => build_tls_connector(config)
                .inspect_err(|err| tracing::debug!(error = %err, "TLS unavailable, using plaintext"))
                .ok(),
            _ => Some(build_tls_connector(config)?),
        };
        let (client, tls) = match tls {
            None => {
                let (client, connection) = pg_config
                    .connect(NoTls)
                    .await
                    .map_err(|err| err.to_string())?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        tracing::warn!(error = %err, "postgres connection error");
                    }
                });
                (client, PgTls::None)
            }
            Some(tls) => {
                let (client, connection) = pg_config
                    .connect(tls.clone())
                    .await
                    .map_err(|err| err.to_string())?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        tracing::warn!(error = %err, "postgres connection error");
                    }
                });
                (client, PgTls::Rustls(tls))
            }
        };
        let cancel_token = client.cancel_token();
        tracing::debug!("opened postgres connection");
        Ok(Self {
            client,
            cancel_token,
            tls,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Asks the server to cancel whatever statement is running on this connection.
    pub async fn cancel_query(&self) -> Result<(), PgError> {
        match &self.tls {
            PgTls::None => self.cancel_token.cancel_query(NoTls).await,
            PgTls::Rustls(tls) => self.cancel_token.cancel_query(tls.clone()).await,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    pub async fn ping(&self) -> Result<(), PgError> {
        self.client.simple_query("SELECT 1").await.map(|_| ())
    }
}

pub struct PgPool {
    config: Arc<PgPoolConfig>,
    pool: Arc<AsyncPool<PgConn>>,
}

impl PgPool {
    /// Builds the pool without opening any connection; the DSN is validated eagerly.
    pub fn new(config: PgPoolConfig) -> Result<Self, String> {
        config.pg_config()?;
        let config = Arc::new(config);
        let pool = {
            let cfg = config.clone();
            AsyncPool::new(config.max_conns, config.max_idle, move || {
                let cfg = cfg.clone();
                async move { PgConn::connect(&cfg).await }
            })
        };
        Ok(Self { config, pool })
    }

    /// Hands out a live connection, discarding idle ones whose socket is gone.
    pub async fn acquire(
        &self,
        cancel: Option<&CancelToken>,
    ) -> Result<AsyncPooled<PgConn>, AcquireError> {
        loop {
            let conn = self
                .pool
                .acquire(Some(self.config.max_wait), cancel)
                .await?;
            if conn.is_closed() {
                conn.discard();
                continue;
            }
            return Ok(conn);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn idle_count(&self) -> usize {
        self.pool.idle_count()
    }
}

fn build_tls_connector(config: &PgPoolConfig) -> Result<MakeRustlsConnect, String> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::debug!(error = %err, "skipping unreadable native certificate");
    }
    for cert in native.certs {
        roots.add(cert).map_err(|err| err.to_string())?;
    }
    if let Some(path) = config.ssl_root_cert.as_ref() {
        for cert in CertificateDer::pem_file_iter(path).map_err(|err| err.to_string())? {
            let cert = cert.map_err(|err| err.to_string())?;
            roots.add(cert).map_err(|err| err.to_string())?;
        }
    }
    if roots.is_empty() {
        return Err("no root certificates available for TLS".to_string());
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| err.to_string())?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_config_applies_credential_overrides() {
        let mut config = PgPoolConfig::new("postgresql://app@localhost:5432/postgres".to_string());
        config.user = Some("gateway".to_string());
        config.password = Some("secret".to_string());
        let pg = config.pg_config().expect("dsn");
        assert_eq!(pg.get_user(), Some("gateway"));
        assert_eq!(pg.get_password(), Some(&b"secret"[..]));
        assert_eq!(pg.get_connect_timeout(), Some(&Duration::from_secs(10)));
    }

    #[test]
    fn pool_rejects_invalid_dsn() {
        let config = PgPoolConfig::new("postgresql://host:notaport/db".to_string());
        let err = PgPool::new(config).err().expect("invalid dsn");
        assert!(err.starts_with("invalid Postgres DSN"), "{err}");
    }
}
