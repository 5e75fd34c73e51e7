// src/server/initialization.rs

//! Builds the database pool, the optional TLS acceptor for the client/node
//! websocket listener, and the audit channel, then assembles a
//! [`ServerContext`] — the one setup phase that must run before anything in
//! [`super::spawner`] or [`super::serve_loop`] can start.

use super::context::ServerContext;
use crate::config::Config;
use anyhow::{anyhow, Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_postgres::NoTls;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

pub async fn setup(
    config: Config,
    _log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    log_startup_info(&config);

    let db_pool = build_pool(&config)?;
    let tls = setup_tls(&config).await?;
    let bind_addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;

    let (audit_tx, audit_rx) = mpsc::unbounded_channel();

    Ok(ServerContext::new(config, db_pool, bind_addr, tls, audit_tx, audit_rx))
}

/// Builds the shared pool used for session bootstrap reads and audit
/// inserts (§5) — everything except the dedicated replication connection,
/// which talks to Postgres directly rather than through a pool.
fn build_pool(config: &Config) -> Result<Pool> {
    let pg_config: tokio_postgres::Config = config
        .database
        .conninfo
        .parse()
        .with_context(|| "failed to parse database.conninfo")?;
    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig { recycling_method: RecyclingMethod::Fast },
    );
    Pool::builder(manager)
        .max_size(config.database.pool_size)
        .build()
        .with_context(|| "failed to build database connection pool")
}

/// Sets up the TLS acceptor for the client-facing websocket listener, if
/// enabled (§1.2, §2).
async fn setup_tls(config: &Config) -> Result<Option<RustlsConfig>> {
    if !config.tls.enabled {
        return Ok(None);
    }
    info!("TLS is enabled for the client listener. Loading certificate and key.");
    let acceptor = RustlsConfig::from_pem_file(&config.tls.cert_path, &config.tls.key_path)
        .await
        .map_err(|e| {
            anyhow!(
                "failed to load TLS cert/key from '{}' / '{}': {e}",
                config.tls.cert_path,
                config.tls.key_path
            )
        })?;
    Ok(Some(acceptor))
}

fn log_startup_info(config: &Config) {
    info!(
        region = %config.region,
        host = %config.host,
        port = config.port,
        tls = config.tls.enabled,
        "starting perimeterd"
    );
    if !config.metrics.enabled {
        warn!("Prometheus metrics endpoint is disabled in the configuration.");
    }
}
