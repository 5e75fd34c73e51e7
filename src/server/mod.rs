// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, reload};

mod context;
mod initialization;
mod metrics_server;
mod node_wire;
mod serve_loop;
mod spawner;
mod ws;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    // 1. Build the shared state, database pool, and (optional) TLS acceptor.
    let mut ctx = initialization::setup(config, log_reload_handle).await?;

    // 2. Spawn the replication manager, audit sink, and metrics server.
    spawner::spawn_all(&mut ctx).await?;

    // 3. Serve the client/node websocket listener until shutdown.
    serve_loop::run(ctx).await
}
