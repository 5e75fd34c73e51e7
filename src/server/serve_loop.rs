// src/server/serve_loop.rs

//! The main loop: serves the client/node websocket listener and watches the
//! background tasks spawned by [`super::spawner`], until a shutdown signal
//! arrives or a background task fails outright.

use super::context::ServerContext;
use super::ws;
use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

const BACKGROUND_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Waits for SIGINT/SIGTERM on unix, Ctrl-C on windows.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown"),
        }
    }
    #[cfg(windows)]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received, initiating graceful shutdown");
    }
}

pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let app = ws::router(ctx.state.clone())
        .into_make_service_with_connect_info::<SocketAddr>();
    let bind_addr = ctx.bind_addr;
    let handle = axum_server::Handle::new();

    let listener_task = {
        let handle = handle.clone();
        match ctx.tls.clone() {
            Some(tls) => {
                info!(%bind_addr, "listening for client/node websocket connections (TLS)");
                tokio::spawn(async move { axum_server::bind_rustls(bind_addr, tls).handle(handle).serve(app).await })
            }
            None => {
                info!(%bind_addr, "listening for client/node websocket connections");
                tokio::spawn(async move { axum_server::bind(bind_addr).handle(handle).serve(app).await })
            }
        }
    };

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => {
                break;
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("a background task exited; this is unexpected outside shutdown"),
                    Ok(Err(e)) => { error!(error = %e, "background task failed; shutting down"); break; }
                    Err(e) => { error!(error = %e, "background task panicked; shutting down"); break; }
                }
            }
        }
    }

    info!("shutting down: signaling all tasks");
    if ctx.shutdown_tx.send(()).is_err() {
        warn!("shutdown signal had no receivers");
    }

    handle.graceful_shutdown(Some(Duration::from_secs(5)));
    if let Err(e) = listener_task.await {
        error!(error = %e, "listener task panicked during shutdown");
    }

    info!("waiting for background tasks to finish");
    if tokio::time::timeout(BACKGROUND_DRAIN_TIMEOUT, async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for background tasks to finish cleanly");
    }

    info!("server shutdown complete");
    Ok(())
}
