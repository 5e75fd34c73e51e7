// src/server/spawner.rs

//! Spawns the server's long-running background tasks: the replication
//! manager, the audit sink that durably inserts `PolicyAuthorization` rows
//! (§4.8 step 4), and the optional Prometheus metrics endpoint.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::model::PolicyAuthorization;
use crate::core::replication::ReplicationManager;
use anyhow::{anyhow, Result};
use deadpool_postgres::Pool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let shutdown_tx = ctx.shutdown_tx.clone();

    // --- Replication Manager (C3) ---
    let manager = ReplicationManager::new(ctx.config.region.clone(), ctx.config.replication_settings());
    let bus = ctx.state.change_bus.clone();
    let shutdown_rx_repl = shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        manager
            .run(bus, shutdown_rx_repl)
            .await
            .map_err(|e| anyhow!("replication manager failed: {e}"))
    });

    // --- Audit sink: durably inserts every PolicyAuthorization (§4.8 step 4) ---
    let audit_rx = ctx
        .audit_rx
        .take()
        .expect("audit receiver is only taken once, during spawn_all");
    let db_pool = ctx.state.db_pool.clone();
    let mut shutdown_rx_audit = shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        run_audit_sink(db_pool, audit_rx, &mut shutdown_rx_audit).await;
        Ok(())
    });

    // --- Metrics Server ---
    if ctx.config.metrics.enabled {
        let port = ctx.config.metrics.port;
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run(port, shutdown_rx_metrics).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    info!("All background tasks have been spawned.");
    Ok(())
}

/// Drains completed flow-handshake audit rows into the database, one insert
/// per row. A failed insert is logged and dropped rather than retried — the
/// handshake it documents has already completed on the wire either way.
async fn run_audit_sink(
    db_pool: Pool,
    mut audit_rx: mpsc::UnboundedReceiver<PolicyAuthorization>,
    shutdown_rx: &mut tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("audit sink shutting down");
                return;
            }
            audit = audit_rx.recv() => {
                match audit {
                    Some(audit) => insert_audit_row(&db_pool, &audit).await,
                    None => return,
                }
            }
        }
    }
}

async fn insert_audit_row(db_pool: &Pool, audit: &PolicyAuthorization) {
    let conn = match db_pool.get().await {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "failed to check out a connection for the audit insert");
            return;
        }
    };
    let result = conn
        .execute(
            "INSERT INTO policy_authorizations \
             (id, token, policy_id, client_id, serving_node_id, resource_id, membership_id, \
              expires_at, client_ip, user_agent, gateway_ip, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now())",
            &[
                &audit.id.as_uuid(),
                &audit.token,
                &audit.policy_id.as_uuid(),
                &audit.client_id.as_uuid(),
                &audit.serving_node_id.as_uuid(),
                &audit.resource_id.as_uuid(),
                &audit.membership_id.map(|id| id.as_uuid()),
                &audit.expires_at,
                &audit.client_ip.map(|ip| ip.to_string()),
                &audit.user_agent,
                &audit.gateway_ip.map(|ip| ip.to_string()),
            ],
        )
        .await;
    if let Err(e) = result {
        warn!(audit_id = %audit.id, error = %e, "failed to insert policy_authorization audit row");
    }
}
