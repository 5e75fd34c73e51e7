// src/server/context.rs

use super::ws::{AppState, WsNodeDispatcher};
use crate::config::Config;
use crate::core::change_bus::ChangeBusHandle;
use crate::core::flow::FlowRouter;
use crate::core::model::PolicyAuthorization;
use crate::core::presence::PresenceHandle;
use axum_server::tls_rustls::RustlsConfig;
use deadpool_postgres::Pool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Holds everything [`super::spawner::spawn_all`] and the websocket listener
/// need once initialization has run. One instance lives for the whole
/// process; there is no analogue of the teacher's per-connection
/// `ServerState` here since each client/node connection is its own actor
/// with no shared mutable state beyond what [`AppState`] hands out.
pub struct ServerContext {
    pub config: Config,
    pub state: AppState,
    pub bind_addr: SocketAddr,
    pub tls: Option<RustlsConfig>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<anyhow::Result<()>>,
    pub audit_rx: Option<mpsc::UnboundedReceiver<PolicyAuthorization>>,
}

impl ServerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        db_pool: Pool,
        bind_addr: SocketAddr,
        tls: Option<RustlsConfig>,
        audit_tx: mpsc::UnboundedSender<PolicyAuthorization>,
        audit_rx: mpsc::UnboundedReceiver<PolicyAuthorization>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let flow_secret: Arc<[u8]> = config.flow_secret().into();

        let state = AppState {
            config: Arc::new(config.clone()),
            db_pool,
            change_bus: ChangeBusHandle::new(),
            presence: PresenceHandle::new(),
            flow_router: Arc::new(FlowRouter::new()),
            dispatcher: Arc::new(WsNodeDispatcher::new()),
            shutdown_tx: shutdown_tx.clone(),
            audit_tx,
            flow_secret,
        };

        Self {
            config,
            state,
            bind_addr,
            tls,
            shutdown_tx,
            background_tasks: JoinSet::new(),
            audit_rx: Some(audit_rx),
        }
    }
}
