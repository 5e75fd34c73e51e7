// src/server/ws.rs

//! The two websocket surfaces the control plane exposes: the client protocol
//! (§6.2, `core::session::wire`) bootstraps and drives a [`SessionActor`] per
//! connection; the serving-node protocol (this module's own [`node_wire`])
//! registers a node with presence and routes flow-handshake traffic to it
//! through [`WsNodeDispatcher`].

use super::node_wire::{NodeHello, NodeInbound, NodeOutbound};
use crate::config::Config;
use crate::core::change_bus::ChangeBusHandle;
use crate::core::errors::PlaneError;
use crate::core::flow::{AuthorizePolicyRequest, FlowRouter, NodeDispatcher};
use crate::core::ids::ServingNodeId;
use crate::core::metrics;
use crate::core::model::PolicyAuthorization;
use crate::core::presence::PresenceHandle;
use crate::core::session::{
    parse_client, parse_interface, parse_membership, parse_policy, parse_resource, InboundFrame,
    OutboundFrame, SessionActor, SessionIdentity, SessionState,
};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use deadpool_postgres::Pool;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process-wide state handed to every axum handler. Cheap to clone — every
/// field is already a handle (`Arc`, `DashMap`-backed, or a channel sender).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db_pool: Pool,
    pub change_bus: ChangeBusHandle,
    pub presence: PresenceHandle,
    pub flow_router: Arc<FlowRouter>,
    pub dispatcher: Arc<WsNodeDispatcher>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub audit_tx: mpsc::UnboundedSender<PolicyAuthorization>,
    pub flow_secret: Arc<[u8]>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/client", get(client_ws_handler))
        .route("/ws/node", get(node_ws_handler))
        .with_state(state)
}

/// Routes `authorize_policy` requests to whichever node connection is
/// currently registered for a given node id. The concrete transport behind
/// [`NodeDispatcher`] — `core` only knows the trait.
#[derive(Default)]
pub struct WsNodeDispatcher {
    nodes: DashMap<ServingNodeId, mpsc::UnboundedSender<NodeOutbound>>,
}

impl WsNodeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, node_id: ServingNodeId, tx: mpsc::UnboundedSender<NodeOutbound>) {
        self.nodes.insert(node_id, tx);
    }

    fn deregister(&self, node_id: ServingNodeId) {
        self.nodes.remove(&node_id);
    }
}

#[async_trait]
impl NodeDispatcher for WsNodeDispatcher {
    async fn dispatch(
        &self,
        node_id: ServingNodeId,
        request: AuthorizePolicyRequest,
    ) -> Result<(), PlaneError> {
        let sender = self
            .nodes
            .get(&node_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PlaneError::HandshakeFailed(format!("node {node_id} is not connected")))?;
        sender
            .send(request.into())
            .map_err(|_| PlaneError::HandshakeFailed(format!("node {node_id} connection closed")))
    }
}

// -- Client connections -------------------------------------------------

#[derive(Debug, Deserialize)]
struct ClientConnectParams {
    client_id: Uuid,
    /// The WireGuard public key the client is presenting for this
    /// connection. Not a persisted column on `clients` — it is the
    /// connection's own cryptographic identity, fresh every reconnect, and
    /// is only ever compared against what a serving node reports back.
    pubkey: String,
}

async fn client_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ClientConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, params, addr, user_agent))
}

struct ClientBootstrap {
    identity: SessionIdentity,
    cache_seed: CacheSeed,
    interface: crate::core::session::InterfaceView,
    credential_expires_at: DateTime<Utc>,
}

struct CacheSeed {
    memberships: Vec<(crate::core::ids::GroupId, crate::core::ids::MembershipId)>,
    policies: Vec<crate::core::model::Policy>,
    resources: Vec<crate::core::model::Resource>,
}

/// Loads everything §4.6 step 1 asks for in one connection checkout: the
/// client row, its newest credential, the account's `config`, and the full
/// membership/policy/resource graph for the account.
async fn bootstrap_client(
    pool: &Pool,
    flow_secret: Arc<[u8]>,
    client_id: Uuid,
    client_pubkey: String,
    client_ip: Option<std::net::IpAddr>,
    user_agent: Option<String>,
) -> Result<ClientBootstrap, PlaneError> {
    let conn = pool.get().await.map_err(|e| PlaneError::Internal(e.to_string()))?;

    let client_row = conn
        .query_opt(
            "SELECT id::text, account_id::text, actor_id::text, external_id, device_serial, \
             identifier_for_vendor, firebase_installation_id, verified_at::text, deleted_at::text \
             FROM clients WHERE id = $1 AND deleted_at IS NULL",
            &[&client_id],
        )
        .await?
        .ok_or_else(|| PlaneError::HandshakeFailed(format!("unknown client {client_id}")))?;
    let client_map = row_to_map(&client_row, &[]);
    let client =
        parse_client(&client_map).ok_or_else(|| PlaneError::HandshakeFailed("malformed client row".into()))?;

    let credential_row = conn
        .query_opt(
            "SELECT expires_at::text, lat, lon FROM credentials WHERE client_id = $1 \
             ORDER BY expires_at DESC LIMIT 1",
            &[&client_id],
        )
        .await?
        .ok_or_else(|| PlaneError::HandshakeFailed(format!("client {client_id} has no credential")))?;
    let credential_expires_at: DateTime<Utc> = credential_row
        .get::<_, Option<String>>("expires_at")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| PlaneError::HandshakeFailed("malformed credential row".into()))?;
    if credential_expires_at <= Utc::now() {
        return Err(PlaneError::HandshakeFailed(format!("client {client_id}'s credential has expired")));
    }
    let client_geo: Option<(f64, f64)> = match (
        credential_row.get::<_, Option<f64>>("lat"),
        credential_row.get::<_, Option<f64>>("lon"),
    ) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => None,
    };

    let account_row = conn
        .query_one("SELECT config FROM accounts WHERE id = $1", &[&client.account_id.as_uuid()])
        .await?;
    let config: JsonValue = account_row.get("config");
    let interface = parse_interface(&config).unwrap_or_default();

    let membership_rows = conn
        .query(
            "SELECT id::text, account_id::text, actor_id::text, group_id::text FROM memberships \
             WHERE actor_id = $1",
            &[&client.actor_id.as_uuid()],
        )
        .await?;
    let memberships: Vec<_> = membership_rows
        .iter()
        .map(|r| row_to_map(r, &[]))
        .filter_map(|m| parse_membership(&m))
        .map(|m| (m.group_id, m.id))
        .collect();

    let policy_rows = conn
        .query(
            "SELECT id::text, account_id::text, group_id::text, resource_id::text, conditions, \
             disabled_at::text FROM policies WHERE account_id = $1",
            &[&client.account_id.as_uuid()],
        )
        .await?;
    let policies: Vec<_> = policy_rows
        .iter()
        .map(|r| row_to_map(r, &["conditions"]))
        .filter_map(|p| parse_policy(&p))
        .collect();

    let resource_rows = conn
        .query(
            "SELECT id::text, account_id::text, site_id::text, name, type::text, ip_stack::text, \
             filters, address, deleted_at::text FROM resources WHERE account_id = $1 AND deleted_at IS NULL",
            &[&client.account_id.as_uuid()],
        )
        .await?;
    let resources: Vec<_> = resource_rows
        .iter()
        .map(|r| row_to_map(r, &["filters"]))
        .filter_map(|r| parse_resource(&r))
        .collect();

    let identity = SessionIdentity {
        account_id: client.account_id,
        actor_id: client.actor_id,
        client_id: client.id,
        client_pubkey,
        client_version: (1, 2, 0),
        client_geo,
        client_ip,
        user_agent,
        flow_secret,
    };

    Ok(ClientBootstrap {
        identity,
        cache_seed: CacheSeed { memberships, policies, resources },
        interface,
        credential_expires_at,
    })
}

async fn handle_client_socket(
    socket: WebSocket,
    state: AppState,
    params: ClientConnectParams,
    addr: SocketAddr,
    user_agent: Option<String>,
) {
    let bootstrap = match bootstrap_client(
        &state.db_pool,
        Arc::clone(&state.flow_secret),
        params.client_id,
        params.pubkey,
        Some(addr.ip()),
        user_agent,
    )
    .await
    {
        Ok(b) => b,
        Err(e) => {
            warn!(client_id = %params.client_id, error = %e, "client bootstrap failed");
            let _ = socket.close().await;
            return;
        }
    };

    let client_id = bootstrap.identity.client_id;
    let mut session_state = SessionState::new(
        bootstrap.identity,
        bootstrap.interface,
        bootstrap.credential_expires_at,
        state.config.max_expiry_horizon(),
    );
    for resource in bootstrap.cache_seed.resources {
        session_state.seed_resource(resource);
    }
    for policy in bootstrap.cache_seed.policies {
        session_state.seed_policy(policy);
    }
    for (group_id, membership_id) in bootstrap.cache_seed.memberships {
        session_state.seed_membership(group_id, membership_id);
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundFrame>();

    let actor = SessionActor::new(
        session_state,
        state.change_bus.clone(),
        state.presence.clone(),
        Arc::clone(&state.flow_router),
        Arc::clone(&state.dispatcher) as Arc<dyn NodeDispatcher>,
        outbound_tx,
        inbound_rx,
        state.shutdown_tx.subscribe(),
        state.audit_tx.clone(),
    )
    .with_timings(
        state.config.recompute_interval(),
        state.config.presence_debounce(),
        state.config.handshake_timeout(),
    );

    metrics::CONNECTED_SESSIONS.inc();
    metrics::SESSIONS_ACCEPTED_TOTAL.inc();
    info!(%client_id, %addr, "client session connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let actor_handle = tokio::spawn(actor.run());

    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<InboundFrame>(&text) {
            Ok(frame) => {
                if inbound_tx.send(frame).is_err() {
                    break;
                }
            }
            Err(e) => debug!(%client_id, error = %e, "dropping malformed client frame"),
        }
    }

    drop(inbound_tx);
    actor_handle.abort();
    writer.abort();
    metrics::CONNECTED_SESSIONS.dec();
    metrics::SESSIONS_CLOSED_TOTAL.inc();
    info!(%client_id, "client session disconnected");
}

// -- Serving node connections --------------------------------------------

async fn node_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_node_socket(socket, state))
}

async fn handle_node_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat_ttl = state.config.heartbeat_ttl();

    let hello = match tokio::time::timeout(heartbeat_ttl, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<NodeHello>(&text).ok(),
        _ => None,
    };
    let Some(hello) = hello else {
        warn!("serving node connection closed before a valid hello frame");
        return;
    };

    let node = crate::core::model::ServingNode {
        id: hello.node_id,
        site_id: hello.site_id,
        version: hello.version,
        online: true,
        pubkey: hello.pubkey,
    };
    state.presence.join_node(node);
    info!(node_id = %hello.node_id, site_id = %hello.site_id, "serving node connected");

    let (node_tx, mut node_rx) = mpsc::unbounded_channel::<NodeOutbound>();
    state.dispatcher.register(hello.node_id, node_tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = node_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        match tokio::time::timeout(heartbeat_ttl, ws_rx.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<NodeInbound>(&text) {
                Ok(frame) => {
                    if let Some(reply) = frame.into_reply() {
                        if !state.flow_router.resolve(reply.policy_authorization_id, reply) {
                            debug!(node_id = %hello.node_id, "reply to an already-timed-out flow, dropped");
                        } else {
                            metrics::FLOW_HANDSHAKES_SUCCEEDED_TOTAL.inc();
                        }
                    }
                }
                Err(e) => debug!(node_id = %hello.node_id, error = %e, "dropping malformed node frame"),
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(_))) => {}
            Err(_) => {
                warn!(node_id = %hello.node_id, "serving node missed its heartbeat window; disconnecting");
                break;
            }
        }
    }

    state.dispatcher.deregister(hello.node_id);
    state.presence.leave_node(hello.node_id);
    writer.abort();
    info!(node_id = %hello.node_id, "serving node disconnected");
}

// -- Shared row decoding --------------------------------------------------

/// Converts a query row into the `HashMap<String, JsonValue>` shape
/// `core::session::parse` expects, matching the WAL decoder's convention:
/// jsonb columns (named in `jsonb_columns`) come back as parsed JSON,
/// everything else as text (the caller is expected to `::text`-cast every
/// other selected column in its SQL).
fn row_to_map(row: &tokio_postgres::Row, jsonb_columns: &[&str]) -> HashMap<String, JsonValue> {
    let mut map = HashMap::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let name = col.name().to_string();
        let value = if jsonb_columns.contains(&name.as_str()) {
            row.try_get::<_, Option<JsonValue>>(i).ok().flatten().unwrap_or(JsonValue::Null)
        } else {
            row.try_get::<_, Option<String>>(i)
                .ok()
                .flatten()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null)
        };
        map.insert(name, value);
    }
    map
}
