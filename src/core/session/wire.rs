// src/core/session/wire.rs

//! The client websocket wire protocol (§6.2): inbound frames the client
//! sends, outbound frames the Session Actor pushes, and the value types
//! embedded in them. Every frame is tagged on `event` so the two directions
//! can share one `serde_json::Value` envelope on the actual socket.

use crate::core::flow::IceCredentials;
use crate::core::ids::{ResourceId, ServingNodeId, SiteId};
use crate::core::model::{PortFilter, Resource, ResourceType, ViolatedProperty};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Frames a connected client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundFrame {
    CreateFlow {
        resource_id: ResourceId,
        #[serde(default)]
        connected_gateway_ids: Vec<ServingNodeId>,
    },
    BroadcastIceCandidates {
        candidates: Vec<String>,
        gateway_ids: Vec<ServingNodeId>,
    },
    BroadcastInvalidatedIceCandidates {
        candidates: Vec<String>,
        gateway_ids: Vec<ServingNodeId>,
    },
    NewGatewayIceCandidates {
        gateway_id: ServingNodeId,
        candidates: Vec<String>,
    },
    InvalidateGatewayIceCandidates {
        gateway_id: ServingNodeId,
        candidates: Vec<String>,
    },
    NewClientIceCandidates {
        client_id: crate::core::ids::ClientId,
        candidates: Vec<String>,
    },
    InvalidateClientIceCandidates {
        client_id: crate::core::ids::ClientId,
        candidates: Vec<String>,
    },
    /// Deprecated legacy handshake (§9); accepted but answered with
    /// `flow_creation_failed{reason: not_found}` since no serving node in
    /// this deployment still speaks it.
    PrepareConnection {
        resource_id: ResourceId,
    },
    ReuseConnection {
        resource_id: ResourceId,
        gateway_id: ServingNodeId,
    },
    RequestConnection {
        resource_id: ResourceId,
        gateway_id: ServingNodeId,
    },
}

/// Why a `create_flow` failed to reach `flow_created`, as pushed to the
/// wire (§6.2, §7).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FlowFailureReason {
    NotFound,
    Offline,
    Forbidden { violated_properties: Vec<ViolatedProperty> },
    VersionMismatch,
}

/// The view of a [`Resource`] sent on the wire for `init` and
/// `resource_created_or_updated`.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceView {
    pub id: ResourceId,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub address: String,
    pub filters: Vec<PortFilter>,
    pub ip_stack: Option<crate::core::model::IpStack>,
}

impl From<&Resource> for ResourceView {
    fn from(r: &Resource) -> Self {
        Self {
            id: r.id,
            name: r.name.clone(),
            resource_type: r.resource_type,
            address: r.address.clone(),
            filters: r.filters.clone(),
            ip_stack: r.ip_stack,
        }
    }
}

/// A TURN relay as presented to the client (§6.2): credentials are
/// time-boxed HMACs over the relay's `stamp_secret`, not reusable beyond
/// `expires_at`.
#[derive(Debug, Clone, Serialize)]
pub struct RelayView {
    pub id: crate::core::ids::RelayId,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub addr: String,
    pub username: String,
    pub password: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct InterfaceView {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Frames the Session Actor pushes to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundFrame {
    Init {
        resources: Vec<ResourceView>,
        relays: Vec<RelayView>,
        interface: InterfaceView,
    },
    ResourceCreatedOrUpdated {
        #[serde(flatten)]
        resource: ResourceView,
    },
    ResourceDeleted {
        id: ResourceId,
    },
    ConfigChanged {
        interface: InterfaceView,
    },
    RelaysPresence {
        disconnected_ids: Vec<crate::core::ids::RelayId>,
        connected: Vec<RelayView>,
    },
    FlowCreated {
        resource_id: ResourceId,
        preshared_key: String,
        client_ice_credentials: IceCredentialsView,
        gateway_group_id: SiteId,
        gateway_id: ServingNodeId,
        gateway_public_key: String,
        gateway_ipv4: Option<Ipv4Addr>,
        gateway_ipv6: Option<Ipv6Addr>,
        gateway_ice_credentials: IceCredentialsView,
    },
    FlowCreationFailed {
        resource_id: ResourceId,
        #[serde(flatten)]
        reason: FlowFailureReason,
    },
    IceCandidates {
        gateway_id: ServingNodeId,
        candidates: Vec<String>,
    },
    InvalidateIceCandidates {
        gateway_id: ServingNodeId,
        candidates: Vec<String>,
    },
    NewClientIceCandidates {
        client_id: crate::core::ids::ClientId,
        candidates: Vec<String>,
    },
    InvalidateClientIceCandidates {
        client_id: crate::core::ids::ClientId,
        candidates: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct IceCredentialsView {
    pub username: String,
    pub password: String,
}

impl From<&IceCredentials> for (IceCredentialsView, IceCredentialsView) {
    fn from(c: &IceCredentials) -> Self {
        (
            IceCredentialsView {
                username: c.client_user.clone(),
                password: c.client_pass.clone(),
            },
            IceCredentialsView {
                username: c.node_user.clone(),
                password: c.node_pass.clone(),
            },
        )
    }
}
