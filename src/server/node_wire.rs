// src/server/node_wire.rs

//! The serving-node websocket protocol. Unlike the client protocol (§6.2,
//! `core::session::wire`), spec.md leaves the node-facing transport
//! unspecified — it only fixes what the Flow Handshake exchanges logically
//! (§4.8 steps 5/7) and presence's join/leave semantics (§4.7). This module
//! is the concrete wire shape that carries both over one persistent
//! connection per serving node, tagged the same way `core::session::wire`
//! tags its own frames.

use crate::core::flow::{AuthorizePolicyRequest, IceCredentials, NodeConnectReply};
use crate::core::ids::{PolicyAuthorizationId, ServingNodeId, SiteId};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCredentialsWire {
    pub client_user: String,
    pub client_pass: String,
    pub node_user: String,
    pub node_pass: String,
}

impl From<&IceCredentials> for IceCredentialsWire {
    fn from(c: &IceCredentials) -> Self {
        Self {
            client_user: c.client_user.clone(),
            client_pass: c.client_pass.clone(),
            node_user: c.node_user.clone(),
            node_pass: c.node_pass.clone(),
        }
    }
}

impl From<IceCredentialsWire> for IceCredentials {
    fn from(w: IceCredentialsWire) -> Self {
        Self {
            client_user: w.client_user,
            client_pass: w.client_pass,
            node_user: w.node_user,
            node_pass: w.node_pass,
        }
    }
}

/// First frame a node connection must send, announcing itself to presence
/// (§4.7 "join on connection").
#[derive(Debug, Clone, Deserialize)]
pub struct NodeHello {
    pub node_id: ServingNodeId,
    pub site_id: SiteId,
    pub version: (u32, u32, u32),
    pub pubkey: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Frames a serving node may send after its `hello`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeInbound {
    Heartbeat,
    AuthorizePolicyReply {
        policy_authorization_id: PolicyAuthorizationId,
        resource_id: crate::core::ids::ResourceId,
        site_id: SiteId,
        node_id: ServingNodeId,
        node_pubkey: String,
        node_ipv4: Option<Ipv4Addr>,
        node_ipv6: Option<Ipv6Addr>,
        preshared_key: String,
        ice_credentials: IceCredentialsWire,
    },
}

impl NodeInbound {
    pub fn into_reply(self) -> Option<NodeConnectReply> {
        match self {
            NodeInbound::AuthorizePolicyReply {
                policy_authorization_id,
                resource_id,
                site_id,
                node_id,
                node_pubkey,
                node_ipv4,
                node_ipv6,
                preshared_key,
                ice_credentials,
            } => Some(NodeConnectReply {
                policy_authorization_id,
                resource_id,
                site_id,
                node_id,
                node_pubkey,
                node_ipv4,
                node_ipv6,
                preshared_key,
                ice_credentials: ice_credentials.into(),
            }),
            NodeInbound::Heartbeat => None,
        }
    }
}

/// Frames the server pushes to a serving node.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeOutbound {
    AuthorizePolicy {
        policy_authorization_id: PolicyAuthorizationId,
        policy_id: crate::core::ids::PolicyId,
        client_id: crate::core::ids::ClientId,
        client_pubkey: String,
        membership_id: Option<crate::core::ids::MembershipId>,
        resource_id: crate::core::ids::ResourceId,
        expires_at: chrono::DateTime<chrono::Utc>,
        preshared_key: String,
        client_ice_credentials: IceCredentialsWire,
    },
}

impl From<AuthorizePolicyRequest> for NodeOutbound {
    fn from(r: AuthorizePolicyRequest) -> Self {
        NodeOutbound::AuthorizePolicy {
            policy_authorization_id: r.policy_authorization_id,
            policy_id: r.policy_id,
            client_id: r.client_id,
            client_pubkey: r.client_pubkey,
            membership_id: r.membership_id,
            resource_id: r.resource_id,
            expires_at: r.expires_at,
            preshared_key: r.preshared_key,
            client_ice_credentials: (&r.client_ice_credentials).into(),
        }
    }
}
