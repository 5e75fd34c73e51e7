// src/core/model/mod.rs

//! The data model shared by the replication, authorization and session
//! layers. These types mirror the rows observed over logical replication;
//! none of them owns any persistence logic of its own — they are pure value
//! types assembled from decoded tuples.

mod condition;

pub use condition::{Condition, Posture, Subject, ViolatedProperty};

use crate::core::ids::{
    AccountId, ActorId, ClientId, CredentialId, GroupId, IdentityId, MembershipId, PolicyId,
    PolicyAuthorizationId, RelayId, ResourceId, ServingNodeId, SiteId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    AccountUser,
    AccountAdminUser,
    ServiceAccount,
    ApiClient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub account_id: AccountId,
    pub actor_type: ActorType,
    pub disabled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub issuer: String,
    pub subject: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Hardware fingerprints observed on a client endpoint. `verified_at` is
/// cleared by the session layer whenever any present fingerprint changes
/// between reconnects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientFingerprints {
    pub device_serial: Option<String>,
    pub identifier_for_vendor: Option<String>,
    pub firebase_installation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub external_id: String,
    pub fingerprints: ClientFingerprints,
    pub verified_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub id: MembershipId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub account_id: AccountId,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub account_id: AccountId,
    pub group_id: GroupId,
    pub resource_id: ResourceId,
    pub conditions: Vec<Condition>,
    pub disabled_at: Option<DateTime<Utc>>,
}

impl Policy {
    pub fn is_enabled(&self) -> bool {
        self.disabled_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cidr,
    Ip,
    Dns,
    Internet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpStack {
    Ipv4Only,
    Ipv6Only,
    DualStack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFilter {
    pub protocol: Protocol,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub account_id: AccountId,
    pub site_id: Option<SiteId>,
    pub name: String,
    pub resource_type: ResourceType,
    pub ip_stack: Option<IpStack>,
    pub filters: Vec<PortFilter>,
    pub address: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub account_id: AccountId,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServingNode {
    pub id: ServingNodeId,
    pub site_id: SiteId,
    pub version: (u32, u32, u32),
    pub online: bool,
    /// WireGuard public key, announced on presence join; consumed by the
    /// flow handshake's deterministic ICE credential derivation (§4.8).
    pub pubkey: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    pub id: RelayId,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub port: u16,
    pub stamp_secret: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialContext {
    pub remote_ip: Option<std::net::IpAddr>,
    pub user_agent: Option<String>,
    pub geo: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub client_id: ClientId,
    pub expires_at: DateTime<Utc>,
    pub context: CredentialContext,
}

/// Immutable audit row minted on every successful flow handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAuthorization {
    pub id: PolicyAuthorizationId,
    pub token: String,
    pub policy_id: PolicyId,
    pub client_id: ClientId,
    pub serving_node_id: ServingNodeId,
    pub resource_id: ResourceId,
    pub membership_id: Option<MembershipId>,
    pub expires_at: DateTime<Utc>,
    pub client_ip: Option<std::net::IpAddr>,
    pub user_agent: Option<String>,
    pub gateway_ip: Option<std::net::IpAddr>,
}
