// src/core/session/parse.rs

//! Converts a replication [`Change`]'s decoded row (a `HashMap<String,
//! JsonValue>` of column name to opportunistically-JSON-decoded cell) back
//! into the typed model rows the Authorization Cache and Session Actor work
//! with. The WAL decoder (C1) never attempts this itself — it stops at
//! "JSON cells get parsed, everything else stays text" — so the session
//! layer is where a `resources` row becomes a [`Resource`].

use crate::core::ids::{
    AccountId, ActorId, ClientId, GroupId, MembershipId, PolicyId, ResourceId, SiteId,
};
use crate::core::model::{
    Client, ClientFingerprints, Condition, IpStack, Membership, Policy, PortFilter, Resource,
    ResourceType, Site,
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

type Row = HashMap<String, JsonValue>;

fn str_field<'a>(row: &'a Row, key: &str) -> Option<&'a str> {
    row.get(key).and_then(|v| v.as_str())
}

fn uuid_field(row: &Row, key: &str) -> Option<Uuid> {
    str_field(row, key).and_then(|s| s.parse().ok())
}

/// Postgres's text-format output for `timestamptz` (`2024-01-02
/// 03:04:05.123456+00`) isn't RFC3339 (space instead of `T`); this accepts
/// both that and RFC3339 for rows built in tests.
fn timestamptz_field(row: &Row, key: &str) -> Option<DateTime<Utc>> {
    let raw = str_field(row, key)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let normalized = raw.replacen(' ', "T", 1);
    DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_account_config(row: &Row) -> JsonValue {
    row.get("config").cloned().unwrap_or(JsonValue::Null)
}

/// Pulls the client-relevant `interface` sub-object (if any) out of an
/// account's freeform `config` JSON. `None` if the config carries no
/// interface override at all, leaving the session's current interface in
/// place.
pub fn parse_interface(config: &JsonValue) -> Option<super::wire::InterfaceView> {
    let ipv4 = config.get("ipv4").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
    let ipv6 = config.get("ipv6").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
    if ipv4.is_none() && ipv6.is_none() {
        return None;
    }
    Some(super::wire::InterfaceView { ipv4, ipv6 })
}

pub fn parse_client(row: &Row) -> Option<Client> {
    Some(Client {
        id: ClientId::from(uuid_field(row, "id")?),
        account_id: AccountId::from(uuid_field(row, "account_id")?),
        actor_id: ActorId::from(uuid_field(row, "actor_id")?),
        external_id: str_field(row, "external_id").unwrap_or_default().to_string(),
        fingerprints: ClientFingerprints {
            device_serial: str_field(row, "device_serial").map(str::to_string),
            identifier_for_vendor: str_field(row, "identifier_for_vendor").map(str::to_string),
            firebase_installation_id: str_field(row, "firebase_installation_id")
                .map(str::to_string),
        },
        verified_at: timestamptz_field(row, "verified_at"),
        deleted_at: timestamptz_field(row, "deleted_at"),
    })
}

pub fn parse_membership(row: &Row) -> Option<Membership> {
    Some(Membership {
        id: MembershipId::from(uuid_field(row, "id")?),
        account_id: AccountId::from(uuid_field(row, "account_id")?),
        actor_id: ActorId::from(uuid_field(row, "actor_id")?),
        group_id: GroupId::from(uuid_field(row, "group_id")?),
    })
}

pub fn parse_policy(row: &Row) -> Option<Policy> {
    let conditions = row
        .get("conditions")
        .and_then(|v| serde_json::from_value::<Vec<Condition>>(v.clone()).ok())
        .unwrap_or_default();
    Some(Policy {
        id: PolicyId::from(uuid_field(row, "id")?),
        account_id: AccountId::from(uuid_field(row, "account_id")?),
        group_id: GroupId::from(uuid_field(row, "group_id")?),
        resource_id: ResourceId::from(uuid_field(row, "resource_id")?),
        conditions,
        disabled_at: timestamptz_field(row, "disabled_at"),
    })
}

fn parse_resource_type(s: &str) -> ResourceType {
    match s {
        "ip" => ResourceType::Ip,
        "dns" => ResourceType::Dns,
        "internet" => ResourceType::Internet,
        _ => ResourceType::Cidr,
    }
}

fn parse_ip_stack(s: &str) -> Option<IpStack> {
    match s {
        "ipv4_only" => Some(IpStack::Ipv4Only),
        "ipv6_only" => Some(IpStack::Ipv6Only),
        "dual_stack" => Some(IpStack::DualStack),
        _ => None,
    }
}

pub fn parse_resource(row: &Row) -> Option<Resource> {
    let filters = row
        .get("filters")
        .and_then(|v| serde_json::from_value::<Vec<PortFilter>>(v.clone()).ok())
        .unwrap_or_default();
    Some(Resource {
        id: ResourceId::from(uuid_field(row, "id")?),
        account_id: AccountId::from(uuid_field(row, "account_id")?),
        site_id: uuid_field(row, "site_id").map(SiteId::from),
        name: str_field(row, "name").unwrap_or_default().to_string(),
        resource_type: parse_resource_type(str_field(row, "type").unwrap_or_default()),
        ip_stack: str_field(row, "ip_stack").and_then(parse_ip_stack),
        filters,
        address: str_field(row, "address").unwrap_or_default().to_string(),
        deleted_at: timestamptz_field(row, "deleted_at"),
    })
}

pub fn parse_site(row: &Row) -> Option<Site> {
    Some(Site {
        id: SiteId::from(uuid_field(row, "id")?),
        account_id: AccountId::from(uuid_field(row, "account_id")?),
        name: str_field(row, "name").unwrap_or_default().to_string(),
        deleted_at: timestamptz_field(row, "deleted_at"),
    })
}
