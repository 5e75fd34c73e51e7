// src/core/presence/node_select.rs

//! Serving-node selection for the flow handshake (§4.7, §4.8 step 2):
//! filter online nodes in the resource's site by version compatibility and
//! by whether the node's wildcard-DNS support can represent the resource,
//! then prefer a node the client is already multiplexed onto.

use crate::core::ids::ServingNodeId;
use crate::core::model::{Resource, ResourceType, ServingNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelectionError {
    /// No online node at all in the resource's site.
    Offline,
    /// Online nodes exist, but none can represent this resource at the
    /// client's version.
    VersionMismatch,
}

/// `[major.(minor-1).0, major.(minor+2).0)` per §4.7.
fn version_compatible(client: (u32, u32, u32), node: (u32, u32, u32)) -> bool {
    if node.0 != client.0 {
        return false;
    }
    let low = client.1.saturating_sub(1);
    let high = client.1 + 2;
    node.1 >= low && node.1 < high
}

/// Pre-1.2 servers only understand a wildcard DNS pattern with a single
/// leading `*`. `**.` down-converts to `*.`; any `?`, or a `**` that isn't a
/// bare prefix, makes the resource unrepresentable on that node.
fn downconvert_wildcard(pattern: &str) -> Option<String> {
    if pattern.contains('?') {
        return None;
    }
    if let Some(rest) = pattern.strip_prefix("**.") {
        return Some(format!("*.{rest}"));
    }
    if pattern.contains("**") {
        return None;
    }
    if let Some(rest) = pattern.strip_prefix('*') {
        if rest.contains('*') {
            return None;
        }
        return Some(pattern.to_string());
    }
    if pattern.contains('*') {
        return None;
    }
    Some(pattern.to_string())
}

fn supports_full_wildcards(version: (u32, u32, u32)) -> bool {
    version.0 > 1 || (version.0 == 1 && version.1 >= 2)
}

fn can_represent(node: &ServingNode, resource: &Resource) -> bool {
    if resource.resource_type != ResourceType::Dns {
        return true;
    }
    if supports_full_wildcards(node.version) {
        return true;
    }
    downconvert_wildcard(&resource.address).is_some()
}

/// Whether at least one online node in `online_nodes_in_site` could serve
/// `resource` at `client_version` — the site-reachability half of
/// Invariant 1 ("connectable" requires a compatible online node), used by
/// the session layer to filter the connectable set before it reaches the
/// wire, independently of actually picking one for a flow handshake.
pub fn is_reachable(
    client_version: (u32, u32, u32),
    resource: &Resource,
    online_nodes_in_site: &[ServingNode],
) -> bool {
    online_nodes_in_site
        .iter()
        .any(|n| n.online && version_compatible(client_version, n.version) && can_represent(n, resource))
}

/// Selects the serving node to route a flow through. `connected_node_ids`
/// lets an already-multiplexed client reuse a node instead of spreading
/// across every compatible candidate.
pub fn select_serving_node(
    client_version: (u32, u32, u32),
    resource: &Resource,
    online_nodes_in_site: &[ServingNode],
    connected_node_ids: &[ServingNodeId],
) -> Result<ServingNode, NodeSelectionError> {
    if online_nodes_in_site.is_empty() {
        return Err(NodeSelectionError::Offline);
    }

    let mut compatible: Vec<&ServingNode> = online_nodes_in_site
        .iter()
        .filter(|n| version_compatible(client_version, n.version) && can_represent(n, resource))
        .collect();

    if compatible.is_empty() {
        return Err(NodeSelectionError::VersionMismatch);
    }

    // Stable order so repeated calls with the same candidate set agree;
    // the model carries no node geo, so "pick by location" (§4.7) reduces
    // to this deterministic tie-break once multiplexing doesn't apply.
    compatible.sort_by_key(|n| n.id);

    if let Some(reused) = compatible
        .iter()
        .find(|n| connected_node_ids.contains(&n.id))
    {
        return Ok((*reused).clone());
    }

    Ok(compatible[0].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{AccountId, ResourceId, SiteId};
    use crate::core::model::IpStack;
    use uuid::Uuid;

    fn node(version: (u32, u32, u32)) -> ServingNode {
        ServingNode {
            id: ServingNodeId::from(Uuid::new_v4()),
            site_id: SiteId::from(Uuid::new_v4()),
            version,
            online: true,
            pubkey: "node-pub".into(),
        }
    }

    fn dns_resource(address: &str) -> Resource {
        Resource {
            id: ResourceId::from(Uuid::new_v4()),
            account_id: AccountId::from(Uuid::new_v4()),
            site_id: None,
            name: "app".into(),
            resource_type: ResourceType::Dns,
            ip_stack: Some(IpStack::DualStack),
            filters: vec![],
            address: address.to_string(),
            deleted_at: None,
        }
    }

    #[test]
    fn no_nodes_is_offline() {
        let r = dns_resource("api.example.com");
        assert_eq!(
            select_serving_node((1, 2, 0), &r, &[], &[]),
            Err(NodeSelectionError::Offline)
        );
    }

    #[test]
    fn out_of_range_version_is_mismatch() {
        let r = dns_resource("api.example.com");
        let n = node((1, 0, 0));
        assert_eq!(
            select_serving_node((2, 0, 0), &r, &[n], &[]),
            Err(NodeSelectionError::VersionMismatch)
        );
    }

    #[test]
    fn legacy_node_cannot_represent_double_star_outside_prefix() {
        let r = dns_resource("api.**.example.com");
        let n = node((1, 1, 0));
        assert_eq!(
            select_serving_node((1, 1, 0), &r, &[n], &[]),
            Err(NodeSelectionError::VersionMismatch)
        );
    }

    #[test]
    fn legacy_node_accepts_downconverted_double_star_prefix() {
        let r = dns_resource("**.example.com");
        let n = node((1, 1, 0));
        let selected = select_serving_node((1, 1, 0), &r, &[n.clone()], &[]).unwrap();
        assert_eq!(selected.id, n.id);
    }

    #[test]
    fn prefers_already_connected_node() {
        let r = dns_resource("api.example.com");
        let a = node((1, 2, 0));
        let b = node((1, 2, 0));
        let selected = select_serving_node((1, 2, 0), &r, &[a.clone(), b.clone()], &[b.id]).unwrap();
        assert_eq!(selected.id, b.id);
    }
}
