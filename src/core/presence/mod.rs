// src/core/presence/mod.rs

//! C7 — Presence: a cluster-wide, eventually-consistent membership map of
//! serving nodes and relays (§4.7). Modeled as a last-writer-wins map per
//! entity, joined on connect and untracked on disconnect, with a
//! `presence_diff` broadcast for subscribers. Session Actors never assume a
//! global snapshot is current — they query [`PresenceHandle::snapshot`] once
//! per debounce tick, per §5's "no hot spinloops / query once" rule.

mod node_select;
mod relay_select;

pub use node_select::{is_reachable, select_serving_node, NodeSelectionError};
pub use relay_select::select_relays;

use crate::core::ids::{RelayId, ServingNodeId, SiteId};
use crate::core::model::{Relay, ServingNode};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

const PRESENCE_DIFF_CAPACITY: usize = 256;

/// One joined/left event, broadcast to every presence subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceDiff {
    RelayJoined(Relay),
    RelayLeft(RelayId),
    NodeJoined(ServingNode),
    NodeLeft(ServingNodeId),
}

/// A point-in-time read of everything currently online. Cheap to clone;
/// callers that only need relays or only need one site's nodes should
/// prefer the narrower accessors on [`PresenceHandle`] to avoid cloning the
/// whole map.
#[derive(Debug, Clone, Default)]
pub struct PresenceSnapshot {
    pub relays: Vec<Relay>,
    pub nodes: Vec<ServingNode>,
}

struct Inner {
    relays: DashMap<RelayId, Relay>,
    nodes: DashMap<ServingNodeId, ServingNode>,
    diffs: broadcast::Sender<PresenceDiff>,
}

/// Shared handle to the process-wide presence map. Cheap to clone.
#[derive(Clone)]
pub struct PresenceHandle {
    inner: Arc<Inner>,
}

impl PresenceHandle {
    pub fn new() -> Self {
        let (diffs, _) = broadcast::channel(PRESENCE_DIFF_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                relays: DashMap::new(),
                nodes: DashMap::new(),
                diffs,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceDiff> {
        self.inner.diffs.subscribe()
    }

    pub fn join_relay(&self, relay: Relay) {
        self.inner.relays.insert(relay.id, relay.clone());
        let _ = self.inner.diffs.send(PresenceDiff::RelayJoined(relay));
    }

    pub fn leave_relay(&self, relay_id: RelayId) {
        if self.inner.relays.remove(&relay_id).is_some() {
            let _ = self.inner.diffs.send(PresenceDiff::RelayLeft(relay_id));
        }
    }

    pub fn join_node(&self, node: ServingNode) {
        self.inner.nodes.insert(node.id, node.clone());
        let _ = self.inner.diffs.send(PresenceDiff::NodeJoined(node));
    }

    pub fn leave_node(&self, node_id: ServingNodeId) {
        if self.inner.nodes.remove(&node_id).is_some() {
            let _ = self.inner.diffs.send(PresenceDiff::NodeLeft(node_id));
        }
    }

    pub fn relays_online(&self) -> Vec<Relay> {
        self.inner.relays.iter().map(|r| r.value().clone()).collect()
    }

    pub fn nodes_in_site(&self, site_id: SiteId) -> Vec<ServingNode> {
        self.inner
            .nodes
            .iter()
            .filter(|n| n.online && n.site_id == site_id)
            .map(|n| n.value().clone())
            .collect()
    }

    pub fn sites_with_online_nodes(&self) -> HashSet<SiteId> {
        self.inner
            .nodes
            .iter()
            .filter(|n| n.online)
            .map(|n| n.site_id)
            .collect()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            relays: self.relays_online(),
            nodes: self.inner.nodes.iter().map(|n| n.value().clone()).collect(),
        }
    }
}

impl Default for PresenceHandle {
    fn default() -> Self {
        Self::new()
    }
}
