// src/core/flow/mod.rs

//! C8 — Flow Handshake: request/response coordination between a Session
//! Actor and a serving-node actor, with a per-request timeout and a
//! single-flight guarantee per `(session, resource_id)` (§4.8, §5).
//!
//! The actual node-actor transport is out of scope here (it's whatever the
//! server layer uses to reach a serving node's session); this module only
//! owns the pending-flow bookkeeping, the deterministic credential
//! derivation, and the PolicyAuthorization row construction.

pub mod ice;

pub use ice::{derive_ice_credentials, derive_preshared_key, IceCredentials};

use crate::core::ids::{
    ClientId, MembershipId, PolicyAuthorizationId, PolicyId, ResourceId, ServingNodeId, SiteId,
};
use crate::core::model::PolicyAuthorization;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// The serving node's affirmative reply to `authorize_policy` (§4.8 step 7).
/// `policy_authorization_id` is how [`FlowRouter`] routes this reply — which
/// arrives on whatever task owns the node's own connection — back to the
/// Session Actor awaiting it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConnectReply {
    pub policy_authorization_id: PolicyAuthorizationId,
    pub resource_id: ResourceId,
    pub site_id: SiteId,
    pub node_id: ServingNodeId,
    pub node_pubkey: String,
    pub node_ipv4: Option<Ipv4Addr>,
    pub node_ipv6: Option<Ipv6Addr>,
    pub preshared_key: String,
    pub ice_credentials: IceCredentials,
}

/// Why a `create_flow` request never reached `flow_created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowFailure {
    /// The node didn't reply within [`DEFAULT_HANDSHAKE_TIMEOUT`].
    Offline,
    /// Another `create_flow` for the same resource is already in flight.
    AlreadyInFlight,
}

/// Tracks in-flight flow handshakes for one session, keyed by resource id,
/// enforcing single-flight per Invariant/Property 6.
#[derive(Default)]
pub struct PendingFlows {
    inflight: HashMap<ResourceId, oneshot::Sender<NodeConnectReply>>,
}

impl PendingFlows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a new pending flow for `resource_id`. Returns `None` (rejecting
    /// the caller with `AlreadyInFlight`) if one is already pending —
    /// §4.8 step 9: the second request is rejected as `offline` until the
    /// first resolves.
    pub fn try_begin(&mut self, resource_id: ResourceId) -> Option<oneshot::Receiver<NodeConnectReply>> {
        if self.inflight.contains_key(&resource_id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(resource_id, tx);
        Some(rx)
    }

    /// Resolves a pending flow with the node's reply. Returns `true` if a
    /// waiter existed (i.e. this wasn't a stale or duplicate reply).
    pub fn resolve(&mut self, resource_id: ResourceId, reply: NodeConnectReply) -> bool {
        match self.inflight.remove(&resource_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drops a pending flow without resolving it — used on timeout, or when
    /// the session itself is torn down (§5: termination cancels pending
    /// flow timers without a reply).
    pub fn cancel(&mut self, resource_id: ResourceId) {
        self.inflight.remove(&resource_id);
    }

    pub fn cancel_all(&mut self) {
        self.inflight.clear();
    }

    pub fn is_pending(&self, resource_id: ResourceId) -> bool {
        self.inflight.contains_key(&resource_id)
    }
}

/// Races the node's reply against the handshake timeout (§4.8 steps 6–8).
pub async fn await_node_reply(
    rx: oneshot::Receiver<NodeConnectReply>,
    timeout: Duration,
) -> Result<NodeConnectReply, FlowFailure> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(reply)) => Ok(reply),
        // Sender dropped (session torn down mid-flight) or the timer fired first.
        Ok(Err(_)) | Err(_) => Err(FlowFailure::Offline),
    }
}

/// Builds the audit row minted on every successful handshake (§4.8 step 4).
/// `expires_at` should already reflect the same expiry the client was
/// granted by `authorize_resource`.
#[allow(clippy::too_many_arguments)]
pub fn build_policy_authorization(
    policy_id: PolicyId,
    client_id: ClientId,
    serving_node_id: ServingNodeId,
    resource_id: ResourceId,
    membership_id: Option<crate::core::ids::MembershipId>,
    expires_at: DateTime<Utc>,
    client_ip: Option<IpAddr>,
    user_agent: Option<String>,
    gateway_ip: Option<IpAddr>,
) -> PolicyAuthorization {
    PolicyAuthorization {
        id: PolicyAuthorizationId::from(Uuid::new_v4()),
        token: Uuid::new_v4().to_string(),
        policy_id,
        client_id,
        serving_node_id,
        resource_id,
        membership_id,
        expires_at,
        client_ip,
        user_agent,
        gateway_ip,
    }
}

/// What a Session Actor asks a serving node to authorize (§4.8 steps 4–5).
/// Carries everything the node needs to mint its own side of the handshake
/// without a round trip back through the cache.
#[derive(Debug, Clone)]
pub struct AuthorizePolicyRequest {
    pub policy_authorization_id: PolicyAuthorizationId,
    pub policy_id: PolicyId,
    pub client_id: ClientId,
    pub client_pubkey: String,
    pub membership_id: Option<MembershipId>,
    pub resource_id: ResourceId,
    pub expires_at: DateTime<Utc>,
    pub preshared_key: String,
    pub client_ice_credentials: IceCredentials,
}

/// Abstraction boundary between the Session Actor and whatever transport the
/// server layer uses to reach a serving node's own session (its websocket
/// connection, in practice). Kept as a trait so `core` has no dependency on
/// the transport.
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        node_id: ServingNodeId,
        request: AuthorizePolicyRequest,
    ) -> Result<(), crate::core::errors::PlaneError>;
}

/// Process-wide registry routing an async node reply back to the Session
/// Actor awaiting it. [`PendingFlows`] alone can't do this: it's
/// session-scoped and keyed by `resource_id`, but a node's reply arrives on
/// a completely different task (the node's own websocket reader) and is only
/// addressable by the [`PolicyAuthorizationId`] minted for that request.
#[derive(Clone, Default)]
pub struct FlowRouter {
    waiters: Arc<DashMap<PolicyAuthorizationId, oneshot::Sender<NodeConnectReply>>>,
}

impl FlowRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in a reply for `id`, returning the receiving half.
    pub fn register(&self, id: PolicyAuthorizationId) -> oneshot::Receiver<NodeConnectReply> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        rx
    }

    /// Delivers a node's reply. Returns `true` if a waiter was still
    /// registered (i.e. this wasn't a reply to a request that already timed
    /// out or was cancelled).
    pub fn resolve(&self, id: PolicyAuthorizationId, reply: NodeConnectReply) -> bool {
        match self.waiters.remove(&id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drops a registered waiter without resolving it, used once
    /// [`await_node_reply`] times out so a late reply is a harmless no-op.
    pub fn cancel(&self, id: PolicyAuthorizationId) {
        self.waiters.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::ResourceId;
    use uuid::Uuid;

    fn reply(resource_id: ResourceId) -> NodeConnectReply {
        NodeConnectReply {
            policy_authorization_id: PolicyAuthorizationId::from(Uuid::new_v4()),
            resource_id,
            site_id: SiteId::from(Uuid::new_v4()),
            node_id: ServingNodeId::from(Uuid::new_v4()),
            node_pubkey: "pub".into(),
            node_ipv4: None,
            node_ipv6: None,
            preshared_key: "psk".into(),
            ice_credentials: derive_ice_credentials("c", "cp", "n", "np"),
        }
    }

    #[test]
    fn second_request_for_same_resource_is_rejected() {
        let mut pending = PendingFlows::new();
        let resource_id = ResourceId::from(Uuid::new_v4());
        assert!(pending.try_begin(resource_id).is_some());
        assert!(pending.try_begin(resource_id).is_none());
    }

    #[tokio::test]
    async fn resolve_delivers_reply_to_waiter() {
        let mut pending = PendingFlows::new();
        let resource_id = ResourceId::from(Uuid::new_v4());
        let rx = pending.try_begin(resource_id).unwrap();
        assert!(pending.resolve(resource_id, reply(resource_id)));
        let got = await_node_reply(rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.resource_id, resource_id);
    }

    #[tokio::test]
    async fn timeout_yields_offline_and_frees_the_slot() {
        let mut pending = PendingFlows::new();
        let resource_id = ResourceId::from(Uuid::new_v4());
        let rx = pending.try_begin(resource_id).unwrap();
        let result = await_node_reply(rx, Duration::from_millis(20)).await;
        assert_eq!(result, Err(FlowFailure::Offline));
        pending.cancel(resource_id);
        assert!(!pending.is_pending(resource_id));
    }

    #[test]
    fn stale_resolve_after_cancel_is_a_noop() {
        let mut pending = PendingFlows::new();
        let resource_id = ResourceId::from(Uuid::new_v4());
        let _rx = pending.try_begin(resource_id).unwrap();
        pending.cancel(resource_id);
        assert!(!pending.resolve(resource_id, reply(resource_id)));
    }

    #[tokio::test]
    async fn router_resolves_registered_waiter() {
        let router = FlowRouter::new();
        let id = PolicyAuthorizationId::from(Uuid::new_v4());
        let rx = router.register(id);
        let resource_id = ResourceId::from(Uuid::new_v4());
        assert!(router.resolve(id, reply(resource_id)));
        let got = rx.await.unwrap();
        assert_eq!(got.resource_id, resource_id);
    }

    #[test]
    fn router_cancel_makes_late_resolve_a_noop() {
        let router = FlowRouter::new();
        let id = PolicyAuthorizationId::from(Uuid::new_v4());
        let _rx = router.register(id);
        router.cancel(id);
        assert!(!router.resolve(id, reply(ResourceId::from(Uuid::new_v4()))));
    }
}
