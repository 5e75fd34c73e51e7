// tests/flow_handshake_test.rs
//
// The Flow Handshake's bookkeeping layers (per-session single-flight,
// cross-task reply routing) and its deterministic credential derivation,
// exercised together as a full request/reply round trip rather than as
// isolated unit calls.

use chrono::Utc;
use perimeterd::core::flow::{
    await_node_reply, build_policy_authorization, derive_ice_credentials, derive_preshared_key, FlowFailure, FlowRouter,
    NodeConnectReply, PendingFlows,
};
use perimeterd::core::ids::{ClientId, MembershipId, PolicyAuthorizationId, PolicyId, ResourceId, ServingNodeId, SiteId};
use std::time::Duration;
use uuid::Uuid;

fn reply(policy_authorization_id: PolicyAuthorizationId, resource_id: ResourceId) -> NodeConnectReply {
    NodeConnectReply {
        policy_authorization_id,
        resource_id,
        site_id: SiteId::from(Uuid::new_v4()),
        node_id: ServingNodeId::from(Uuid::new_v4()),
        node_pubkey: "node-pubkey".into(),
        node_ipv4: None,
        node_ipv6: None,
        preshared_key: "psk".into(),
        ice_credentials: derive_ice_credentials("client", "client-pubkey", "node", "node-pubkey"),
    }
}

#[tokio::test]
async fn a_flow_router_reply_unblocks_the_waiting_pending_flow() {
    let mut pending = PendingFlows::new();
    let router = FlowRouter::new();
    let resource_id = ResourceId::from(Uuid::new_v4());
    let policy_authorization_id = PolicyAuthorizationId::from(Uuid::new_v4());

    let local_rx = pending.try_begin(resource_id).expect("first request should arm");
    let router_rx = router.register(policy_authorization_id);

    // A second local request for the same resource is rejected outright
    // (single-flight), without ever reaching the router.
    assert!(pending.try_begin(resource_id).is_none());

    // The node's reply arrives on a separate task, addressed only by the
    // policy_authorization_id minted for the request.
    assert!(router.resolve(policy_authorization_id, reply(policy_authorization_id, resource_id)));

    let routed = router_rx.await.unwrap();
    assert_eq!(routed.resource_id, resource_id);

    // The session's own PendingFlows entry is resolved independently, by
    // whatever glue code forwards the routed reply into it.
    assert!(pending.resolve(resource_id, routed));
    let got = local_rx.await.unwrap();
    assert_eq!(got.policy_authorization_id, policy_authorization_id);
}

#[tokio::test]
async fn a_cancelled_pending_flow_makes_a_late_reply_a_harmless_no_op() {
    let mut pending = PendingFlows::new();
    let resource_id = ResourceId::from(Uuid::new_v4());
    pending.try_begin(resource_id).unwrap();
    pending.cancel(resource_id);

    assert!(!pending.is_pending(resource_id));
    assert!(!pending.resolve(resource_id, reply(PolicyAuthorizationId::from(Uuid::new_v4()), resource_id)));
}

#[tokio::test]
async fn await_node_reply_times_out_as_offline_when_nobody_resolves_it() {
    let mut pending = PendingFlows::new();
    let resource_id = ResourceId::from(Uuid::new_v4());
    let rx = pending.try_begin(resource_id).unwrap();

    let outcome = await_node_reply(rx, Duration::from_millis(20)).await;
    assert_eq!(outcome, Err(FlowFailure::Offline));
}

#[tokio::test]
async fn await_node_reply_surfaces_a_reply_delivered_before_the_timeout() {
    let mut pending = PendingFlows::new();
    let resource_id = ResourceId::from(Uuid::new_v4());
    let rx = pending.try_begin(resource_id).unwrap();
    let policy_authorization_id = PolicyAuthorizationId::from(Uuid::new_v4());

    pending.resolve(resource_id, reply(policy_authorization_id, resource_id));
    let outcome = await_node_reply(rx, Duration::from_secs(1)).await;
    assert_eq!(outcome.unwrap().policy_authorization_id, policy_authorization_id);
}

#[test]
fn credential_derivation_is_deterministic_and_actor_sensitive() {
    let secret = b"flow-secret";
    let psk_1 = derive_preshared_key(secret, "client-1", "client-pubkey", "node-1");
    let psk_2 = derive_preshared_key(secret, "client-1", "client-pubkey", "node-1");
    assert_eq!(psk_1, psk_2);

    let psk_other_node = derive_preshared_key(secret, "client-1", "client-pubkey", "node-2");
    assert_ne!(psk_1, psk_other_node);

    let ice_1 = derive_ice_credentials("client-1", "client-pubkey", "node-1", "node-pubkey");
    let ice_2 = derive_ice_credentials("client-1", "client-pubkey", "node-1", "node-pubkey");
    assert_eq!(ice_1, ice_2);

    let ice_other_client = derive_ice_credentials("client-2", "client-pubkey", "node-1", "node-pubkey");
    assert_ne!(ice_1.client_user, ice_other_client.client_user);
}

#[test]
fn build_policy_authorization_mints_a_fresh_audit_row_per_handshake() {
    let policy_id = PolicyId::from(Uuid::new_v4());
    let client_id = ClientId::from(Uuid::new_v4());
    let node_id = ServingNodeId::from(Uuid::new_v4());
    let resource_id = ResourceId::from(Uuid::new_v4());
    let membership_id = Some(MembershipId::from(Uuid::new_v4()));
    let expires_at = Utc::now();

    let a = build_policy_authorization(policy_id, client_id, node_id, resource_id, membership_id, expires_at, None, None, None);
    let b = build_policy_authorization(policy_id, client_id, node_id, resource_id, membership_id, expires_at, None, None, None);

    assert_ne!(a.id, b.id);
    assert_ne!(a.token, b.token);
    assert_eq!(a.policy_id, policy_id);
    assert_eq!(a.resource_id, resource_id);
    assert_eq!(a.expires_at, expires_at);
}
