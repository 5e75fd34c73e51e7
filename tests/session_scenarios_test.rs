// tests/session_scenarios_test.rs
//
// End-to-end scenarios for the Session Actor: a client's view of its own
// resource set and flow handshakes as the authorization cache and presence
// change underneath it.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use perimeterd::core::change_bus::ChangeBusHandle;
use perimeterd::core::errors::PlaneError;
use perimeterd::core::flow::{
    derive_ice_credentials, AuthorizePolicyRequest, FlowRouter, NodeConnectReply, NodeDispatcher,
};
use perimeterd::core::ids::{
    AccountId, ActorId, ClientId, GroupId, MembershipId, PolicyId, ResourceId, ServingNodeId, SiteId,
};
use perimeterd::core::model::{IpStack, Policy, Relay, Resource, ResourceType, ServingNode};
use perimeterd::core::presence::PresenceHandle;
use perimeterd::core::replication::{Change, ChangeOp};
use perimeterd::core::session::{
    ChangeOutcome, InterfaceView, OutboundFrame, SessionActor, SessionIdentity, SessionState,
};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

fn identity() -> SessionIdentity {
    SessionIdentity {
        account_id: AccountId::from(Uuid::new_v4()),
        actor_id: ActorId::from(Uuid::new_v4()),
        client_id: ClientId::from(Uuid::new_v4()),
        client_pubkey: "client-pubkey".into(),
        client_version: (1, 4, 0),
        client_geo: None,
        client_ip: Some("203.0.113.7".parse::<IpAddr>().unwrap()),
        user_agent: Some("test-harness/1.0".into()),
        flow_secret: Arc::from(vec![7u8; 32]),
    }
}

fn state() -> SessionState {
    SessionState::new(
        identity(),
        InterfaceView::default(),
        Utc::now() + ChronoDuration::days(1),
        ChronoDuration::days(30),
    )
}

fn site() -> SiteId {
    SiteId::from(Uuid::new_v4())
}

fn resource(site_id: SiteId) -> Resource {
    Resource {
        id: ResourceId::from(Uuid::new_v4()),
        account_id: AccountId::from(Uuid::new_v4()),
        site_id: Some(site_id),
        name: "db".into(),
        resource_type: ResourceType::Cidr,
        ip_stack: Some(IpStack::DualStack),
        filters: vec![],
        address: "10.0.0.0/24".into(),
        deleted_at: None,
    }
}

fn policy(account_id: AccountId, group_id: GroupId, resource_id: ResourceId) -> Policy {
    Policy {
        id: PolicyId::from(Uuid::new_v4()),
        account_id,
        group_id,
        resource_id,
        conditions: vec![],
        disabled_at: None,
    }
}

fn online_node(site_id: SiteId) -> ServingNode {
    ServingNode {
        id: ServingNodeId::from(Uuid::new_v4()),
        site_id,
        version: (1, 4, 0),
        online: true,
        pubkey: "node-pubkey".into(),
    }
}

fn relay() -> Relay {
    Relay {
        id: perimeterd::core::ids::RelayId::from(Uuid::new_v4()),
        ipv4: Some("192.0.2.1".parse().unwrap()),
        ipv6: None,
        port: 3478,
        stamp_secret: "stamp".into(),
        lat: None,
        lon: None,
    }
}

// S1 — Initial connection: a membership grants one resource, one serving
// node for its site is online, one relay is online. The init frame reports
// the resource, and last_seen_lsn starts at zero.
#[test]
fn s1_initial_connection_reports_reachable_resource() {
    let mut s = state();
    let site_id = site();
    let group_id = GroupId::from(Uuid::new_v4());
    let r = resource(site_id);
    let p = policy(s.account_id(), group_id, r.id);

    s.seed_resource(r.clone());
    s.seed_policy(p);
    s.seed_membership(group_id, MembershipId::from(Uuid::new_v4()));

    assert_eq!(s.last_seen_lsn(), perimeterd::core::wal::Lsn::ZERO);

    let node = online_node(site_id);
    let frame = s.initial_push(Utc::now(), &[relay()], &[node]);
    match frame {
        OutboundFrame::Init { resources, relays, .. } => {
            assert_eq!(resources.len(), 1);
            assert_eq!(resources[0].id, r.id);
            assert_eq!(relays.len(), 1);
        }
        other => panic!("expected Init, got {other:?}"),
    }
}

// S2 — Policy delete removes a resource: exactly one resource_deleted,
// never a resource_created_or_updated for it.
#[test]
fn s2_policy_delete_removes_resource() {
    let mut s = state();
    let site_id = site();
    let group_id = GroupId::from(Uuid::new_v4());
    let r = resource(site_id);
    let p = policy(s.account_id(), group_id, r.id);
    let node = online_node(site_id);

    s.seed_resource(r.clone());
    s.seed_policy(p.clone());
    s.seed_membership(group_id, MembershipId::from(Uuid::new_v4()));
    s.initial_push(Utc::now(), &[], &[node.clone()]);

    let change = Change {
        lsn: perimeterd::core::wal::Lsn(1),
        op: ChangeOp::Delete,
        table: "policies".into(),
        account_id: Some(s.account_id()),
        old: Some(policy_row(&p)),
        new: None,
    };

    let frames = match s.apply_change(&change, Utc::now(), &[node]) {
        ChangeOutcome::Frames(frames) => frames,
        ChangeOutcome::Terminate => panic!("session should not terminate on a policy delete"),
    };

    assert_eq!(frames.len(), 1);
    match &frames[0] {
        OutboundFrame::ResourceDeleted { id } => assert_eq!(*id, r.id),
        other => panic!("expected ResourceDeleted, got {other:?}"),
    }
}

// S3 — Policy retarget: moving a policy to a different resource surfaces a
// delete of the old resource followed by a create of the new one, in order.
#[test]
fn s3_policy_retarget_deletes_then_creates() {
    let mut s = state();
    let site_id = site();
    let group_id = GroupId::from(Uuid::new_v4());
    let r1 = resource(site_id);
    let r2 = resource(site_id);
    let p = policy(s.account_id(), group_id, r1.id);
    let node = online_node(site_id);

    s.seed_resource(r1.clone());
    s.seed_resource(r2.clone());
    s.seed_policy(p.clone());
    s.seed_membership(group_id, MembershipId::from(Uuid::new_v4()));
    s.initial_push(Utc::now(), &[], &[node.clone()]);

    let mut retargeted = p.clone();
    retargeted.resource_id = r2.id;
    let change = Change {
        lsn: perimeterd::core::wal::Lsn(1),
        op: ChangeOp::Update,
        table: "policies".into(),
        account_id: Some(s.account_id()),
        old: Some(policy_row(&p)),
        new: Some(policy_row(&retargeted)),
    };

    let frames = match s.apply_change(&change, Utc::now(), &[node]) {
        ChangeOutcome::Frames(frames) => frames,
        ChangeOutcome::Terminate => panic!("unexpected terminate"),
    };

    assert_eq!(frames.len(), 2);
    match &frames[0] {
        OutboundFrame::ResourceDeleted { id } => assert_eq!(*id, r1.id),
        other => panic!("expected ResourceDeleted first, got {other:?}"),
    }
    match &frames[1] {
        OutboundFrame::ResourceCreatedOrUpdated { resource } => assert_eq!(resource.id, r2.id),
        other => panic!("expected ResourceCreatedOrUpdated second, got {other:?}"),
    }
}

fn policy_row(p: &Policy) -> std::collections::HashMap<String, serde_json::Value> {
    let mut row = std::collections::HashMap::new();
    row.insert("id".into(), serde_json::json!(p.id.as_uuid().to_string()));
    row.insert("account_id".into(), serde_json::json!(p.account_id.as_uuid().to_string()));
    row.insert("group_id".into(), serde_json::json!(p.group_id.as_uuid().to_string()));
    row.insert("resource_id".into(), serde_json::json!(p.resource_id.as_uuid().to_string()));
    row.insert("conditions".into(), serde_json::json!([]));
    row.insert("disabled_at".into(), serde_json::Value::Null);
    row
}

// S6 — Relay debounce: a burst of leave/join/leave/join that ends up back
// where it started produces no frame; a permanent disconnect does, once the
// debounce fires, naming the disconnected relay.
#[test]
fn s6_relay_churn_that_nets_to_nothing_emits_no_frame() {
    let mut s = state();
    let r1 = relay();
    let r2 = relay();
    s.initial_push(Utc::now(), &[r1.clone(), r2.clone()], &[]);

    // The debounce collapses a leave/join/leave/join burst into a single
    // fire carrying only the final snapshot; since that snapshot matches
    // what's already cached, nothing should be emitted.
    let frame = s.relay_diff(Utc::now(), &[r1, r2]);
    assert!(frame.is_none());
}

#[test]
fn s6_permanent_relay_disconnect_reports_replacement() {
    let mut s = state();
    let r1 = relay();
    let r2 = relay();
    s.initial_push(Utc::now(), &[r1.clone(), r2.clone()], &[]);

    let frame = s.relay_diff(Utc::now(), &[r1.clone()]);
    match frame {
        Some(OutboundFrame::RelaysPresence { disconnected_ids, connected }) => {
            assert_eq!(disconnected_ids, vec![r2.id]);
            assert!(connected.iter().any(|v| v.id == r1.id));
        }
        other => panic!("expected RelaysPresence, got {other:?}"),
    }
}

struct RepliesAfter {
    delay: Duration,
    router: FlowRouter,
}

#[async_trait]
impl NodeDispatcher for RepliesAfter {
    async fn dispatch(&self, node_id: ServingNodeId, request: AuthorizePolicyRequest) -> Result<(), PlaneError> {
        let router = self.router.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let ice = derive_ice_credentials("client", "client-pubkey", "node", "node-pubkey");
            router.resolve(
                request.policy_authorization_id,
                NodeConnectReply {
                    policy_authorization_id: request.policy_authorization_id,
                    resource_id: request.resource_id,
                    site_id: SiteId::from(Uuid::new_v4()),
                    node_id,
                    node_pubkey: "node-pubkey".into(),
                    node_ipv4: None,
                    node_ipv6: None,
                    preshared_key: "psk".into(),
                    ice_credentials: ice,
                },
            );
        });
        Ok(())
    }
}

struct NeverReplies;

#[async_trait]
impl NodeDispatcher for NeverReplies {
    async fn dispatch(&self, _node_id: ServingNodeId, _request: AuthorizePolicyRequest) -> Result<(), PlaneError> {
        Ok(())
    }
}

fn spawn_actor(
    dispatcher: Arc<dyn NodeDispatcher>,
    flow_router: Arc<FlowRouter>,
    handshake_timeout: Duration,
) -> (
    ResourceId,
    mpsc::UnboundedSender<perimeterd::core::session::InboundFrame>,
    mpsc::UnboundedReceiver<OutboundFrame>,
    broadcast::Sender<()>,
) {
    let site_id = site();
    let group_id = GroupId::from(Uuid::new_v4());
    let r = resource(site_id);
    let node = online_node(site_id);

    let mut s = state();
    let p = policy(s.account_id(), group_id, r.id);
    s.seed_resource(r.clone());
    s.seed_policy(p);
    s.seed_membership(group_id, MembershipId::from(Uuid::new_v4()));

    let change_bus = ChangeBusHandle::new();
    let presence = PresenceHandle::new();
    presence.join_node(node);

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let (audit_tx, _audit_rx) = mpsc::unbounded_channel();

    let actor = SessionActor::new(
        s,
        change_bus,
        presence,
        flow_router,
        dispatcher,
        outbound_tx,
        inbound_rx,
        shutdown_rx,
        audit_tx,
    )
    .with_timings(Duration::from_secs(3600), Duration::from_secs(3600), handshake_timeout);

    tokio::spawn(actor.run());

    (r.id, inbound_tx, outbound_rx, shutdown_tx)
}

// S4 — Flow creation success: the serving node replies within its timeout,
// and the client receives flow_created naming the right resource.
#[tokio::test(flavor = "multi_thread")]
async fn s4_flow_creation_succeeds_when_node_replies_in_time() {
    let router = Arc::new(FlowRouter::new());
    let dispatcher: Arc<dyn NodeDispatcher> = Arc::new(RepliesAfter {
        delay: Duration::from_millis(20),
        router: (*router).clone(),
    });
    let (resource_id, inbound_tx, mut outbound_rx, _shutdown_tx) =
        spawn_actor(dispatcher, router, Duration::from_secs(1));

    // Drain the init frame.
    let _init = outbound_rx.recv().await.unwrap();

    inbound_tx
        .send(perimeterd::core::session::InboundFrame::CreateFlow {
            resource_id,
            connected_gateway_ids: vec![],
        })
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_millis(500), outbound_rx.recv())
        .await
        .expect("actor should reply before the test timeout")
        .unwrap();

    match frame {
        OutboundFrame::FlowCreated { resource_id: got, .. } => assert_eq!(got, resource_id),
        other => panic!("expected FlowCreated, got {other:?}"),
    }
}

// S5 — Flow creation timeout: the node never replies, so the handshake fails
// with `offline` once the (shortened, for the test) timeout elapses.
#[tokio::test(flavor = "multi_thread")]
async fn s5_flow_creation_times_out_when_node_never_replies() {
    let router = Arc::new(FlowRouter::new());
    let dispatcher: Arc<dyn NodeDispatcher> = Arc::new(NeverReplies);
    let (resource_id, inbound_tx, mut outbound_rx, _shutdown_tx) =
        spawn_actor(dispatcher, router, Duration::from_millis(50));

    let _init = outbound_rx.recv().await.unwrap();

    inbound_tx
        .send(perimeterd::core::session::InboundFrame::CreateFlow {
            resource_id,
            connected_gateway_ids: vec![],
        })
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_millis(500), outbound_rx.recv())
        .await
        .expect("actor should report failure before the test timeout")
        .unwrap();

    match frame {
        OutboundFrame::FlowCreationFailed { resource_id: got, reason } => {
            assert_eq!(got, resource_id);
            assert!(matches!(
                reason,
                perimeterd::core::session::FlowFailureReason::Offline
            ));
        }
        other => panic!("expected FlowCreationFailed, got {other:?}"),
    }
}

