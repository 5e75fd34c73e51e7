// src/core/session/actor.rs

//! C6 — Session Actor: one per live client connection. [`SessionState`] is
//! the pure, synchronously-testable half (cache mutation, relay debounce
//! logic, credential views); [`SessionActor`] is the async driver that wires
//! it to the Change Bus, Presence, the Flow Handshake, and the client's own
//! websocket.

use super::parse;
use super::wire::{
    FlowFailureReason, IceCredentialsView, InboundFrame, InterfaceView, OutboundFrame, RelayView,
    ResourceView,
};
use crate::core::authz::{AuthorizationCache, CacheDelta, Denial};
use crate::core::change_bus::ChangeBusHandle;
use crate::core::flow::{
    await_node_reply, build_policy_authorization, derive_ice_credentials, derive_preshared_key,
    AuthorizePolicyRequest, FlowRouter, NodeDispatcher, PendingFlows, DEFAULT_HANDSHAKE_TIMEOUT,
};
use crate::core::ids::{AccountId, ActorId, ClientId, GroupId, MembershipId, ResourceId};
use crate::core::metrics;
use crate::core::model::{Policy, PolicyAuthorization, Posture, Relay, Resource, ResourceType, ServingNode, Subject};
use crate::core::presence::{
    is_reachable, select_relays, select_serving_node, NodeSelectionError, PresenceDiff, PresenceHandle,
};
use crate::core::replication::{Change, ChangeOp};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// How long minted TURN credentials remain valid. The wire format (§6.2)
/// only fixes the shape of the username/password, not this window; an hour
/// matches the relay's own stamp-secret rotation cadence assumed elsewhere.
const RELAY_CREDENTIAL_TTL: Duration = Duration::from_secs(3600);

const DEFAULT_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_PRESENCE_DEBOUNCE: Duration = Duration::from_secs(1);

/// What a single driver iteration produced for the client, or a signal that
/// the session itself must end (the client's own record was deleted).
pub enum ChangeOutcome {
    Frames(Vec<OutboundFrame>),
    Terminate,
}

/// Identity and derived secrets a session is constructed from. Loaded once,
/// up front, by whatever queries the database during initialization (§4.6
/// step 1) — `SessionState` itself never touches the database.
pub struct SessionIdentity {
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub client_id: ClientId,
    pub client_pubkey: String,
    pub client_version: (u32, u32, u32),
    pub client_geo: Option<(f64, f64)>,
    pub client_ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub flow_secret: Arc<[u8]>,
}

/// The pure, synchronously-testable half of the Session Actor: the
/// Authorization Cache plus everything needed to turn its deltas and the
/// presence snapshot into wire frames. No I/O of any kind.
pub struct SessionState {
    identity: SessionIdentity,
    interface: InterfaceView,
    cache: AuthorizationCache,
    last_seen_lsn: crate::core::wal::Lsn,
    cached_relays: Vec<Relay>,
    pending_flows: PendingFlows,
    /// Resource ids most recently pushed to the client as connectable.
    /// Distinct from the cache's own `connectable` set: a resource can be
    /// cache-connectable (policy/conditions allow it) yet invisible here
    /// because Invariant 1 additionally requires its site to have an
    /// online, version-compatible serving node — see [`Self::reconcile_presence`].
    visible: HashSet<ResourceId>,
}

impl SessionState {
    pub fn new(
        identity: SessionIdentity,
        interface: InterfaceView,
        credential_expires_at: DateTime<Utc>,
        max_expiry_horizon: ChronoDuration,
    ) -> Self {
        Self {
            identity,
            interface,
            cache: AuthorizationCache::new(credential_expires_at, max_expiry_horizon),
            last_seen_lsn: crate::core::wal::Lsn::ZERO,
            cached_relays: Vec::new(),
            pending_flows: PendingFlows::new(),
            visible: HashSet::new(),
        }
    }

    pub fn account_id(&self) -> AccountId {
        self.identity.account_id
    }

    pub fn client_id(&self) -> ClientId {
        self.identity.client_id
    }

    pub fn last_seen_lsn(&self) -> crate::core::wal::Lsn {
        self.last_seen_lsn
    }

    fn build_subject(&self, now: DateTime<Utc>) -> Subject {
        Subject {
            remote_ip: self.identity.client_ip,
            geo: self.identity.client_geo,
            posture: Posture::default(),
            now,
        }
    }

    // -- Initialization (§4.6 steps 1-3) -------------------------------

    pub fn seed_resource(&mut self, resource: Resource) {
        self.cache.seed_resource(resource);
    }

    pub fn seed_policy(&mut self, policy: Policy) {
        self.cache.seed_policy(policy);
    }

    pub fn seed_membership(&mut self, group_id: GroupId, membership_id: MembershipId) {
        self.cache.seed_membership(group_id, membership_id);
    }

    /// Computes the initial connectable set and selects the client's two
    /// nearest relays, producing the `init` frame (§4.6 step 3).
    pub fn initial_push(
        &mut self,
        now: DateTime<Utc>,
        available_relays: &[Relay],
        online_nodes: &[ServingNode],
    ) -> OutboundFrame {
        let subject = self.build_subject(now);
        let delta = self.cache.recompute_connectable_resources(&subject);
        let mut resources = Vec::with_capacity(delta.added.len());
        for resource in delta.added {
            if self.resource_reachable(&resource, online_nodes) {
                self.visible.insert(resource.id);
                resources.push(ResourceView::from(&resource));
            }
        }

        let selected = select_relays(self.identity.client_geo, available_relays);
        self.cached_relays = selected.clone();
        let relays = selected.iter().map(|r| self.relay_view(r, now)).collect();

        OutboundFrame::Init {
            resources,
            relays,
            interface: self.interface.clone(),
        }
    }

    // -- Change Bus events (§4.6 event handling) -----------------------

    /// Applies one replicated row mutation. Drops it outright if its LSN is
    /// at or behind what this session has already applied (Invariant 1 is
    /// the per-account LSN ordering guarantee; the connectable-set filter
    /// by online/compatible serving node is also Invariant 1, enforced in
    /// [`Self::reconcile_presence`]).
    pub fn apply_change(&mut self, change: &Change, now: DateTime<Utc>, online_nodes: &[ServingNode]) -> ChangeOutcome {
        if change.lsn <= self.last_seen_lsn {
            return ChangeOutcome::Frames(Vec::new());
        }

        let subject = self.build_subject(now);
        let outcome = match change.table.as_str() {
            "accounts" => ChangeOutcome::Frames(self.handle_account(change)),
            "memberships" => ChangeOutcome::Frames(self.handle_membership(change, &subject, online_nodes)),
            "clients" => self.handle_client(change, &subject, online_nodes),
            "sites" => ChangeOutcome::Frames(self.handle_site(change, online_nodes)),
            "policies" => ChangeOutcome::Frames(self.handle_policy(change, &subject, online_nodes)),
            "resources" => ChangeOutcome::Frames(self.handle_resource(change, &subject, online_nodes)),
            other => {
                debug!(table = other, "change on a table this session ignores");
                ChangeOutcome::Frames(Vec::new())
            }
        };

        self.last_seen_lsn = change.lsn;
        outcome
    }

    fn handle_account(&mut self, change: &Change) -> Vec<OutboundFrame> {
        if change.account_id != Some(self.identity.account_id) {
            return Vec::new();
        }
        let old_config = change.old.as_ref().and_then(|row| row.get("config"));
        let new_config = change.new.as_ref().and_then(|row| row.get("config"));
        if old_config == new_config {
            return Vec::new();
        }
        if let Some(new_config) = new_config {
            if let Some(interface) = parse::parse_interface(new_config) {
                self.interface = interface;
            }
        }
        vec![OutboundFrame::ConfigChanged {
            interface: self.interface.clone(),
        }]
    }

    fn handle_membership(
        &mut self,
        change: &Change,
        subject: &Subject,
        online_nodes: &[ServingNode],
    ) -> Vec<OutboundFrame> {
        let Some(row) = change_row(change) else {
            return Vec::new();
        };
        let Some(membership) = parse::parse_membership(row) else {
            return Vec::new();
        };
        if membership.actor_id != self.identity.actor_id {
            return Vec::new();
        }
        let delta = match change.op {
            ChangeOp::Insert => self.cache.add_membership(membership.group_id, membership.id, subject),
            ChangeOp::Delete => self.cache.remove_membership(membership.group_id, subject),
            ChangeOp::Update => self.cache.add_membership(membership.group_id, membership.id, subject),
        };
        self.reconcile_presence(delta, online_nodes)
    }

    fn handle_client(
        &mut self,
        change: &Change,
        subject: &Subject,
        online_nodes: &[ServingNode],
    ) -> ChangeOutcome {
        let Some(row) = change_row(change) else {
            return ChangeOutcome::Frames(Vec::new());
        };
        let Some(client) = parse::parse_client(row) else {
            return ChangeOutcome::Frames(Vec::new());
        };
        if client.id != self.identity.client_id {
            return ChangeOutcome::Frames(Vec::new());
        }
        match change.op {
            ChangeOp::Delete => ChangeOutcome::Terminate,
            ChangeOp::Update => {
                let old_verified = change
                    .old
                    .as_ref()
                    .and_then(|r| r.get("verified_at"))
                    .cloned();
                let new_verified = change
                    .new
                    .as_ref()
                    .and_then(|r| r.get("verified_at"))
                    .cloned();
                if old_verified != new_verified {
                    let delta = self.cache.recompute_connectable_resources(subject);
                    ChangeOutcome::Frames(self.reconcile_presence(delta, online_nodes))
                } else {
                    ChangeOutcome::Frames(Vec::new())
                }
            }
            ChangeOp::Insert => ChangeOutcome::Frames(Vec::new()),
        }
    }

    fn handle_site(&mut self, change: &Change, online_nodes: &[ServingNode]) -> Vec<OutboundFrame> {
        let Some(site_id) = change.field("id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()) else {
            return Vec::new();
        };
        let delta = self
            .cache
            .update_resources_with_site_name(crate::core::ids::SiteId::from(site_id));
        self.reconcile_presence(delta, online_nodes)
    }

    fn handle_policy(
        &mut self,
        change: &Change,
        subject: &Subject,
        online_nodes: &[ServingNode],
    ) -> Vec<OutboundFrame> {
        let Some(row) = change_row(change) else {
            return Vec::new();
        };
        let Some(policy) = parse::parse_policy(row) else {
            return Vec::new();
        };
        if policy.account_id != self.identity.account_id {
            return Vec::new();
        }
        let delta = match change.op {
            ChangeOp::Insert => self.cache.add_policy(policy, subject),
            ChangeOp::Update => self.cache.update_policy(policy, subject),
            ChangeOp::Delete => self.cache.delete_policy(policy, subject),
        };
        self.reconcile_presence(delta, online_nodes)
    }

    fn handle_resource(
        &mut self,
        change: &Change,
        subject: &Subject,
        online_nodes: &[ServingNode],
    ) -> Vec<OutboundFrame> {
        let Some(row) = change_row(change) else {
            return Vec::new();
        };
        let Some(resource) = parse::parse_resource(row) else {
            return Vec::new();
        };
        if resource.account_id != self.identity.account_id {
            return Vec::new();
        }
        let delta = match change.op {
            ChangeOp::Delete => self.cache.remove_resource(resource.id),
            ChangeOp::Insert | ChangeOp::Update => self.cache.update_resource(resource, subject),
        };
        self.reconcile_presence(delta, online_nodes)
    }

    // -- Periodic recompute (§4.6 "Periodic recompute") ----------------

    pub fn recompute(&mut self, now: DateTime<Utc>, online_nodes: &[ServingNode]) -> Vec<OutboundFrame> {
        let subject = self.build_subject(now);
        let delta = self.cache.recompute_connectable_resources(&subject);
        self.reconcile_presence(delta, online_nodes)
    }

    // -- Presence-aware reachability (Invariant 1) ----------------------

    /// Whether `resource` currently has a path to the client: internet-type
    /// resources have no site and are always reachable; sited resources
    /// need at least one online, version-compatible serving node in their
    /// own site.
    fn resource_reachable(&self, resource: &Resource, online_nodes: &[ServingNode]) -> bool {
        if resource.resource_type == ResourceType::Internet {
            return true;
        }
        let Some(site_id) = resource.site_id else {
            return true;
        };
        let in_site: Vec<ServingNode> = online_nodes
            .iter()
            .filter(|n| n.online && n.site_id == site_id)
            .cloned()
            .collect();
        is_reachable(self.identity.client_version, resource, &in_site)
    }

    /// Turns a raw cache delta into wire frames, filtering `added` resources
    /// through [`Self::resource_reachable`] and additionally re-checking
    /// every resource the cache still considers connectable but that this
    /// change didn't touch, since a presence change (a node going offline
    /// or online) can flip reachability without the cache itself changing.
    /// Removed ids always precede added/updated ones (Invariant 3, Testable
    /// Property 3).
    fn reconcile_presence(&mut self, delta: CacheDelta, online_nodes: &[ServingNode]) -> Vec<OutboundFrame> {
        let mut frames = Vec::with_capacity(delta.removed.len() + delta.added.len());
        let mut touched: HashSet<ResourceId> = HashSet::with_capacity(delta.removed.len() + delta.added.len());

        for id in delta.removed {
            touched.insert(id);
            if self.visible.remove(&id) {
                frames.push(OutboundFrame::ResourceDeleted { id });
            }
        }

        for resource in &delta.added {
            touched.insert(resource.id);
            if self.resource_reachable(resource, online_nodes) {
                self.visible.insert(resource.id);
                frames.push(OutboundFrame::ResourceCreatedOrUpdated {
                    resource: ResourceView::from(resource),
                });
            } else {
                self.visible.remove(&resource.id);
            }
        }

        let connectable_ids: Vec<ResourceId> = self.cache.connectable_resource_ids().copied().collect();
        for id in connectable_ids {
            if touched.contains(&id) {
                continue;
            }
            let Some(resource) = self.cache.resource(&id) else {
                continue;
            };
            let reachable = self.resource_reachable(resource, online_nodes);
            let was_visible = self.visible.contains(&id);
            if reachable && !was_visible {
                self.visible.insert(id);
                frames.push(OutboundFrame::ResourceCreatedOrUpdated {
                    resource: ResourceView::from(resource),
                });
            } else if !reachable && was_visible {
                self.visible.remove(&id);
                frames.push(OutboundFrame::ResourceDeleted { id });
            }
        }

        frames
    }

    // -- Relay presence debounce fire (§4.6 "Relay presence change") --

    /// Called once per debounce fire with the current presence snapshot's
    /// online relays. Returns `None` when the cached set is unaffected
    /// (Testable Property 4: a burst that leaves the cache intact emits
    /// nothing).
    pub fn relay_diff(&mut self, now: DateTime<Utc>, available: &[Relay]) -> Option<OutboundFrame> {
        let cached_ids: HashSet<_> = self.cached_relays.iter().map(|r| r.id).collect();
        let available_ids: HashSet<_> = available.iter().map(|r| r.id).collect();
        let disconnected: Vec<_> = cached_ids.difference(&available_ids).copied().collect();
        let need_more = self.cached_relays.len() < 2 && available.len() > self.cached_relays.len();

        if disconnected.is_empty() && !need_more {
            return None;
        }

        let selected = select_relays(self.identity.client_geo, available);
        self.cached_relays = selected.clone();
        let connected = selected.iter().map(|r| self.relay_view(r, now)).collect();
        Some(OutboundFrame::RelaysPresence {
            disconnected_ids: disconnected,
            connected,
        })
    }

    fn relay_view(&self, relay: &Relay, now: DateTime<Utc>) -> RelayView {
        let expires_at = (now + ChronoDuration::from_std(RELAY_CREDENTIAL_TTL).unwrap()).timestamp();
        let addr = match (relay.ipv4, relay.ipv6) {
            (Some(v4), _) => format!("{v4}:{}", relay.port),
            (None, Some(v6)) => format!("[{v6}]:{}", relay.port),
            (None, None) => String::new(),
        };

        let pubkey_hash = BASE64.encode(Sha256::digest(self.identity.client_pubkey.as_bytes()));
        let username = format!("{expires_at}:{pubkey_hash}");
        let password = BASE64.encode(Sha256::digest(
            format!("{expires_at}:{}:{username}", relay.stamp_secret).as_bytes(),
        ));

        RelayView {
            id: relay.id,
            kind: "turn",
            addr,
            username,
            password,
            expires_at,
        }
    }

    // -- Flow handshake entry point (§4.8 step 1) ----------------------

    pub fn resource(&self, resource_id: ResourceId) -> Option<&Resource> {
        self.cache.resource(&resource_id)
    }

    pub fn authorize(
        &self,
        resource_id: ResourceId,
        now: DateTime<Utc>,
    ) -> Result<crate::core::authz::ConnectableEntry, Denial> {
        let subject = self.build_subject(now);
        self.cache.authorize_resource(resource_id, &subject)
    }

    pub fn begin_flow(
        &mut self,
        resource_id: ResourceId,
    ) -> Option<tokio::sync::oneshot::Receiver<crate::core::flow::NodeConnectReply>> {
        self.pending_flows.try_begin(resource_id)
    }

    pub fn cancel_flow(&mut self, resource_id: ResourceId) {
        self.pending_flows.cancel(resource_id);
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }
}

fn change_row(change: &Change) -> Option<&std::collections::HashMap<String, JsonValue>> {
    change.new.as_ref().or(change.old.as_ref())
}

/// The async driver: owns a [`SessionState`] and pumps it with events from
/// the Change Bus, Presence, the client's own inbound frames, and a
/// periodic recompute timer. Runs until the client disconnects, the client
/// record is deleted upstream, or shutdown is signaled.
pub struct SessionActor {
    state: SessionState,
    change_bus: ChangeBusHandle,
    presence: PresenceHandle,
    flow_router: Arc<FlowRouter>,
    dispatcher: Arc<dyn NodeDispatcher>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
    shutdown: broadcast::Receiver<()>,
    recompute_interval: Duration,
    presence_debounce: Duration,
    handshake_timeout: Duration,
    /// Frees a resource's single-flight slot once its spawned handshake
    /// watcher completes, since that task runs without access to `state`.
    flow_done_tx: mpsc::UnboundedSender<ResourceId>,
    flow_done_rx: mpsc::UnboundedReceiver<ResourceId>,
    /// Where newly-minted audit rows go to be durably inserted (§4.8 step 4).
    /// A plain channel rather than a DB handle here, since `core` has no
    /// database dependency — the server layer owns the receiving end and the
    /// actual insert.
    audit_tx: mpsc::UnboundedSender<PolicyAuthorization>,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: SessionState,
        change_bus: ChangeBusHandle,
        presence: PresenceHandle,
        flow_router: Arc<FlowRouter>,
        dispatcher: Arc<dyn NodeDispatcher>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        inbound: mpsc::UnboundedReceiver<InboundFrame>,
        shutdown: broadcast::Receiver<()>,
        audit_tx: mpsc::UnboundedSender<PolicyAuthorization>,
    ) -> Self {
        let (flow_done_tx, flow_done_rx) = mpsc::unbounded_channel();
        Self {
            state,
            change_bus,
            presence,
            flow_router,
            dispatcher,
            outbound,
            inbound,
            shutdown,
            recompute_interval: DEFAULT_RECOMPUTE_INTERVAL,
            presence_debounce: DEFAULT_PRESENCE_DEBOUNCE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            flow_done_tx,
            flow_done_rx,
            audit_tx,
        }
    }

    /// Overrides the recompute tick, relay-presence debounce, and flow
    /// handshake timeout from their module defaults — used to thread the
    /// corresponding `[session]`/`[flow]` config values in.
    pub fn with_timings(
        mut self,
        recompute_interval: Duration,
        presence_debounce: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        self.recompute_interval = recompute_interval;
        self.presence_debounce = presence_debounce;
        self.handshake_timeout = handshake_timeout;
        self
    }

    fn push(&self, frame: OutboundFrame) {
        if matches!(frame, OutboundFrame::FlowCreationFailed { .. }) {
            metrics::FLOW_HANDSHAKES_FAILED_TOTAL.inc();
        }
        let _ = self.outbound.send(frame);
    }

    fn push_all(&self, frames: Vec<OutboundFrame>) {
        for frame in frames {
            self.push(frame);
        }
    }

    pub async fn run(mut self) {
        let account_id = self.state.account_id();
        let client_id = self.state.client_id();
        let mut change_rx = self.change_bus.subscribe(account_id);
        let mut presence_rx = self.presence.subscribe();
        let mut recompute_tick = tokio::time::interval(self.recompute_interval);
        recompute_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let init_snapshot = self.presence.snapshot();
        let init_frame = self.state.initial_push(Utc::now(), &init_snapshot.relays, &init_snapshot.nodes);
        self.push(init_frame);

        let mut debounce_deadline: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    debug!(%client_id, "session actor shutting down");
                    break;
                }

                change = change_rx.recv() => {
                    match change {
                        Ok(change) => {
                            let online_nodes = self.presence.snapshot().nodes;
                            match self.state.apply_change(&change, Utc::now(), &online_nodes) {
                                ChangeOutcome::Frames(frames) => self.push_all(frames),
                                ChangeOutcome::Terminate => {
                                    info!(%client_id, "client record removed; terminating session");
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%client_id, skipped, "change bus lagged; forcing reconnect");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = recompute_tick.tick() => {
                    let online_nodes = self.presence.snapshot().nodes;
                    let frames = self.state.recompute(Utc::now(), &online_nodes);
                    self.push_all(frames);
                }

                diff = presence_rx.recv() => {
                    match diff {
                        Ok(PresenceDiff::RelayJoined(_)) | Ok(PresenceDiff::RelayLeft(_)) => {
                            debounce_deadline = Some(tokio::time::Instant::now() + self.presence_debounce);
                        }
                        Ok(PresenceDiff::NodeJoined(_)) | Ok(PresenceDiff::NodeLeft(_)) => {
                            // A node's online/site/version status directly changes which
                            // resources are reachable (Invariant 1), unlike relay churn
                            // it isn't debounced: it doesn't fire on every client ping.
                            let online_nodes = self.presence.snapshot().nodes;
                            let frames = self.state.reconcile_presence(CacheDelta::default(), &online_nodes);
                            self.push_all(frames);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }

                _ = tokio::time::sleep_until(debounce_deadline.unwrap_or_else(tokio::time::Instant::now)), if debounce_deadline.is_some() => {
                    debounce_deadline = None;
                    if let Some(frame) = self.state.relay_diff(Utc::now(), &self.presence.relays_online()) {
                        self.push(frame);
                    }
                }

                frame = self.inbound.recv() => {
                    match frame {
                        Some(frame) => self.handle_inbound(frame).await,
                        None => break,
                    }
                }

                Some(resource_id) = self.flow_done_rx.recv() => {
                    self.state.cancel_flow(resource_id);
                }
            }
        }
    }

    async fn handle_inbound(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::CreateFlow { resource_id, connected_gateway_ids } => {
                self.handle_create_flow(resource_id, connected_gateway_ids).await;
            }
            InboundFrame::PrepareConnection { resource_id } => {
                // §9: deprecated handshake, never satisfiable by a current node.
                self.push(OutboundFrame::FlowCreationFailed {
                    resource_id,
                    reason: FlowFailureReason::NotFound,
                });
            }
            InboundFrame::BroadcastIceCandidates { candidates, gateway_ids } => {
                for gateway_id in gateway_ids {
                    self.push(OutboundFrame::IceCandidates {
                        gateway_id,
                        candidates: candidates.clone(),
                    });
                }
            }
            InboundFrame::BroadcastInvalidatedIceCandidates { candidates, gateway_ids } => {
                for gateway_id in gateway_ids {
                    self.push(OutboundFrame::InvalidateIceCandidates {
                        gateway_id,
                        candidates: candidates.clone(),
                    });
                }
            }
            InboundFrame::NewGatewayIceCandidates { gateway_id, candidates } => {
                self.push(OutboundFrame::IceCandidates { gateway_id, candidates });
            }
            InboundFrame::InvalidateGatewayIceCandidates { gateway_id, candidates } => {
                self.push(OutboundFrame::InvalidateIceCandidates { gateway_id, candidates });
            }
            InboundFrame::NewClientIceCandidates { client_id, candidates } => {
                self.push(OutboundFrame::NewClientIceCandidates { client_id, candidates });
            }
            InboundFrame::InvalidateClientIceCandidates { client_id, candidates } => {
                self.push(OutboundFrame::InvalidateClientIceCandidates { client_id, candidates });
            }
            InboundFrame::ReuseConnection { resource_id, .. } | InboundFrame::RequestConnection { resource_id, .. } => {
                self.push(OutboundFrame::FlowCreationFailed {
                    resource_id,
                    reason: FlowFailureReason::NotFound,
                });
            }
        }
    }

    async fn handle_create_flow(
        &mut self,
        resource_id: ResourceId,
        connected_gateway_ids: Vec<crate::core::ids::ServingNodeId>,
    ) {
        let now = Utc::now();

        let entry = match self.state.authorize(resource_id, now) {
            Ok(entry) => entry,
            Err(Denial::NotFound) => {
                self.push(OutboundFrame::FlowCreationFailed { resource_id, reason: FlowFailureReason::NotFound });
                return;
            }
            Err(Denial::Forbidden(violated_properties)) => {
                self.push(OutboundFrame::FlowCreationFailed {
                    resource_id,
                    reason: FlowFailureReason::Forbidden { violated_properties },
                });
                return;
            }
        };

        let Some(resource) = self.state.resource(resource_id).cloned() else {
            self.push(OutboundFrame::FlowCreationFailed { resource_id, reason: FlowFailureReason::NotFound });
            return;
        };

        // An internet-type resource has no site to route a serving node
        // through; there is nothing for the flow handshake to connect, so
        // it fails `offline` immediately rather than ever being dispatched.
        let Some(site_id) = resource.site_id else {
            self.push(OutboundFrame::FlowCreationFailed { resource_id, reason: FlowFailureReason::Offline });
            return;
        };

        let online_nodes = self.presence.nodes_in_site(site_id);
        let node = match select_serving_node(
            self.state.identity().client_version,
            &resource,
            &online_nodes,
            &connected_gateway_ids,
        ) {
            Ok(node) => node,
            Err(NodeSelectionError::Offline) => {
                self.push(OutboundFrame::FlowCreationFailed { resource_id, reason: FlowFailureReason::Offline });
                return;
            }
            Err(NodeSelectionError::VersionMismatch) => {
                self.push(OutboundFrame::FlowCreationFailed { resource_id, reason: FlowFailureReason::VersionMismatch });
                return;
            }
        };

        // `begin_flow` guards single-flight per resource (§4.8 step 9); the
        // session's own oneshot half is unused from here on, since the
        // node's reply is actually routed back via `FlowRouter`, keyed by
        // the audit row's id rather than by resource.
        if self.state.begin_flow(resource_id).is_none() {
            self.push(OutboundFrame::FlowCreationFailed { resource_id, reason: FlowFailureReason::Offline });
            return;
        }

        let client_id = self.state.client_id();
        let identity = self.state.identity();
        let preshared_key = derive_preshared_key(
            &identity.flow_secret,
            &client_id.to_string(),
            &identity.client_pubkey,
            &node.id.to_string(),
        );
        let ice_credentials = derive_ice_credentials(
            &client_id.to_string(),
            &identity.client_pubkey,
            &node.id.to_string(),
            &node.pubkey,
        );

        let audit = build_policy_authorization(
            entry.policy_id,
            client_id,
            node.id,
            resource_id,
            entry.membership_id,
            entry.expires_at,
            identity.client_ip,
            identity.user_agent.clone(),
            None,
        );

        // Enqueued before the node is dispatched, satisfying "must be
        // enqueued before responding" without making the handshake wait on
        // the database; the server layer's audit sink does the actual insert.
        let _ = self.audit_tx.send(audit.clone());

        let router_rx = self.flow_router.register(audit.id);
        let request = AuthorizePolicyRequest {
            policy_authorization_id: audit.id,
            policy_id: entry.policy_id,
            client_id,
            client_pubkey: identity.client_pubkey.clone(),
            membership_id: entry.membership_id,
            resource_id,
            expires_at: entry.expires_at,
            preshared_key: preshared_key.clone(),
            client_ice_credentials: ice_credentials.clone(),
        };

        if let Err(err) = self.dispatcher.dispatch(node.id, request).await {
            warn!(%resource_id, node_id = %node.id, error = %err, "failed to dispatch authorize_policy");
            self.state.cancel_flow(resource_id);
            self.flow_router.cancel(audit.id);
            self.push(OutboundFrame::FlowCreationFailed { resource_id, reason: FlowFailureReason::Offline });
            return;
        }

        let outbound = self.outbound.clone();
        let flow_router = Arc::clone(&self.flow_router);
        let flow_done = self.flow_done_tx.clone();
        let timeout = self.handshake_timeout;
        let audit_id = audit.id;
        tokio::spawn(async move {
            match await_node_reply(router_rx, timeout).await {
                Ok(node_reply) => {
                    let (client_view, node_view): (IceCredentialsView, IceCredentialsView) =
                        (&node_reply.ice_credentials).into();
                    let _ = outbound.send(OutboundFrame::FlowCreated {
                        resource_id: node_reply.resource_id,
                        preshared_key: node_reply.preshared_key,
                        client_ice_credentials: client_view,
                        gateway_group_id: node_reply.site_id,
                        gateway_id: node_reply.node_id,
                        gateway_public_key: node_reply.node_pubkey,
                        gateway_ipv4: node_reply.node_ipv4,
                        gateway_ipv6: node_reply.node_ipv6,
                        gateway_ice_credentials: node_view,
                    });
                }
                Err(_) => {
                    flow_router.cancel(audit_id);
                    metrics::FLOW_HANDSHAKES_FAILED_TOTAL.inc();
                    let _ = outbound.send(OutboundFrame::FlowCreationFailed {
                        resource_id,
                        reason: FlowFailureReason::Offline,
                    });
                }
            }
            let _ = flow_done.send(resource_id);
        });
    }
}
