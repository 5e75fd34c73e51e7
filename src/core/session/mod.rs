// src/core/session/mod.rs

//! C6 — Session Actor: per-client cache, wire protocol, and the async driver
//! tying both to the Change Bus, Presence, and the Flow Handshake.

mod actor;
mod parse;
mod wire;

pub use actor::{ChangeOutcome, SessionActor, SessionIdentity, SessionState};
pub use parse::{
    parse_account_config, parse_client, parse_interface, parse_membership, parse_policy,
    parse_resource, parse_site,
};
pub use wire::{
    FlowFailureReason, IceCredentialsView, InboundFrame, InterfaceView, OutboundFrame, RelayView,
    ResourceView,
};
