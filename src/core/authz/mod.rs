// src/core/authz/mod.rs

//! C5 — Authorization Cache: the per-client materialized view of
//! memberships, policies, resources and the derived connectable set (§4.5).

mod cache;

pub use cache::{AuthorizationCache, CacheDelta, ConnectableEntry, Denial};
