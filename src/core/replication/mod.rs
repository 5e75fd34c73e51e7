// src/core/replication/mod.rs

//! C2 — Replication Connection, and C3 — Replication Manager.
//!
//! The connection negotiates a publication and a durable logical replication
//! slot against the primary, decodes the `pgoutput` stream with
//! [`crate::core::wal`], and turns it into an ordered stream of [`Change`]
//! records. The manager ensures exactly one connection is live per region.

pub mod buffering;
pub mod connection;
pub mod manager;
pub mod standby;

pub use connection::{ConnectionState, ReplicationConnection, ReplicationSettings};
pub use manager::ReplicationManager;

use crate::core::ids::AccountId;
use crate::core::wal::Lsn;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// The kind of row mutation a [`Change`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One committed row mutation, resolved against its relation's column names
/// and ready for downstream consumers (the Change Bus, Session Actors).
///
/// `account_id` is extracted opportunistically from the row when the table
/// carries one; rows that don't (none in the configured publication do) are
/// filtered upstream of the bus rather than represented here.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub lsn: Lsn,
    pub op: ChangeOp,
    pub table: String,
    pub account_id: Option<AccountId>,
    pub old: Option<HashMap<String, JsonValue>>,
    pub new: Option<HashMap<String, JsonValue>>,
}

impl Change {
    /// Reads a column by name out of whichever row side is present,
    /// preferring `new` (the row as it stands after the mutation).
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.new
            .as_ref()
            .and_then(|row| row.get(name))
            .or_else(|| self.old.as_ref().and_then(|row| row.get(name)))
    }
}
