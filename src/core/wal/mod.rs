// src/core/wal/mod.rs

//! C1 — WAL Decoder. Pure, stateless decoding of the pgoutput logical
//! replication byte protocol into typed messages.

pub mod message;
pub mod oid;
pub mod tuple;

pub use message::{ColumnDef, PriorTuple, RelationDef, ReplicaIdentity, TruncateOptions, WalMessage, decode_message};
pub use tuple::{Cell, DecodedValue, Tuple, decode_cell, decode_tuple};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;

/// A Log Sequence Number. Internally a single `u64` (as carried on the
/// wire), but decomposes into `(xlog_file, offset)` the way Postgres prints
/// it (`XXXXXXXX/XXXXXXXX`) for logging and for lexicographic comparison
/// reasoning — the derived `Ord` on the plain `u64` already agrees with
/// that tuple ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn new(xlog_file: u32, offset: u32) -> Self {
        Lsn(((xlog_file as u64) << 32) | offset as u64)
    }

    pub fn xlog_file(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(self) -> u32 {
        self.0 as u32
    }

    pub fn succ(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.xlog_file(), self.offset())
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

/// Zips a decoded [`Tuple`] with its relation's column definitions into a
/// name-keyed JSON row, applying the decoder's JSON-cell rules per column.
/// A `null` or unchanged-TOAST cell is represented as `JsonValue::Null` —
/// callers that need to distinguish "unchanged" from "set to null" should
/// consult the raw [`Cell`] via [`decode_tuple`] instead.
pub fn zip_tuple(relation: &RelationDef, tuple: &Tuple) -> HashMap<String, JsonValue> {
    relation
        .columns
        .iter()
        .zip(tuple.cells.iter())
        .map(|(col, cell)| {
            let value = match decode_cell(cell, col.type_oid) {
                DecodedValue::Null | DecodedValue::UnchangedToast => JsonValue::Null,
                DecodedValue::Raw(s) => JsonValue::String(s),
                DecodedValue::Json(v) => v,
            };
            (col.name.clone(), value)
        })
        .collect()
}
