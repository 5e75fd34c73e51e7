// src/core/wal/message.rs

//! Decoding of individual pgoutput logical-replication messages
//! (proto_version 1), as carried in the payload of a `Write` WAL frame.

use super::oid::type_name;
use super::tuple::{Tuple, decode_tuple};
use crate::core::errors::PlaneError;
use bytes::Buf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default,
    Nothing,
    AllColumns,
    Index,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub is_key: bool,
    pub name: String,
    pub type_oid: u32,
    pub type_name: &'static str,
    pub type_modifier: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationDef {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateOptions {
    pub cascade: bool,
    pub restart_identity: bool,
}

/// An update's prior row state, which may be either the full old row (replica
/// identity `full`) or just the replica-identity key columns.
#[derive(Debug, Clone, PartialEq)]
pub enum PriorTuple {
    Key(Tuple),
    Old(Tuple),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalMessage {
    Begin {
        final_lsn: u64,
        commit_timestamp: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        lsn: u64,
        end_lsn: u64,
        commit_timestamp: i64,
    },
    Origin {
        lsn: u64,
        name: String,
    },
    Relation(RelationDef),
    Insert {
        relation_id: u32,
        tuple: Tuple,
    },
    Update {
        relation_id: u32,
        prior: Option<PriorTuple>,
        new_tuple: Tuple,
    },
    Delete {
        relation_id: u32,
        prior: PriorTuple,
    },
    Truncate {
        relation_ids: Vec<u32>,
        options: TruncateOptions,
    },
    Type {
        id: u32,
        namespace: String,
        name: String,
    },
    LogicalMessage {
        transactional: bool,
        lsn: u64,
        prefix: String,
        content: Vec<u8>,
    },
    Unsupported {
        tag: u8,
        raw: Vec<u8>,
    },
}

fn read_cstr(buf: &mut &[u8]) -> Result<String, PlaneError> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| PlaneError::MalformedTuple("missing null terminator".into()))?;
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(s)
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<(), PlaneError> {
    if buf.len() < n {
        Err(PlaneError::MalformedTuple(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

/// Decodes one pgoutput message from a `Write` frame's payload. The leading
/// tag byte determines the variant; an unrecognized tag yields `Unsupported`
/// rather than an error, per the decoder's stated failure discipline.
pub fn decode_message(mut buf: &[u8]) -> Result<WalMessage, PlaneError> {
    let raw = buf.to_vec();
    if buf.is_empty() {
        return Err(PlaneError::MalformedTuple("empty message payload".into()));
    }
    let tag = buf.get_u8();
    match tag {
        b'B' => {
            need(buf, 20, "Begin")?;
            let final_lsn = buf.get_u64();
            let commit_timestamp = buf.get_i64();
            let xid = buf.get_u32();
            Ok(WalMessage::Begin {
                final_lsn,
                commit_timestamp,
                xid,
            })
        }
        b'C' => {
            need(buf, 1 + 24, "Commit")?;
            let flags = buf.get_u8();
            let lsn = buf.get_u64();
            let end_lsn = buf.get_u64();
            let commit_timestamp = buf.get_i64();
            Ok(WalMessage::Commit {
                flags,
                lsn,
                end_lsn,
                commit_timestamp,
            })
        }
        b'O' => {
            need(buf, 8, "Origin")?;
            let lsn = buf.get_u64();
            let name = read_cstr(&mut buf)?;
            Ok(WalMessage::Origin { lsn, name })
        }
        b'R' => {
            need(buf, 4, "Relation")?;
            let id = buf.get_u32();
            let namespace = read_cstr(&mut buf)?;
            let name = read_cstr(&mut buf)?;
            need(buf, 1 + 2, "Relation header")?;
            let replica_identity = match buf.get_u8() {
                b'd' => ReplicaIdentity::Default,
                b'n' => ReplicaIdentity::Nothing,
                b'f' => ReplicaIdentity::AllColumns,
                b'i' => ReplicaIdentity::Index,
                other => {
                    return Err(PlaneError::MalformedTuple(format!(
                        "unknown replica identity byte {other:#x}"
                    )));
                }
            };
            let ncols = buf.get_i16();
            let mut columns = Vec::with_capacity(ncols.max(0) as usize);
            for _ in 0..ncols {
                need(buf, 1, "column flags")?;
                let is_key = buf.get_u8() != 0;
                let col_name = read_cstr(&mut buf)?;
                need(buf, 8, "column type info")?;
                let type_oid = buf.get_u32();
                let type_modifier = buf.get_i32();
                columns.push(ColumnDef {
                    is_key,
                    name: col_name,
                    type_oid,
                    type_name: type_name(type_oid),
                    type_modifier,
                });
            }
            Ok(WalMessage::Relation(RelationDef {
                id,
                namespace,
                name,
                replica_identity,
                columns,
            }))
        }
        b'Y' => {
            need(buf, 4, "Type")?;
            let id = buf.get_u32();
            let namespace = read_cstr(&mut buf)?;
            let name = read_cstr(&mut buf)?;
            Ok(WalMessage::Type { id, namespace, name })
        }
        b'I' => {
            need(buf, 4 + 1, "Insert")?;
            let relation_id = buf.get_u32();
            let marker = buf.get_u8();
            if marker != b'N' {
                return Err(PlaneError::MalformedTuple(format!(
                    "expected Insert tuple marker 'N', got {marker:#x}"
                )));
            }
            let tuple = decode_tuple(&mut buf)?;
            Ok(WalMessage::Insert { relation_id, tuple })
        }
        b'U' => {
            need(buf, 4 + 1, "Update")?;
            let relation_id = buf.get_u32();
            let mut marker = buf.get_u8();
            let mut prior = None;
            if marker == b'K' || marker == b'O' {
                let prior_tuple = decode_tuple(&mut buf)?;
                prior = Some(if marker == b'K' {
                    PriorTuple::Key(prior_tuple)
                } else {
                    PriorTuple::Old(prior_tuple)
                });
                need(buf, 1, "Update new-tuple marker")?;
                marker = buf.get_u8();
            }
            if marker != b'N' {
                return Err(PlaneError::MalformedTuple(format!(
                    "expected Update new-tuple marker 'N', got {marker:#x}"
                )));
            }
            let new_tuple = decode_tuple(&mut buf)?;
            Ok(WalMessage::Update {
                relation_id,
                prior,
                new_tuple,
            })
        }
        b'D' => {
            need(buf, 4 + 1, "Delete")?;
            let relation_id = buf.get_u32();
            let marker = buf.get_u8();
            let tuple = decode_tuple(&mut buf)?;
            let prior = match marker {
                b'K' => PriorTuple::Key(tuple),
                b'O' => PriorTuple::Old(tuple),
                other => {
                    return Err(PlaneError::MalformedTuple(format!(
                        "expected Delete marker 'K' or 'O', got {other:#x}"
                    )));
                }
            };
            Ok(WalMessage::Delete { relation_id, prior })
        }
        b'T' => {
            need(buf, 5, "Truncate")?;
            let nrel = buf.get_u32();
            let flags = buf.get_u8();
            need(buf, 4 * nrel as usize, "Truncate relation list")?;
            let mut relation_ids = Vec::with_capacity(nrel as usize);
            for _ in 0..nrel {
                relation_ids.push(buf.get_u32());
            }
            Ok(WalMessage::Truncate {
                relation_ids,
                options: TruncateOptions {
                    cascade: flags & 0x1 != 0,
                    restart_identity: flags & 0x2 != 0,
                },
            })
        }
        b'M' => {
            need(buf, 1 + 8 + 1, "LogicalMessage header")?;
            let transactional = buf.get_u8() != 0;
            let lsn = buf.get_u64();
            let prefix = read_cstr(&mut buf)?;
            need(buf, 4, "LogicalMessage length")?;
            let len = buf.get_u32() as usize;
            need(buf, len, "LogicalMessage content")?;
            let content = buf[..len].to_vec();
            Ok(WalMessage::LogicalMessage {
                transactional,
                lsn,
                prefix,
                content,
            })
        }
        other => Ok(WalMessage::Unsupported {
            tag: other,
            raw,
        }),
    }
}
