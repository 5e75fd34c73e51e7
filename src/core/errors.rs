// src/core/errors.rs

//! The primary error type for the control plane.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// Crate-wide error enum. `thiserror` gives us `Display` and `std::error::Error`
/// for free; `Clone` and `PartialEq` are hand-rolled below because some sources
/// (`io::Error`, `tokio_postgres::Error`) don't implement either.
#[derive(Error, Debug)]
pub enum PlaneError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("database error: {0}")]
    Database(Arc<tokio_postgres::Error>),

    #[error("replication protocol error: {0}")]
    Protocol(String),

    #[error("replication stream ended unexpectedly")]
    StreamClosed,

    #[error("replication slot {0} does not exist")]
    SlotNotFound(String),

    #[error("unsupported pgoutput message type {0:#x}")]
    UnsupportedMessage(u8),

    #[error("malformed tuple data: {0}")]
    MalformedTuple(String),

    #[error("unknown relation oid {0}")]
    UnknownRelation(u32),

    #[error("websocket handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("flow handshake timed out for client {0}")]
    HandshakeTimeout(String),

    #[error("session {0} is no longer authorized for resource {1}")]
    AuthorizationRevoked(String, String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("integer parse error: {0}")]
    ParseInt(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Clone for PlaneError {
    fn clone(&self) -> Self {
        match self {
            PlaneError::Io(e) => PlaneError::Io(Arc::clone(e)),
            PlaneError::Database(e) => PlaneError::Database(Arc::clone(e)),
            PlaneError::Protocol(s) => PlaneError::Protocol(s.clone()),
            PlaneError::StreamClosed => PlaneError::StreamClosed,
            PlaneError::SlotNotFound(s) => PlaneError::SlotNotFound(s.clone()),
            PlaneError::UnsupportedMessage(b) => PlaneError::UnsupportedMessage(*b),
            PlaneError::MalformedTuple(s) => PlaneError::MalformedTuple(s.clone()),
            PlaneError::UnknownRelation(o) => PlaneError::UnknownRelation(*o),
            PlaneError::HandshakeFailed(s) => PlaneError::HandshakeFailed(s.clone()),
            PlaneError::HandshakeTimeout(s) => PlaneError::HandshakeTimeout(s.clone()),
            PlaneError::AuthorizationRevoked(a, b) => {
                PlaneError::AuthorizationRevoked(a.clone(), b.clone())
            }
            PlaneError::Config(s) => PlaneError::Config(s.clone()),
            PlaneError::Serde(s) => PlaneError::Serde(s.clone()),
            PlaneError::ParseInt(s) => PlaneError::ParseInt(s.clone()),
            PlaneError::Internal(s) => PlaneError::Internal(s.clone()),
        }
    }
}

impl PartialEq for PlaneError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PlaneError::Io(a), PlaneError::Io(b)) => a.to_string() == b.to_string(),
            (PlaneError::Database(a), PlaneError::Database(b)) => a.to_string() == b.to_string(),
            (PlaneError::Protocol(a), PlaneError::Protocol(b)) => a == b,
            (PlaneError::StreamClosed, PlaneError::StreamClosed) => true,
            (PlaneError::SlotNotFound(a), PlaneError::SlotNotFound(b)) => a == b,
            (PlaneError::UnsupportedMessage(a), PlaneError::UnsupportedMessage(b)) => a == b,
            (PlaneError::MalformedTuple(a), PlaneError::MalformedTuple(b)) => a == b,
            (PlaneError::UnknownRelation(a), PlaneError::UnknownRelation(b)) => a == b,
            (PlaneError::HandshakeFailed(a), PlaneError::HandshakeFailed(b)) => a == b,
            (PlaneError::HandshakeTimeout(a), PlaneError::HandshakeTimeout(b)) => a == b,
            (
                PlaneError::AuthorizationRevoked(a1, b1),
                PlaneError::AuthorizationRevoked(a2, b2),
            ) => a1 == a2 && b1 == b2,
            (PlaneError::Config(a), PlaneError::Config(b)) => a == b,
            (PlaneError::Serde(a), PlaneError::Serde(b)) => a == b,
            (PlaneError::ParseInt(a), PlaneError::ParseInt(b)) => a == b,
            (PlaneError::Internal(a), PlaneError::Internal(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for PlaneError {
    fn from(e: std::io::Error) -> Self {
        PlaneError::Io(Arc::new(e))
    }
}

impl From<tokio_postgres::Error> for PlaneError {
    fn from(e: tokio_postgres::Error) -> Self {
        PlaneError::Database(Arc::new(e))
    }
}

impl From<serde_json::Error> for PlaneError {
    fn from(e: serde_json::Error) -> Self {
        PlaneError::Serde(e.to_string())
    }
}

impl From<ParseIntError> for PlaneError {
    fn from(e: ParseIntError) -> Self {
        PlaneError::ParseInt(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PlaneError>;
