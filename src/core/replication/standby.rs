// src/core/replication/standby.rs

//! Standby-status frame construction (§4.2, §6.1). The frame is emitted from
//! the same task that reads WAL bytes, on every keep-alive, regardless of
//! that keep-alive's `reply_request` bit — servers with `wal_sender_timeout`
//! disabled never ask for one, but still expect to see the slot's retention
//! cursor advance.

use bytes::{BufMut, Bytes, BytesMut};

/// Microseconds-since-2000-01-01Z that Postgres uses for every clock field
/// in the replication protocol.
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

pub fn pg_micros_now() -> u64 {
    let now = chrono::Utc::now();
    let micros = now.timestamp_micros() - PG_EPOCH_OFFSET_SECS * 1_000_000;
    micros.max(0) as u64
}

/// The three LSN positions reported back to the primary on every standby
/// status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyPositions {
    pub write_lsn: u64,
    pub flush_lsn: u64,
    pub apply_lsn: u64,
}

impl StandbyPositions {
    /// Computes the positions to report after processing a keep-alive whose
    /// `wal_end` is `wal_end`, per §4.2:
    ///
    /// - unbuffered (`flush_interval == 0`): all three positions equal
    ///   `wal_end + 1`.
    /// - buffered: `write = wal_end + 1`, `flush = apply = last_flushed + 1`,
    ///   or `wal_end + 1` if nothing has flushed yet — liveness over
    ///   durability on a cold start, so the server doesn't retain WAL
    ///   forever waiting for a first flush that may be seconds away.
    pub fn compute(wal_end: u64, buffering_enabled: bool, last_flushed_lsn: Option<u64>) -> Self {
        let write_lsn = wal_end + 1;
        if !buffering_enabled {
            return Self {
                write_lsn,
                flush_lsn: write_lsn,
                apply_lsn: write_lsn,
            };
        }
        let durable = last_flushed_lsn.map(|l| l + 1).unwrap_or(write_lsn);
        Self {
            write_lsn,
            flush_lsn: durable,
            apply_lsn: durable,
        }
    }

    /// Encodes the `'r'` standby-status-update `CopyData` payload.
    pub fn encode(&self, reply_requested: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 * 4 + 1);
        buf.put_u8(b'r');
        buf.put_u64(self.write_lsn);
        buf.put_u64(self.flush_lsn);
        buf.put_u64(self.apply_lsn);
        buf.put_u64(pg_micros_now());
        buf.put_u8(if reply_requested { 1 } else { 0 });
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbuffered_positions_collapse_to_wal_end_plus_one() {
        let pos = StandbyPositions::compute(99, false, Some(10));
        assert_eq!(pos.write_lsn, 100);
        assert_eq!(pos.flush_lsn, 100);
        assert_eq!(pos.apply_lsn, 100);
    }

    #[test]
    fn buffered_positions_track_last_flushed_lsn() {
        let pos = StandbyPositions::compute(99, true, Some(50));
        assert_eq!(pos.write_lsn, 100);
        assert_eq!(pos.flush_lsn, 51);
        assert_eq!(pos.apply_lsn, 51);
    }

    #[test]
    fn buffered_cold_start_prefers_liveness() {
        let pos = StandbyPositions::compute(99, true, None);
        assert_eq!(pos.flush_lsn, 100);
        assert_eq!(pos.apply_lsn, 100);
    }

    #[test]
    fn encode_produces_standby_status_tag() {
        let pos = StandbyPositions::compute(0, false, None);
        let bytes = pos.encode(false);
        assert_eq!(bytes[0], b'r');
        assert_eq!(bytes.len(), 1 + 32 + 1);
    }
}
