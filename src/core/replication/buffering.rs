// src/core/replication/buffering.rs

//! The Replication Connection's buffering discipline (§4.2). In immediate
//! mode every [`Change`] is dispatched as it's decoded; in buffered mode,
//! changes accumulate keyed by a caller-defined key (last-write-wins) until
//! a size or time threshold is crossed, trading latency for slot-friendly
//! batching.

use super::Change;
use crate::core::wal::Lsn;
use std::collections::HashMap;
use std::hash::Hash;

/// Accumulates [`Change`] records under a caller-supplied key, last-write-wins,
/// until `flush_buffer_size` is reached or the caller's periodic tick fires.
pub struct ChangeBuffer<K> {
    flush_buffer_size: usize,
    pending: HashMap<K, Change>,
    insertion_order: Vec<K>,
}

impl<K: Eq + Hash + Clone> ChangeBuffer<K> {
    pub fn new(flush_buffer_size: usize) -> Self {
        Self {
            flush_buffer_size,
            pending: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Buffering is disabled entirely (`flush_buffer_size == 0`): every push
    /// should be flushed immediately by the caller instead.
    pub fn is_immediate(&self) -> bool {
        self.flush_buffer_size == 0
    }

    /// Inserts or overwrites the entry for `key`, returning `true` if the
    /// buffer has now reached its configured flush threshold.
    pub fn push(&mut self, key: K, change: Change) -> bool {
        if !self.pending.contains_key(&key) {
            self.insertion_order.push(key.clone());
        }
        self.pending.insert(key, change);
        self.flush_buffer_size > 0 && self.pending.len() >= self.flush_buffer_size
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains the buffer in insertion order and returns the highest LSN
    /// among the flushed batch, which becomes the connection's new
    /// `last_flushed_lsn` and feeds the next standby-status frame.
    pub fn drain(&mut self) -> (Vec<Change>, Option<Lsn>) {
        let keys = std::mem::take(&mut self.insertion_order);
        let mut changes = Vec::with_capacity(keys.len());
        let mut max_lsn = None;
        for key in keys {
            if let Some(change) = self.pending.remove(&key) {
                max_lsn = Some(max_lsn.map_or(change.lsn, |m: Lsn| m.max(change.lsn)));
                changes.push(change);
            }
        }
        (changes, max_lsn)
    }
}
