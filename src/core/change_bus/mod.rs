// src/core/change_bus/mod.rs

//! C4 — Change Bus: in-process, ordered fan-out of [`Change`] records to
//! subscribers keyed by account. A subscriber that joins late gets no
//! replay — it's expected to have already built a consistent snapshot of
//! its own state before subscribing (§4.6 step 1–4 happens before step 5).
//!
//! Modeled as one `broadcast` channel per account, created lazily. Ordering
//! within an account is free: the Replication Connection is the sole
//! producer and publishes changes for a given account serially, in commit
//! order, so the channel preserves it. A subscriber that can't keep up and
//! lags past the channel's capacity is dropped — per the design notes, a
//! slow session is expected to reconnect rather than be propped up with an
//! unbounded queue.

use crate::core::ids::AccountId;
use crate::core::metrics;
use crate::core::replication::Change;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

struct Inner {
    channels: DashMap<AccountId, broadcast::Sender<Change>>,
    capacity: usize,
}

/// Shared handle to the bus. Cheap to clone; every clone sees the same
/// underlying per-account channel map.
#[derive(Clone)]
pub struct ChangeBusHandle {
    inner: Arc<Inner>,
}

impl ChangeBusHandle {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: DashMap::new(),
                capacity,
            }),
        }
    }

    /// Publishes a change to its account's channel. A no-op (besides channel
    /// creation) if there are currently no subscribers — `broadcast::send`
    /// returning an error just means "nobody is listening right now", which
    /// is expected and not logged as a failure.
    pub fn publish(&self, change: Change) {
        let Some(account_id) = change.account_id else {
            tracing::debug!(table = %change.table, "dropping change with no resolvable account_id");
            return;
        };
        let sender = self.sender_for(account_id);
        let _ = sender.send(change);
        metrics::CHANGE_BUS_QUEUE_DEPTH.set(sender.len() as i64);
    }

    /// Subscribes to an account's change stream. The caller is responsible
    /// for filtering by its own `last_seen_lsn` — the bus makes no replay
    /// guarantee and may also redeliver a change already seen if the
    /// subscriber reconnects to an overlapping upstream source.
    pub fn subscribe(&self, account_id: AccountId) -> broadcast::Receiver<Change> {
        self.sender_for(account_id).subscribe()
    }

    fn sender_for(&self, account_id: AccountId) -> broadcast::Sender<Change> {
        self.inner
            .channels
            .entry(account_id)
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }
}

impl Default for ChangeBusHandle {
    fn default() -> Self {
        Self::new()
    }
}
