// src/core/replication/connection.rs

//! C2 — Replication Connection. A single, cluster-wide connection per
//! database: negotiates the publication and slot, streams `pgoutput` frames,
//! and turns them into ordered [`Change`] records dispatched to the Change
//! Bus. Disconnects are not errors — the caller (the Manager, or the
//! standalone reconnect loop in [`run_with_backoff`]) restarts the cycle.

use super::buffering::ChangeBuffer;
use super::standby::{StandbyPositions, pg_micros_now};
use super::{Change, ChangeOp};
use crate::core::change_bus::ChangeBusHandle;
use crate::core::errors::{PlaneError, Result};
use crate::core::ids::AccountId;
use crate::core::metrics;
use crate::core::wal::{self, Lsn, PriorTuple, RelationDef, WalMessage};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use postgres_protocol::message::backend::ReplicationMessage;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_postgres::NoTls;
use tracing::{debug, error, info, warn};

/// Static, operator-configured connection parameters (§6.3). The table list
/// is the one open question spec.md explicitly declines to enumerate — it is
/// simply "whatever this deployment's `[database].tables` config says".
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    pub conninfo: String,
    pub schema: String,
    pub tables: Vec<String>,
    pub publication_name: String,
    pub slot_name: String,
    pub flush_interval: Duration,
    pub flush_buffer_size: usize,
    pub lag_warning_threshold: Duration,
    pub lag_error_threshold: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    CheckingPublication,
    CheckingSlot,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LagState {
    Ok,
    Warned,
    Errored,
}

/// Buffer key for last-write-wins coalescing: `(table, primary key text)`.
/// Falls back to the LSN itself for rows without an obvious identity column
/// (e.g. a relation with no declared key), which just disables coalescing
/// for that row.
type BufferKey = (String, String);

pub struct ReplicationConnection {
    settings: ReplicationSettings,
    state: ConnectionState,
    relations: HashMap<u32, RelationDef>,
    last_flushed_lsn: Option<Lsn>,
    buffer: ChangeBuffer<BufferKey>,
    lag_state: LagState,
    lag_dropping: bool,
    sent_count: u64,
    last_sent_lsn: Option<Lsn>,
    last_keepalive_at: Option<Instant>,
}

impl ReplicationConnection {
    pub fn new(settings: ReplicationSettings) -> Self {
        let flush_buffer_size = settings.flush_buffer_size;
        Self {
            settings,
            state: ConnectionState::Disconnected,
            relations: HashMap::new(),
            last_flushed_lsn: None,
            buffer: ChangeBuffer::new(flush_buffer_size),
            lag_state: LagState::Ok,
            lag_dropping: false,
            sent_count: 0,
            last_sent_lsn: None,
            last_keepalive_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect loop with exponential backoff and jitter, for the common
    /// case of a single-region deployment where [`super::ReplicationManager`]
    /// isn't needed. A clean disconnect resets the delay immediately; a
    /// transport error backs off. Returns once `shutdown_rx` fires.
    pub async fn run_with_backoff(
        &mut self,
        bus: ChangeBusHandle,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        const INITIAL_DELAY: Duration = Duration::from_secs(1);
        const MAX_DELAY: Duration = Duration::from_secs(60);
        let mut delay = INITIAL_DELAY;

        loop {
            match self.run_once(&bus, shutdown_rx.resubscribe()).await {
                Ok(()) => {
                    info!("replication connection closed cleanly; reconnecting");
                    delay = INITIAL_DELAY;
                }
                Err(e) => {
                    warn!(error = %e, "replication connection failed; reconnecting");
                }
            }

            let jitter = Duration::from_millis(rand::random::<u64>() % 500);
            tokio::select! {
                _ = tokio::time::sleep(delay + jitter) => {}
                _ = shutdown_rx.recv() => {
                    info!("replication connection shutting down during backoff");
                    return;
                }
            }
            delay = (delay * 2).min(MAX_DELAY);
        }
    }

    /// Runs one full connect → negotiate → stream cycle. Returns on clean
    /// disconnect or transport error; the caller decides whether and how
    /// fast to retry. Never returns `Err` for a decode problem — those
    /// surface as `Unsupported` messages per C1's failure discipline and are
    /// logged, not propagated.
    pub async fn run_once(
        &mut self,
        bus: &ChangeBusHandle,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        self.state = ConnectionState::Disconnected;
        info!(conninfo = %redact_conninfo(&self.settings.conninfo), "connecting to primary for replication");
        let pg_config: tokio_postgres::Config = self
            .settings
            .conninfo
            .parse()
            .map_err(PlaneError::from)?;
        let (catalog_client, connection) = pg_config.connect(NoTls).await.map_err(PlaneError::from)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "replication catalog connection terminated");
            }
        });

        self.state = ConnectionState::CheckingPublication;
        self.ensure_publication(&catalog_client).await?;

        self.state = ConnectionState::CheckingSlot;
        let slot_existed = self.ensure_slot(&catalog_client).await?;
        info!(slot = %self.settings.slot_name, existed = slot_existed, "replication slot ready");

        self.state = ConnectionState::Streaming;
        metrics::REPLICATION_CONNECTED.set(1);
        let result = self.stream(&catalog_client, bus, &mut shutdown_rx).await;
        metrics::REPLICATION_CONNECTED.set(0);
        result
    }

    async fn ensure_publication(&self, client: &tokio_postgres::Client) -> Result<()> {
        let row = client
            .query_opt(
                "SELECT 1 FROM pg_publication WHERE pubname = $1",
                &[&self.settings.publication_name],
            )
            .await?;

        let desired: std::collections::HashSet<_> = self.settings.tables.iter().cloned().collect();

        if row.is_none() {
            let table_list = self.qualified_table_list();
            let sql = format!(
                "CREATE PUBLICATION {} FOR TABLE {}",
                quote_ident(&self.settings.publication_name),
                table_list
            );
            client.batch_execute(&sql).await?;
            info!(publication = %self.settings.publication_name, tables = ?desired, "created publication");
            return Ok(());
        }

        let current_rows = client
            .query(
                "SELECT schemaname, tablename FROM pg_publication_tables WHERE pubname = $1",
                &[&self.settings.publication_name],
            )
            .await?;
        let current: std::collections::HashSet<String> = current_rows
            .iter()
            .map(|r| r.get::<_, String>("tablename"))
            .collect();

        for missing in desired.difference(&current) {
            let sql = format!(
                "ALTER PUBLICATION {} ADD TABLE {}.{}",
                quote_ident(&self.settings.publication_name),
                quote_ident(&self.settings.schema),
                quote_ident(missing)
            );
            client.batch_execute(&sql).await?;
            info!(table = %missing, "added table to publication");
        }
        for extra in current.difference(&desired) {
            let sql = format!(
                "ALTER PUBLICATION {} DROP TABLE {}.{}",
                quote_ident(&self.settings.publication_name),
                quote_ident(&self.settings.schema),
                quote_ident(extra)
            );
            client.batch_execute(&sql).await?;
            info!(table = %extra, "dropped table from publication");
        }
        Ok(())
    }

    fn qualified_table_list(&self) -> String {
        self.settings
            .tables
            .iter()
            .map(|t| format!("{}.{}", quote_ident(&self.settings.schema), quote_ident(t)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Returns `true` if the slot already existed.
    async fn ensure_slot(&self, client: &tokio_postgres::Client) -> Result<bool> {
        let row = client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.settings.slot_name],
            )
            .await?;
        if row.is_some() {
            return Ok(true);
        }
        let sql = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput NOEXPORT_SNAPSHOT",
            quote_ident(&self.settings.slot_name)
        );
        client.simple_query(&sql).await.map_err(PlaneError::from)?;
        Ok(false)
    }

    async fn stream(
        &mut self,
        client: &tokio_postgres::Client,
        bus: &ChangeBusHandle,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL 0/0 (proto_version '1', publication_names '{}', messages 'true')",
            quote_ident(&self.settings.slot_name),
            self.settings.publication_name
        );
        let copy_stream = client
            .copy_both_simple::<Bytes>(&query)
            .await
            .map_err(PlaneError::from)?;
        let mut copy_stream = Box::pin(copy_stream);

        let mut status_log = interval(Duration::from_secs(60));
        let mut flush_tick = interval(self.settings.flush_interval.max(Duration::from_millis(1)));
        let buffered = !self.buffer.is_immediate();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("replication connection shutting down");
                    return Ok(());
                }
                frame = copy_stream.next() => {
                    match frame {
                        Some(Ok(bytes)) => {
                            self.handle_frame(&bytes, &mut copy_stream, bus).await?;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "replication stream error");
                            return Err(PlaneError::from(e));
                        }
                        None => {
                            info!("replication stream closed by primary");
                            return Ok(());
                        }
                    }
                }
                _ = flush_tick.tick(), if buffered => {
                    self.flush_buffer(bus).await;
                }
                _ = status_log.tick() => {
                    info!(
                        sent = self.sent_count,
                        last_sent_lsn = ?self.last_sent_lsn,
                        last_keepalive_at = ?self.last_keepalive_at,
                        "replication connection status"
                    );
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        bytes: &Bytes,
        copy_stream: &mut Pin<Box<tokio_postgres::CopyBothDuplex<Bytes>>>,
        bus: &ChangeBusHandle,
    ) -> Result<()> {
        let msg = ReplicationMessage::parse(bytes)
            .map_err(|e| PlaneError::Protocol(format!("malformed replication frame: {e}")))?;
        match msg {
            ReplicationMessage::XLogData(xlog) => {
                let wal_end = Lsn(xlog.wal_end());
                self.handle_write(xlog.data(), wal_end, bus).await;
            }
            ReplicationMessage::PrimaryKeepAlive(ka) => {
                self.last_keepalive_at = Some(Instant::now());
                let wal_end = ka.wal_end();
                let positions = StandbyPositions::compute(
                    wal_end,
                    !self.buffer.is_immediate(),
                    self.last_flushed_lsn.map(|l| l.0),
                );
                let reply = positions.encode(ka.reply() != 0);
                copy_stream
                    .send(reply)
                    .await
                    .map_err(PlaneError::from)?;
            }
            _ => {
                debug!("unrecognized replication frame variant");
            }
        }
        Ok(())
    }

    async fn handle_write(&mut self, payload: &[u8], wal_end: Lsn, bus: &ChangeBusHandle) {
        let decoded = match wal::decode_message(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to decode WAL message; dropping");
                return;
            }
        };

        match decoded {
            WalMessage::Begin { commit_timestamp, .. } => {
                self.update_lag(commit_timestamp);
            }
            WalMessage::Relation(def) => {
                self.relations.insert(def.id, def);
            }
            WalMessage::Insert { relation_id, tuple } => {
                if self.lag_dropping {
                    return;
                }
                if let Some(change) = self.build_change(relation_id, ChangeOp::Insert, None, Some(&tuple), wal_end) {
                    self.dispatch(change, bus).await;
                }
            }
            WalMessage::Update { relation_id, prior, new_tuple } => {
                if self.lag_dropping {
                    return;
                }
                let prior_tuple = prior.as_ref().map(prior_as_tuple);
                if let Some(change) = self.build_change(relation_id, ChangeOp::Update, prior_tuple, Some(&new_tuple), wal_end) {
                    self.dispatch(change, bus).await;
                }
            }
            WalMessage::Delete { relation_id, prior } => {
                if self.lag_dropping {
                    return;
                }
                let prior_tuple = prior_as_tuple(&prior);
                if let Some(change) = self.build_change(relation_id, ChangeOp::Delete, Some(prior_tuple), None, wal_end) {
                    self.dispatch(change, bus).await;
                }
            }
            WalMessage::Commit { .. } | WalMessage::Origin { .. } | WalMessage::Type { .. } => {}
            WalMessage::Truncate { relation_ids, .. } => {
                debug!(?relation_ids, "ignoring TRUNCATE on replicated tables");
            }
            WalMessage::LogicalMessage { prefix, .. } => {
                debug!(%prefix, "ignoring logical decoding message");
            }
            WalMessage::Unsupported { tag, .. } => {
                debug!(tag, "unsupported pgoutput message tag");
            }
        }
    }

    fn build_change(
        &self,
        relation_id: u32,
        op: ChangeOp,
        old_tuple: Option<&wal::Tuple>,
        new_tuple: Option<&wal::Tuple>,
        lsn: Lsn,
    ) -> Option<Change> {
        let relation = self.relations.get(&relation_id)?;
        let old = old_tuple.map(|t| wal::zip_tuple(relation, t));
        let new = new_tuple.map(|t| wal::zip_tuple(relation, t));
        let account_id = new
            .as_ref()
            .or(old.as_ref())
            .and_then(|row| row.get("account_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<uuid::Uuid>().ok())
            .map(AccountId::from);

        Some(Change {
            lsn,
            op,
            table: relation.name.clone(),
            account_id,
            old,
            new,
        })
    }

    async fn dispatch(&mut self, change: Change, bus: &ChangeBusHandle) {
        self.last_sent_lsn = Some(change.lsn);
        self.sent_count += 1;
        if self.buffer.is_immediate() {
            bus.publish(change);
            return;
        }
        let key = (change.table.clone(), change.lsn.to_string());
        if self.buffer.push(key, change) {
            self.flush_buffer(bus).await;
        }
    }

    async fn flush_buffer(&mut self, bus: &ChangeBusHandle) {
        if self.buffer.is_empty() {
            return;
        }
        let (changes, max_lsn) = self.buffer.drain();
        for change in changes {
            bus.publish(change);
        }
        if let Some(lsn) = max_lsn {
            self.last_flushed_lsn = Some(
                self.last_flushed_lsn
                    .map_or(lsn, |prev| prev.max(lsn)),
            );
        }
    }

    /// Updates the lag tracker from a transaction's `Begin` commit timestamp
    /// (§4.2). A single warning is logged on crossing the warning threshold,
    /// cleared on recovery; crossing the error threshold starts dropping
    /// write-message side effects (not the whole connection) until lag
    /// recovers, which keeps the slot itself healthy.
    fn update_lag(&mut self, commit_timestamp_micros: i64) {
        let commit_time = pg_timestamp_to_instant_lag(commit_timestamp_micros);
        let lag = Duration::from_micros(commit_time.max(0) as u64);
        metrics::REPLICATION_LAG_SECONDS.set(lag.as_secs_f64());

        if lag >= self.settings.lag_error_threshold {
            if self.lag_state != LagState::Errored {
                error!(lag_ms = lag.as_millis(), "replication lag exceeds error threshold; dropping side effects");
            }
            self.lag_state = LagState::Errored;
            self.lag_dropping = true;
        } else if lag >= self.settings.lag_warning_threshold {
            if self.lag_state == LagState::Ok {
                warn!(lag_ms = lag.as_millis(), "replication lag exceeds warning threshold");
            }
            self.lag_state = LagState::Warned;
            self.lag_dropping = false;
        } else {
            if self.lag_state != LagState::Ok {
                info!(lag_ms = lag.as_millis(), "replication lag recovered");
            }
            self.lag_state = LagState::Ok;
            self.lag_dropping = false;
        }
    }
}

fn prior_as_tuple(prior: &PriorTuple) -> &wal::Tuple {
    match prior {
        PriorTuple::Key(t) | PriorTuple::Old(t) => t,
    }
}

/// `commit_timestamp` is microseconds since the Postgres epoch (2000-01-01Z);
/// this converts it into "microseconds of lag relative to wall-clock now".
fn pg_timestamp_to_instant_lag(commit_timestamp_micros: i64) -> i64 {
    let now_micros = pg_micros_now() as i64;
    now_micros.saturating_sub(commit_timestamp_micros)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn redact_conninfo(conninfo: &str) -> String {
    conninfo
        .split_whitespace()
        .map(|tok| {
            if tok.to_ascii_lowercase().starts_with("password=") {
                "password=***".to_string()
            } else {
                tok.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
