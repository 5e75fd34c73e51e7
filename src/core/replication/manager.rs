// src/core/replication/manager.rs

//! C3 — Replication Manager: ensures exactly one [`ReplicationConnection`] is
//! live per region (§4.3, Invariant 4). Leadership is arbitrated with a
//! Postgres advisory lock keyed by the region name — the primary is already
//! the one shared resource every instance of this process can reach, so it
//! doubles as the cluster-wide name registry spec.md otherwise leaves
//! unspecified (an external registry is an equally valid choice; this one
//! needs no extra moving part).

use super::{ReplicationConnection, ReplicationSettings};
use crate::core::change_bus::ChangeBusHandle;
use crate::core::errors::{PlaneError, Result};
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_postgres::NoTls;
use tracing::{error, info, warn};

const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const MAX_ACQUIRE_ATTEMPTS: u32 = 12;

pub struct ReplicationManager {
    region: String,
    settings: ReplicationSettings,
}

impl ReplicationManager {
    pub fn new(region: impl Into<String>, settings: ReplicationSettings) -> Self {
        Self {
            region: region.into(),
            settings,
        }
    }

    fn lock_key(&self) -> i64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        ("perimeterd.replication", self.region.as_str()).hash(&mut hasher);
        hasher.finish() as i64
    }

    /// Acquires region leadership (bounded retries, per §4.3 and §5), then
    /// runs the connection until `shutdown_rx` fires, restarting it
    /// immediately on every failure — the bounded retry budget only governs
    /// becoming leader, not staying leader. Returns `Err` only after
    /// exhausting acquire attempts, deferring further retries to whatever
    /// supervises this task (mirrors the teacher's `background_tasks`
    /// JoinSet restart-on-failure convention).
    pub async fn run(&self, bus: ChangeBusHandle, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let pg_config: tokio_postgres::Config =
            self.settings.conninfo.parse().map_err(PlaneError::from)?;

        let mut attempt = 0u32;
        let lock_key = self.lock_key();
        loop {
            attempt += 1;
            let (lock_client, lock_connection) = pg_config.connect(NoTls).await.map_err(PlaneError::from)?;
            tokio::spawn(async move {
                if let Err(e) = lock_connection.await {
                    warn!(error = %e, "replication manager lock connection terminated");
                }
            });

            let acquired: bool = lock_client
                .query_one("SELECT pg_try_advisory_lock($1)", &[&lock_key])
                .await
                .map_err(PlaneError::from)?
                .get(0);

            if acquired {
                info!(region = %self.region, "acquired replication leadership for region");
                let result = self.run_as_leader(&bus, &mut shutdown_rx).await;
                let _ = lock_client
                    .query_one("SELECT pg_advisory_unlock($1)", &[&lock_key])
                    .await;
                return result;
            }

            if attempt >= MAX_ACQUIRE_ATTEMPTS {
                error!(
                    region = %self.region,
                    attempts = attempt,
                    "failed to acquire replication leadership; surrendering to supervisor"
                );
                return Err(PlaneError::Internal(format!(
                    "could not become replication leader for region {} after {attempt} attempts",
                    self.region
                )));
            }

            info!(
                region = %self.region,
                attempt,
                "another instance already holds replication leadership; retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                _ = shutdown_rx.recv() => {
                    info!("replication manager shutting down while waiting for leadership");
                    return Ok(());
                }
            }
        }
    }

    /// Runs the connection with immediate restart on any failure, for as
    /// long as this process holds the region's leadership lock.
    async fn run_as_leader(
        &self,
        bus: &ChangeBusHandle,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut connection = ReplicationConnection::new(self.settings.clone());
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("replication manager shutting down");
                    return Ok(());
                }
                result = connection.run_once(bus, shutdown_rx.resubscribe()) => {
                    match result {
                        Ok(()) => info!("replication connection closed cleanly; restarting"),
                        Err(e) => warn!(error = %e, "replication connection failed; restarting immediately"),
                    }
                }
            }
        }
    }
}
