// src/config.rs

//! Manages server configuration: loading, resolving dynamic values, and validation.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_region")]
    region: String,
    #[serde(default)]
    tls: TlsConfig,
    database: DatabaseConfig,
    #[serde(default)]
    replication: ReplicationConfig,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    presence: PresenceConfig,
    #[serde(default)]
    flow: FlowConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7979
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_region() -> String {
    "default".to_string()
}

/// Connection and publication parameters for the logical replication
/// connection (§4.2–§4.3). `tables` is the open question spec.md declines
/// to enumerate — whatever this deployment's operator puts here becomes
/// the publication's table list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub conninfo: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
    #[serde(default = "default_publication_name")]
    pub publication_name: String,
    #[serde(default = "default_slot_name")]
    pub slot_name: String,
    /// Size of the shared pool used for everything other than the dedicated
    /// replication connection (§5): session bootstrap reads and
    /// `PolicyAuthorization` audit inserts.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_schema() -> String {
    "public".to_string()
}
fn default_pool_size() -> usize {
    16
}
fn default_tables() -> Vec<String> {
    vec![
        "accounts".into(),
        "memberships".into(),
        "clients".into(),
        "sites".into(),
        "policies".into(),
        "resources".into(),
    ]
}
fn default_publication_name() -> String {
    "perimeterd_changes".to_string()
}
fn default_slot_name() -> String {
    "perimeterd".to_string()
}

/// Replication Connection tuning (§4.2, §5): flush cadence and lag
/// thresholds that decide when a session is told to drop and reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_buffer_size")]
    pub flush_buffer_size: usize,
    #[serde(default = "default_lag_warning_ms")]
    pub lag_warning_threshold_ms: u64,
    #[serde(default = "default_lag_error_ms")]
    pub lag_error_threshold_ms: u64,
}

fn default_flush_interval_ms() -> u64 {
    200
}
fn default_flush_buffer_size() -> usize {
    1024
}
fn default_lag_warning_ms() -> u64 {
    5_000
}
fn default_lag_error_ms() -> u64 {
    30_000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            flush_buffer_size: default_flush_buffer_size(),
            lag_warning_threshold_ms: default_lag_warning_ms(),
            lag_error_threshold_ms: default_lag_error_ms(),
        }
    }
}

/// Per-session timing knobs (§4.6): how often a Session Actor re-evaluates
/// time-window conditions, how long a relay-presence burst is debounced
/// before it's pushed, and the cap on how far a resolved expiry can be
/// pushed into the future regardless of what a policy/membership implies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_recompute_interval_secs")]
    pub recompute_interval_secs: u64,
    #[serde(default = "default_presence_debounce_ms")]
    pub presence_debounce_ms: u64,
    #[serde(default = "default_max_expiry_horizon_secs")]
    pub max_expiry_horizon_secs: i64,
}

fn default_recompute_interval_secs() -> u64 {
    60
}
fn default_presence_debounce_ms() -> u64 {
    1_000
}
fn default_max_expiry_horizon_secs() -> i64 {
    86_400
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recompute_interval_secs: default_recompute_interval_secs(),
            presence_debounce_ms: default_presence_debounce_ms(),
            max_expiry_horizon_secs: default_max_expiry_horizon_secs(),
        }
    }
}

/// Presence (§4.7) tuning: how long a serving node or relay may go without
/// a heartbeat before presence considers it gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: u64,
}

fn default_heartbeat_ttl_secs() -> u64 {
    30
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: default_heartbeat_ttl_secs(),
        }
    }
}

/// Flow Handshake (§4.8) tuning: the per-request timeout, and the process
/// secret the PSK derivation is keyed on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Hex-encoded key. Rotating it invalidates every PSK/ICE credential a
    /// connected client currently holds cached, so it's meant to change
    /// rarely and out of band (not over this config file in a running
    /// fleet).
    pub secret_hex: String,
}

fn default_handshake_timeout_ms() -> u64 {
    15_000
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            secret_hex: String::new(),
        }
    }
}

/// Configuration for TLS termination on the client-facing websocket listener
/// and on the outbound replication connection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "perimeterd.crt".to_string()
}
fn default_key_path() -> String {
    "perimeterd.key".to_string()
}

/// Prometheus scrape endpoint (§1.5). Kept deliberately minimal: connection
/// counts, replication lag, change-bus queue depth, not a metrics product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// Represents the final, validated, and resolved server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub region: String,
    #[serde(default)]
    pub tls: TlsConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            region: raw.region,
            tls: raw.tls,
            database: raw.database,
            replication: raw.replication,
            session: raw.session,
            presence: raw.presence,
            flow: raw.flow,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.database.conninfo.trim().is_empty() {
            return Err(anyhow!("database.conninfo cannot be empty"));
        }
        if self.database.tables.is_empty() {
            return Err(anyhow!("database.tables cannot be empty"));
        }
        if self.database.publication_name.trim().is_empty() {
            return Err(anyhow!("database.publication_name cannot be empty"));
        }
        if self.database.slot_name.trim().is_empty() {
            return Err(anyhow!("database.slot_name cannot be empty"));
        }
        if self.database.pool_size == 0 {
            return Err(anyhow!("database.pool_size cannot be 0"));
        }
        if self.replication.flush_interval_ms == 0 {
            return Err(anyhow!("replication.flush_interval_ms cannot be 0"));
        }
        if self.replication.flush_buffer_size == 0 {
            return Err(anyhow!("replication.flush_buffer_size cannot be 0"));
        }
        if self.replication.lag_error_threshold_ms <= self.replication.lag_warning_threshold_ms {
            return Err(anyhow!(
                "replication.lag_error_threshold_ms must be greater than lag_warning_threshold_ms"
            ));
        }
        if self.session.recompute_interval_secs == 0 {
            return Err(anyhow!("session.recompute_interval_secs cannot be 0"));
        }
        if self.session.max_expiry_horizon_secs <= 0 {
            return Err(anyhow!("session.max_expiry_horizon_secs must be positive"));
        }
        if self.flow.handshake_timeout_ms == 0 {
            return Err(anyhow!("flow.handshake_timeout_ms cannot be 0"));
        }
        if hex::decode(&self.flow.secret_hex).is_err() {
            return Err(anyhow!("flow.secret_hex must be valid hex"));
        }
        if self.flow.secret_hex.is_empty() {
            return Err(anyhow!("flow.secret_hex cannot be empty"));
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }

        Ok(())
    }

    pub fn flow_secret(&self) -> Vec<u8> {
        hex::decode(&self.flow.secret_hex).expect("validated at load time")
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.replication.flush_interval_ms)
    }

    pub fn lag_warning_threshold(&self) -> Duration {
        Duration::from_millis(self.replication.lag_warning_threshold_ms)
    }

    pub fn lag_error_threshold(&self) -> Duration {
        Duration::from_millis(self.replication.lag_error_threshold_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.flow.handshake_timeout_ms)
    }

    pub fn recompute_interval(&self) -> Duration {
        Duration::from_secs(self.session.recompute_interval_secs)
    }

    pub fn presence_debounce(&self) -> Duration {
        Duration::from_millis(self.session.presence_debounce_ms)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.presence.heartbeat_ttl_secs)
    }

    pub fn max_expiry_horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session.max_expiry_horizon_secs)
    }

    pub fn replication_settings(&self) -> crate::core::replication::ReplicationSettings {
        crate::core::replication::ReplicationSettings {
            conninfo: self.database.conninfo.clone(),
            schema: self.database.schema.clone(),
            tables: self.database.tables.clone(),
            publication_name: self.database.publication_name.clone(),
            slot_name: self.database.slot_name.clone(),
            flush_interval: self.flush_interval(),
            flush_buffer_size: self.replication.flush_buffer_size,
            lag_warning_threshold: self.lag_warning_threshold(),
            lag_error_threshold: self.lag_error_threshold(),
        }
    }
}
