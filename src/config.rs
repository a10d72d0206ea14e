//! Configuration for the relay engine.
//!
//! # Example
//!
//! ```
//! use telemetry_relay::EngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.check_interval_secs, 180);
//!
//! // Full config
//! let config = EngineConfig {
//!     base_url: "https://store.example".into(),
//!     project_id: "proj-1".into(),
//!     token: "secret".into(),
//!     snapshot_path: "relay.db".into(),
//!     mqtt_host: Some("broker.example".into()),
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for the relay engine.
///
/// All tuning fields have defaults; `base_url`, `project_id`, `token`
/// and `snapshot_path` must be provided for production use.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Remote store base URL (e.g., "https://store.example")
    #[serde(default)]
    pub base_url: String,

    /// Remote project id
    #[serde(default)]
    pub project_id: String,

    /// Bearer token for the store API
    #[serde(default)]
    pub token: String,

    /// Bucket receiving gap reports
    #[serde(default)]
    pub bucket_id: String,

    /// Path of the local SQLite snapshot log
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    /// Collection name prefix for relay-owned collections
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,

    /// MQTT broker host; when unset, records go straight to the store
    #[serde(default)]
    pub mqtt_host: Option<String>,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    #[serde(default = "default_mqtt_topic")]
    pub mqtt_topic: String,

    /// Reconciliation cadence
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Window offsets relative to now: the checked window is
    /// `[now - window_start_offset_secs, now - window_end_offset_secs)`
    #[serde(default = "default_window_start_offset_secs")]
    pub window_start_offset_secs: u64,
    #[serde(default = "default_window_end_offset_secs")]
    pub window_end_offset_secs: u64,

    /// Snapshot buffer flush cadence
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Retry queue drain cadence
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Local snapshot retention
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Remote API timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_snapshot_path() -> String { "telemetry-relay.db".into() }
fn default_collection_prefix() -> String { "relay_".into() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_mqtt_topic() -> String { "telemetry/records".into() }
fn default_check_interval_secs() -> u64 { 180 }
fn default_window_start_offset_secs() -> u64 { 240 }
fn default_window_end_offset_secs() -> u64 { 60 }
fn default_flush_interval_secs() -> u64 { 15 }
fn default_retry_interval_secs() -> u64 { 20 }
fn default_retention_days() -> u32 { 7 }
fn default_request_timeout_secs() -> u64 { 15 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            project_id: String::new(),
            token: String::new(),
            bucket_id: String::new(),
            snapshot_path: default_snapshot_path(),
            collection_prefix: default_collection_prefix(),
            mqtt_host: None,
            mqtt_port: default_mqtt_port(),
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic: default_mqtt_topic(),
            check_interval_secs: default_check_interval_secs(),
            window_start_offset_secs: default_window_start_offset_secs(),
            window_end_offset_secs: default_window_end_offset_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            retention_days: default_retention_days(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// Window offsets must leave a non-empty window behind now.
    pub fn validate(&self) -> Result<(), String> {
        if self.window_start_offset_secs <= self.window_end_offset_secs {
            return Err(format!(
                "window_start_offset_secs ({}) must exceed window_end_offset_secs ({})",
                self.window_start_offset_secs, self.window_end_offset_secs
            ));
        }
        if self.check_interval_secs == 0 {
            return Err("check_interval_secs must be positive".into());
        }
        Ok(())
    }
}
