//! Public types for the relay coordinator.

use crate::registry::ParameterSpec;

/// Engine lifecycle state.
///
/// The engine progresses through states during startup and shutdown.
/// Use [`super::RelayEngine::state()`] to check current state or
/// [`super::RelayEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Opening the local snapshot log and transports
    Connecting,
    /// Creating/patching remote collections
    Provisioning,
    /// Collections provisioned, tasks spawned
    Ready,
    /// Running normally
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Point-in-time view of the engine for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    /// Connector tasks currently running
    pub active_connectors: usize,
    /// Publishes waiting for retry
    pub retry_queue_depth: usize,
    /// Snapshot entries not yet flushed to disk
    pub snapshot_buffered: usize,
    /// Bus transport connected (false when publishing direct)
    pub bus_connected: bool,
}

/// Per-connector status, including its current configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorStatus {
    pub connector_id: String,
    /// Task is spawned and not stopped
    pub running: bool,
    /// record_date of the last successful publish this run
    pub last_publish: Option<String>,
    /// Monitored parameters as configured
    pub parameters: Vec<ParameterSpec>,
    pub poll_interval_secs: u64,
    pub collection_name: String,
}
