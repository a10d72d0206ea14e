// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay engine coordinator.
//!
//! The [`RelayEngine`] ties the components together:
//! - connector registry and per-connector polling tasks
//! - durable snapshot log with timed flushes
//! - delivery transport (bus or direct) with a retry queue
//! - remote collection provisioning
//! - periodic reconciliation check and sweep
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Provisioning → Ready → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use telemetry_relay::{RelayEngine, EngineConfig, EngineState};
//! use telemetry_relay::source::MemoryStateSource;
//! use telemetry_relay::encoding::EncoderRegistry;
//! use telemetry_relay::registry::ConnectorRegistry;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = EngineConfig::default();
//! let registry = Arc::new(ConnectorRegistry::load("connectors.json").unwrap());
//! let source = Arc::new(MemoryStateSource::new());
//! let encoders = Arc::new(EncoderRegistry::new());
//! let mut engine = RelayEngine::new(config, registry, source, encoders);
//!
//! assert_eq!(engine.state(), EngineState::Created);
//! // engine.start().await.expect("start failed");
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{ConnectorStatus, EngineState, EngineStatus};

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::config::EngineConfig;
use crate::connector::{ConnectorContext, ConnectorHandle};
use crate::encoding::EncoderRegistry;
use crate::record::{base_columns, SchemaFields};
use crate::registry::{Connector, ConnectorRegistry, ParameterSpec, RegistryError};
use crate::remote::RemoteError;
use crate::retry::{retry_if, RetryConfig};
use crate::snapshot::SnapshotError;
use crate::source::DeviceStateSource;
use crate::{connector, metrics};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("engine not started")]
    NotStarted,
}

/// Main relay coordinator.
///
/// # Thread Safety
///
/// After [`start()`](Self::start) the engine is driven through `&self`;
/// internal state uses concurrent structures and watch channels.
pub struct RelayEngine {
    pub(super) config: EngineConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) registry: Arc<ConnectorRegistry>,
    pub(super) source: Arc<dyn DeviceStateSource>,
    pub(super) encoders: Arc<EncoderRegistry>,

    /// Shared task context, populated by `start()`
    pub(super) ctx: Option<Arc<ConnectorContext>>,
    pub(super) reconciler: Option<Arc<crate::reconcile::ReconciliationEngine>>,

    /// Running connector tasks by connector id
    pub(super) handles: DashMap<String, ConnectorHandle>,
}

impl RelayEngine {
    /// Create a new engine in `Created` state. Call
    /// [`start()`](Self::start) to open local state, connect transports
    /// and spawn connector tasks.
    pub fn new(
        config: EngineConfig,
        registry: Arc<ConnectorRegistry>,
        source: Arc<dyn DeviceStateSource>,
        encoders: Arc<EncoderRegistry>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        Self {
            config,
            state: state_tx,
            state_rx,
            registry,
            source,
            encoders,
            ctx: None,
            reconciler: None,
            handles: DashMap::new(),
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if the engine has started.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    fn context(&self) -> Result<&Arc<ConnectorContext>, EngineError> {
        self.ctx.as_ref().ok_or(EngineError::NotStarted)
    }

    /// Register a connector and start its polling task.
    ///
    /// Creating an id that already exists returns the stored connector
    /// unchanged and leaves its task alone. The target collection is
    /// provisioned before the task starts; a provisioning failure rolls the
    /// registration back and surfaces the error, so a connector never sits
    /// registered without a valid schema.
    pub async fn add_connector(&self, connector: Connector) -> Result<Connector, EngineError> {
        let ctx = self.context()?;
        let stored = self.registry.create(connector)?;

        if self.handles.contains_key(&stored.connector_id) {
            return Ok(stored);
        }

        let desired = self.desired_for(&stored);
        let schema = Arc::clone(&ctx.schema);
        if let Err(e) = retry_if(
            "provision_connector",
            &RetryConfig::publish(),
            RemoteError::is_retryable,
            || schema.ensure_collections(&desired),
        )
        .await
        {
            tracing::error!(
                connector = %stored.connector_id,
                error = %e,
                "Provisioning failed, rolling back connector registration"
            );
            self.registry.delete(&stored.connector_id)?;
            return Err(e.into());
        }

        let handle = connector::spawn(stored.clone(), Arc::clone(ctx));
        self.handles.insert(stored.connector_id.clone(), handle);
        metrics::set_active_connectors(self.handles.len());
        info!(connector = %stored.connector_id, "Connector added");
        Ok(stored)
    }

    /// Stop a connector's task, drop its queued retries and remove it
    /// from the registry. Already-logged snapshots are kept.
    pub async fn remove_connector(&self, connector_id: &str) -> Result<(), EngineError> {
        let ctx = self.context()?;
        self.registry.delete(connector_id)?;

        if let Some((_, handle)) = self.handles.remove(connector_id) {
            handle.stop().await;
        }
        ctx.retries.purge_connector(connector_id);
        ctx.delivery.forget_connector(connector_id);
        metrics::set_active_connectors(self.handles.len());
        info!(connector = connector_id, "Connector removed");
        Ok(())
    }

    /// Update a connector's monitored parameters or poll cadence and
    /// restart its task with the new settings.
    pub async fn update_connector(
        &self,
        connector_id: &str,
        parameters: Option<Vec<ParameterSpec>>,
        poll_interval_secs: Option<u64>,
    ) -> Result<Connector, EngineError> {
        let ctx = self.context()?;
        let updated = self.registry.update(connector_id, parameters, poll_interval_secs)?;

        // New parameters may need columns the collection does not have yet.
        let desired = self.desired_for(&updated);
        let schema = Arc::clone(&ctx.schema);
        if let Err(e) = retry_if(
            "provision_connector",
            &RetryConfig::publish(),
            RemoteError::is_retryable,
            || schema.ensure_collections(&desired),
        )
        .await
        {
            tracing::warn!(
                connector = connector_id,
                error = %e,
                "Schema patch for updated connector failed, next start retries"
            );
        }

        if let Some((_, handle)) = self.handles.remove(connector_id) {
            handle.stop().await;
        }
        let handle = connector::spawn(updated.clone(), Arc::clone(ctx));
        self.handles.insert(connector_id.to_string(), handle);
        info!(connector = connector_id, "Connector updated and restarted");
        Ok(updated)
    }

    /// Engine status snapshot.
    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        let ctx = self.context()?;
        Ok(EngineStatus {
            state: self.state(),
            active_connectors: self.handles.len(),
            retry_queue_depth: ctx.retries.len(),
            snapshot_buffered: ctx.snapshots.buffered(),
            bus_connected: ctx.delivery.is_bus_connected(),
        })
    }

    /// Status of one connector, or `None` if unknown.
    pub fn connector_status(&self, connector_id: &str) -> Result<Option<ConnectorStatus>, EngineError> {
        let ctx = self.context()?;
        let Some(connector) = self.registry.get(connector_id) else {
            return Ok(None);
        };
        Ok(Some(ConnectorStatus {
            running: self.handles.contains_key(connector_id),
            last_publish: ctx.delivery.last_publish(connector_id),
            connector_id: connector.connector_id,
            parameters: connector.parameters,
            poll_interval_secs: connector.poll_interval_secs,
            collection_name: connector.collection_name,
        }))
    }

    /// Desired schema for one connector's collection: base columns plus the
    /// columns its declared parameters encode to. Derived from registry
    /// metadata, not live state, so a parameter that happens to be
    /// unreadable right now still gets its column.
    pub(super) fn desired_for(
        &self,
        connector: &Connector,
    ) -> std::collections::BTreeMap<String, SchemaFields> {
        let mut fields = base_columns();
        for spec in &connector.parameters {
            fields.extend(self.encoders.columns(spec.kind, &[spec.subclass.clone()]));
        }
        std::collections::BTreeMap::from([(connector.collection_name.clone(), fields)])
    }
}
