//! Engine lifecycle management: start, shutdown, run loop.
//!
//! This module contains the startup sequence, main run loop, and shutdown logic.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use tokio_util::task::TaskTracker;

use crate::connector::{ConnectorContext, RetryQueue};
use crate::delivery::DeliveryClient;
use crate::reconcile::ReconciliationEngine;
use crate::record::SchemaFields;
use crate::remote::{HttpRemoteStore, MqttPublisher, Publisher, RemoteError, RemoteStore};
use crate::retry::{retry_if, RetryConfig};
use crate::schema::SchemaManager;
use crate::snapshot::SnapshotLog;

use super::{EngineError, EngineState, RelayEngine};

impl RelayEngine {
    /// Start the engine from config-built transports.
    ///
    /// Startup flow:
    /// 1. Open the snapshot log (SQLite), the durability lifeline
    /// 2. Build the store client and, when configured, the bus transport
    /// 3. Provision remote collections (startup aborts on failure)
    /// 4. Spawn one polling task per registered connector
    #[tracing::instrument(skip(self), fields(has_bus))]
    pub async fn start(&mut self) -> Result<(), EngineError> {
        self.config
            .validate()
            .map_err(EngineError::Config)?;

        let store: Arc<dyn RemoteStore> = Arc::new(HttpRemoteStore::new(
            &self.config.base_url,
            &self.config.project_id,
            &self.config.token,
            &self.config.bucket_id,
            Duration::from_secs(self.config.request_timeout_secs),
        )?);

        let bus: Option<Arc<dyn Publisher>> = match &self.config.mqtt_host {
            Some(host) => {
                tracing::Span::current().record("has_bus", true);
                let credentials = self
                    .config
                    .mqtt_username
                    .as_deref()
                    .zip(self.config.mqtt_password.as_deref());
                Some(Arc::new(MqttPublisher::connect(
                    host,
                    self.config.mqtt_port,
                    &format!("telemetry-relay-{}", self.config.project_id),
                    self.config.mqtt_topic.clone(),
                    credentials,
                )))
            }
            None => {
                tracing::Span::current().record("has_bus", false);
                None
            }
        };

        self.start_with_transports(store, bus).await
    }

    /// Start with caller-supplied transports. Used directly by tests and
    /// embeddings that bring their own store client.
    pub async fn start_with_transports(
        &mut self,
        store: Arc<dyn RemoteStore>,
        bus: Option<Arc<dyn Publisher>>,
    ) -> Result<(), EngineError> {
        let startup_start = std::time::Instant::now();
        info!("Starting relay engine...");
        let _ = self.state.send(EngineState::Connecting);
        crate::metrics::set_engine_state("Connecting");

        // ========== PHASE 1: Open snapshot log (always first) ==========
        let phase_start = std::time::Instant::now();
        let snapshots = match SnapshotLog::open(&self.config.snapshot_path).await {
            Ok(log) => {
                crate::metrics::record_startup_phase("snapshot_open", phase_start.elapsed());
                Arc::new(log)
            }
            Err(e) => {
                error!(path = %self.config.snapshot_path, error = %e,
                    "Failed to open snapshot log, cannot guarantee durability");
                return Err(e.into());
            }
        };

        // ========== PHASE 2: Wire up delivery ==========
        let delivery = Arc::new(DeliveryClient::new(Arc::clone(&store), bus));
        let schema = Arc::new(SchemaManager::new(
            Arc::clone(&store),
            self.config.collection_prefix.clone(),
        ));
        let ctx = Arc::new(ConnectorContext {
            source: Arc::clone(&self.source),
            encoders: Arc::clone(&self.encoders),
            schema: Arc::clone(&schema),
            delivery: Arc::clone(&delivery),
            snapshots: Arc::clone(&snapshots),
            retries: Arc::new(RetryQueue::new()),
            publishes: TaskTracker::new(),
        });
        self.reconciler = Some(Arc::new(ReconciliationEngine::new(
            Arc::clone(&snapshots),
            Arc::clone(&delivery),
            Arc::clone(&schema),
            self.config.window_start_offset_secs,
            self.config.window_end_offset_secs,
        )));
        self.ctx = Some(Arc::clone(&ctx));

        // ========== PHASE 3: Provision collections ==========
        let phase_start = std::time::Instant::now();
        let _ = self.state.send(EngineState::Provisioning);
        crate::metrics::set_engine_state("Provisioning");

        // No polling without a valid schema: a store that rejects
        // provisioning outright fails startup instead of reporting Ready.
        let desired = self.desired_schema();
        if let Err(e) = retry_if(
            "provision_collections",
            &RetryConfig::startup(),
            RemoteError::is_retryable,
            || schema.ensure_collections(&desired),
        )
        .await
        {
            error!(error = %e, "Provisioning failed, refusing to start without a valid schema");
            return Err(e.into());
        }
        crate::metrics::record_startup_phase("provision", phase_start.elapsed());

        // ========== PHASE 4: Spawn connector tasks ==========
        for connector in self.registry.list() {
            let handle = crate::connector::spawn(connector, Arc::clone(&ctx));
            self.handles.insert(handle.connector_id().to_string(), handle);
        }
        crate::metrics::set_active_connectors(self.handles.len());

        let _ = self.state.send(EngineState::Ready);
        crate::metrics::set_engine_state("Ready");
        crate::metrics::record_startup_phase("total", startup_start.elapsed());
        info!(
            connectors = self.handles.len(),
            transport = ctx.delivery.transport_name(),
            "Relay engine ready"
        );
        Ok(())
    }

    /// Desired schema for every registered connector, merged per
    /// collection (two connectors on the same model share one).
    pub(super) fn desired_schema(&self) -> BTreeMap<String, SchemaFields> {
        let mut desired: BTreeMap<String, SchemaFields> = BTreeMap::new();
        for connector in self.registry.list() {
            for (name, fields) in self.desired_for(&connector) {
                desired.entry(name).or_default().extend(fields);
            }
        }
        desired
    }

    /// Run the maintenance loop: flush, check, sweep, retry drain,
    /// retention. Runs until the task is dropped; call
    /// [`shutdown()`](Self::shutdown) for a clean stop first.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<(), EngineError> {
        let ctx = Arc::clone(self.ctx.as_ref().ok_or(EngineError::NotStarted)?);
        let reconciler = Arc::clone(self.reconciler.as_ref().ok_or(EngineError::NotStarted)?);

        let _ = self.state.send(EngineState::Running);
        crate::metrics::set_engine_state("Running");
        info!("Relay engine running");

        // Windows parked by a previous run are recovered before the
        // timers arm, so old gaps don't wait a full check interval.
        if let Err(e) = reconciler.run_sweep().await {
            warn!(error = %e, "Startup sweep failed");
        }

        let mut flush_interval =
            tokio::time::interval(Duration::from_secs(self.config.flush_interval_secs));
        let mut check_interval =
            tokio::time::interval(Duration::from_secs(self.config.check_interval_secs));
        let mut retry_interval =
            tokio::time::interval(Duration::from_secs(self.config.retry_interval_secs));
        let mut retention_interval = tokio::time::interval(Duration::from_secs(3600));
        // First ticks fire immediately; the check would see an empty log
        // and retention has nothing to do yet.
        check_interval.tick().await;
        retention_interval.tick().await;

        loop {
            tokio::select! {
                _ = flush_interval.tick() => {
                    self.flush_snapshots(&ctx).await;
                }
                _ = check_interval.tick() => {
                    // Flush first so the check sees everything published
                    // before the window closed.
                    self.flush_snapshots(&ctx).await;
                    if let Err(e) = reconciler.run_check(Utc::now()).await {
                        warn!(error = %e, "Reconciliation check failed");
                    }
                    if let Err(e) = reconciler.run_sweep().await {
                        warn!(error = %e, "Sweep failed");
                    }
                }
                _ = retry_interval.tick() => {
                    ctx.retries.drain(&ctx.delivery).await;
                    crate::metrics::set_transport_healthy(
                        "bus",
                        ctx.delivery.is_bus_connected(),
                    );
                }
                _ = retention_interval.tick() => {
                    let cutoff = Utc::now()
                        - chrono::Duration::days(i64::from(self.config.retention_days));
                    match ctx.snapshots.purge_older_than(cutoff).await {
                        Ok(purged) => crate::metrics::record_retention_purge(purged),
                        Err(e) => warn!(error = %e, "Retention purge failed"),
                    }
                }
            }
        }
    }

    async fn flush_snapshots(&self, ctx: &ConnectorContext) {
        crate::metrics::set_snapshot_buffer(ctx.snapshots.buffered());
        match ctx.snapshots.flush().await {
            Ok(flushed) => {
                crate::metrics::record_snapshot_flush(flushed, true);
                if flushed > 0 {
                    debug!(flushed, "Snapshots flushed");
                }
            }
            Err(e) => {
                crate::metrics::record_snapshot_flush(0, false);
                warn!(error = %e, "Snapshot flush failed");
            }
        }
    }

    /// Initiate graceful shutdown: stop connector tasks, then flush what
    /// they logged.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = std::time::Instant::now();
        info!("Initiating relay engine shutdown...");
        let _ = self.state.send(EngineState::ShuttingDown);
        crate::metrics::set_engine_state("ShuttingDown");

        let ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.handles.remove(&id) {
                handle.stop().await;
            }
        }
        crate::metrics::set_active_connectors(0);

        if let Some(ctx) = &self.ctx {
            // In-flight fire-and-forget publishes get a bounded grace period.
            ctx.publishes.close();
            if tokio::time::timeout(Duration::from_secs(2), ctx.publishes.wait())
                .await
                .is_err()
            {
                warn!("In-flight publishes still pending, reconciliation will recover");
            }
            self.flush_snapshots(ctx).await;
            let pending = ctx.retries.len();
            if pending > 0 {
                info!(pending, "Retry queue dropped on shutdown, reconciliation will recover");
            }
        }

        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Relay engine shutdown complete");
    }
}
