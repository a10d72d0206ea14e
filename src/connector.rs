// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-connector polling tasks.
//!
//! Each configured connector runs as one tokio task: wait for its
//! collection to be provisioned, announce itself with a `reloaded`
//! record, then poll the device on its own cadence and hand every built
//! record to the snapshot log and the delivery transport.
//!
//! Publishes are fired off the poll loop so a slow transport never
//! stretches the cadence. A failed publish lands in the [`RetryQueue`];
//! the snapshot entry already exists, so reconciliation can recover the
//! record even if the retry queue is lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::delivery::DeliveryClient;
use crate::encoding::EncoderRegistry;
use crate::metrics;
use crate::record::{
    format_timestamp, CumulativeRecord, FieldValue, Record, FIELD_AREA, FIELD_COLLECTION,
    FIELD_CONNECTOR, FIELD_NAME, FIELD_PRODUCT, FIELD_STATUS, FIELD_TIMESTAMP, STATUS_RELOADED,
};
use crate::registry::Connector;
use crate::schema::SchemaManager;
use crate::snapshot::{SnapshotEntry, SnapshotLog};
use crate::source::{DeviceMetadata, DeviceStateSource};

/// Everything a connector task needs, shared across all tasks.
pub struct ConnectorContext {
    pub source: Arc<dyn DeviceStateSource>,
    pub encoders: Arc<EncoderRegistry>,
    pub schema: Arc<SchemaManager>,
    pub delivery: Arc<DeliveryClient>,
    pub snapshots: Arc<SnapshotLog>,
    pub retries: Arc<RetryQueue>,
    /// In-flight fire-and-forget publishes, so shutdown can wait for them.
    pub publishes: TaskTracker,
}

/// A publish that failed its initial attempt. Held in memory only.
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub connector_id: String,
    pub collection_id: String,
    pub record_date: String,
    pub payload: String,
}

/// Volatile queue of failed publishes, drained on a timer.
///
/// Loss of this queue on restart is acceptable: the snapshot log holds
/// the durable copy and reconciliation closes any remaining gap.
#[derive(Default)]
pub struct RetryQueue {
    entries: parking_lot::Mutex<Vec<PendingPublish>>,
}

impl RetryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, pending: PendingPublish) {
        let mut entries = self.entries.lock();
        entries.push(pending);
        metrics::set_retry_queue_depth(entries.len());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop queued publishes for a deleted connector.
    pub fn purge_connector(&self, connector_id: &str) {
        let mut entries = self.entries.lock();
        entries.retain(|p| p.connector_id != connector_id);
        metrics::set_retry_queue_depth(entries.len());
    }

    /// Re-attempt every queued publish. Transient failures go back on the
    /// queue in their original order; a rejected payload is dropped, it
    /// would fail the same way forever. Returns (delivered, requeued).
    pub async fn drain(&self, delivery: &DeliveryClient) -> (usize, usize) {
        let batch: Vec<PendingPublish> = std::mem::take(&mut *self.entries.lock());
        if batch.is_empty() {
            return (0, 0);
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        for pending in batch {
            match delivery
                .publish(
                    &pending.connector_id,
                    &pending.collection_id,
                    &pending.record_date,
                    &pending.payload,
                )
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) if e.is_retryable() => failed.push(pending),
                Err(e) => {
                    warn!(
                        connector = %pending.connector_id,
                        record_date = %pending.record_date,
                        error = %e,
                        "Publish rejected, dropping from retry queue"
                    );
                }
            }
        }

        let requeued = failed.len();
        if requeued > 0 {
            let mut entries = self.entries.lock();
            // Newer failures queued during the drain stay behind these.
            failed.extend(entries.drain(..));
            *entries = failed;
            metrics::set_retry_queue_depth(entries.len());
        } else {
            metrics::set_retry_queue_depth(self.len());
        }

        metrics::record_retry_drain(delivered, requeued);
        if delivered > 0 || requeued > 0 {
            info!(delivered, requeued, "Retry queue drained");
        }
        (delivered, requeued)
    }
}

/// Handle to a spawned connector task.
pub struct ConnectorHandle {
    connector_id: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConnectorHandle {
    #[must_use]
    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the polling task for one connector.
pub fn spawn(connector: Connector, ctx: Arc<ConnectorContext>) -> ConnectorHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let connector_id = connector.connector_id.clone();
    let task = tokio::spawn(run(connector, ctx, shutdown_rx));
    ConnectorHandle { connector_id, shutdown: shutdown_tx, task }
}

async fn run(connector: Connector, ctx: Arc<ConnectorContext>, mut shutdown: watch::Receiver<bool>) {
    // Readiness is raced against shutdown so a stop() issued while the
    // collection is still being provisioned never hangs.
    let collection_id = tokio::select! {
        id = ctx.schema.wait_ready(&connector.collection_name) => id,
        _ = shutdown.changed() => {
            debug!(
                connector = %connector.connector_id,
                "Stopped before collection was provisioned"
            );
            return;
        }
    };

    info!(
        connector = %connector.connector_id,
        collection = %collection_id,
        interval_secs = connector.poll_interval_secs,
        "Connector task started"
    );

    // Announce the (re)start so downstream can see the discontinuity.
    let reloaded = reload_record(&connector, &collection_id, ctx.source.device(&connector.device_id));
    dispatch(&connector, &collection_id, reloaded, &ctx);

    let mut state = CumulativeRecord::new();
    let mut interval =
        tokio::time::interval(Duration::from_secs(connector.poll_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it, the reload record covers now.
    interval.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                poll_once(&connector, &collection_id, &mut state, &ctx);
            }
        }
    }

    debug!(connector = %connector.connector_id, "Connector task stopped");
}

/// One poll cycle: read state, merge into the cumulative record, dispatch.
fn poll_once(
    connector: &Connector,
    collection_id: &str,
    state: &mut CumulativeRecord,
    ctx: &Arc<ConnectorContext>,
) {
    let Some(metadata) = ctx.source.device(&connector.device_id) else {
        // Device removed from the platform; emit nothing.
        debug!(
            connector = %connector.connector_id,
            device = %connector.device_id,
            "Device missing, skipping tick"
        );
        return;
    };

    state.begin_tick();
    for spec in &connector.parameters {
        if let Some(reading) = ctx.source.value(&spec.parameter_id) {
            for (field, value) in ctx.encoders.encode(&reading) {
                state.put(field, value);
            }
        }
    }

    let mut record = state.finish_tick();
    stamp_identity(&mut record, connector, collection_id, &metadata);
    dispatch(connector, collection_id, record, ctx);
}

fn reload_record(
    connector: &Connector,
    collection_id: &str,
    metadata: Option<DeviceMetadata>,
) -> Record {
    let mut record = Record::new();
    record.set(FIELD_STATUS, FieldValue::Text(STATUS_RELOADED.to_string()));
    let metadata = metadata.unwrap_or(DeviceMetadata {
        area: None,
        name: None,
        product_id: None,
        model_identity: connector.collection_name.clone(),
    });
    stamp_identity(&mut record, connector, collection_id, &metadata);
    record
}

fn stamp_identity(
    record: &mut Record,
    connector: &Connector,
    collection_id: &str,
    metadata: &DeviceMetadata,
) {
    record.set(FIELD_CONNECTOR, FieldValue::Text(connector.connector_id.clone()));
    record.set(FIELD_COLLECTION, FieldValue::Text(collection_id.to_string()));
    record.set(FIELD_TIMESTAMP, FieldValue::Timestamp(format_timestamp(Utc::now())));
    record.set(
        FIELD_AREA,
        metadata.area.clone().map_or(FieldValue::Null, FieldValue::Text),
    );
    record.set(
        FIELD_NAME,
        metadata.name.clone().map_or(FieldValue::Null, FieldValue::Text),
    );
    record.set(
        FIELD_PRODUCT,
        metadata.product_id.clone().map_or(FieldValue::Null, FieldValue::Text),
    );
}

/// Log the record locally, then publish off the poll loop.
fn dispatch(connector: &Connector, collection_id: &str, record: Record, ctx: &Arc<ConnectorContext>) {
    let record_date = match record.get(FIELD_TIMESTAMP) {
        Some(FieldValue::Timestamp(ts)) => ts.clone(),
        _ => format_timestamp(Utc::now()),
    };
    let payload = record.payload();

    // Snapshot first: the local log is the source of truth for recovery.
    ctx.snapshots.append(SnapshotEntry {
        connector_id: connector.connector_id.clone(),
        collection_id: collection_id.to_string(),
        record_date: record_date.clone(),
        payload: payload.clone(),
    });

    let delivery = Arc::clone(&ctx.delivery);
    let retries = Arc::clone(&ctx.retries);
    let connector_id = connector.connector_id.clone();
    let collection_id = collection_id.to_string();
    ctx.publishes.spawn(async move {
        if let Err(e) = delivery
            .publish(&connector_id, &collection_id, &record_date, &payload)
            .await
        {
            if e.is_retryable() {
                warn!(connector = %connector_id, "Publish failed, queued for retry");
                retries.push(PendingPublish { connector_id, collection_id, record_date, payload });
            } else {
                warn!(connector = %connector_id, error = %e, "Publish rejected, not queued");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    use crate::encoding::{ParameterKind, ParameterReading, StateValue};
    use crate::record::{base_columns, SchemaFields};
    use crate::remote::{CollectionInfo, Publisher, RemoteError, RemoteRow, RemoteStore};
    use crate::source::MemoryStateSource;

    #[derive(Default)]
    struct SinkStore {
        inserted: parking_lot::Mutex<Vec<String>>,
        fail: AtomicBool,
        reject: AtomicBool,
    }

    #[async_trait]
    impl RemoteStore for SinkStore {
        async fn list_collections(&self, _: &str) -> Result<Vec<CollectionInfo>, RemoteError> {
            Ok(Vec::new())
        }
        async fn create_collection(
            &self,
            name: &str,
            fields: &SchemaFields,
        ) -> Result<CollectionInfo, RemoteError> {
            Ok(CollectionInfo {
                id: format!("id-{name}"),
                name: name.to_string(),
                field_names: fields.keys().cloned().collect::<HashSet<_>>(),
            })
        }
        async fn patch_collection(&self, _: &str, _: &SchemaFields) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn insert_record(&self, _: &str, payload: &str) -> Result<(), RemoteError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RemoteError::Connectivity("down".into()));
            }
            if self.reject.load(Ordering::SeqCst) {
                return Err(RemoteError::Rejected { status: 400, message: "unknown field".into() });
            }
            self.inserted.lock().push(payload.to_string());
            Ok(())
        }
        async fn query_window(
            &self,
            _: &str,
            _: chrono::DateTime<Utc>,
            _: chrono::DateTime<Utc>,
        ) -> Result<Vec<RemoteRow>, RemoteError> {
            Ok(Vec::new())
        }
        async fn upload_blob(&self, _: &str, _: Vec<u8>) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    struct DownBus;

    #[async_trait]
    impl Publisher for DownBus {
        async fn publish(&self, _: &str) -> Result<(), RemoteError> {
            Err(RemoteError::Connectivity("bus down".into()))
        }
        fn is_connected(&self) -> bool {
            false
        }
    }

    fn connector() -> Connector {
        Connector {
            connector_id: "c1".into(),
            project_id: "p1".into(),
            device_id: "dev-1".into(),
            parameters: vec![crate::registry::ParameterSpec {
                parameter_id: "dev-1.temp".into(),
                kind: ParameterKind::Numeric,
                subclass: Some("temperature".into()),
            }],
            poll_interval_secs: 1,
            collection_name: "acme thermostat".into(),
        }
    }

    async fn context(store: Arc<SinkStore>, bus: Option<Arc<dyn Publisher>>) -> Arc<ConnectorContext> {
        let ctx = unprovisioned_context(store, bus).await;
        let desired = BTreeMap::from([("acme thermostat".to_string(), base_columns())]);
        ctx.schema.ensure_collections(&desired).await.unwrap();
        ctx
    }

    async fn unprovisioned_context(
        store: Arc<SinkStore>,
        bus: Option<Arc<dyn Publisher>>,
    ) -> Arc<ConnectorContext> {
        let dir = tempdir().unwrap();
        let snapshots = Arc::new(
            SnapshotLog::open(dir.path().join("snap.db")).await.unwrap(),
        );
        // Keep the tempdir alive for the test process
        std::mem::forget(dir);

        let schema = Arc::new(SchemaManager::new(store.clone(), "relay_"));

        let source = Arc::new(MemoryStateSource::new());
        source.set_device(
            "dev-1",
            DeviceMetadata {
                area: Some("kitchen".into()),
                name: Some("Thermostat".into()),
                product_id: None,
                model_identity: "acme thermostat".into(),
            },
        );
        source.set_value(ParameterReading {
            parameter_id: "dev-1.temp".into(),
            kind: ParameterKind::Numeric,
            subclass: Some("temperature".into()),
            value: StateValue::Number(21.5),
        });

        Arc::new(ConnectorContext {
            source,
            encoders: Arc::new(EncoderRegistry::new()),
            schema,
            delivery: Arc::new(DeliveryClient::new(store, bus)),
            snapshots,
            retries: Arc::new(RetryQueue::new()),
            publishes: TaskTracker::new(),
        })
    }

    #[tokio::test]
    async fn test_reload_record_emitted_on_start() {
        let store = Arc::new(SinkStore::default());
        let ctx = context(store.clone(), None).await;

        let handle = spawn(connector(), Arc::clone(&ctx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        assert!(ctx.snapshots.buffered() >= 1);
        let inserted = store.inserted.lock();
        assert!(!inserted.is_empty());
        assert!(inserted[0].contains(STATUS_RELOADED));
        assert!(inserted[0].contains("\"connector_id\":\"c1\""));
    }

    #[tokio::test]
    async fn test_poll_builds_dense_record() {
        let store = Arc::new(SinkStore::default());
        let ctx = context(store.clone(), None).await;

        let handle = spawn(connector(), Arc::clone(&ctx));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        handle.stop().await;

        let inserted = store.inserted.lock();
        let tick_record = inserted
            .iter()
            .find(|p| p.contains("temperature"))
            .expect("at least one poll record");
        assert!(tick_record.contains("\"temperature\":21.5"));
        assert!(tick_record.contains("\"area\":\"kitchen\""));
    }

    #[tokio::test]
    async fn test_failed_publish_lands_in_retry_queue() {
        let store = Arc::new(SinkStore::default());
        let bus: Arc<dyn Publisher> = Arc::new(DownBus);
        let ctx = context(store.clone(), Some(bus)).await;

        let handle = spawn(connector(), Arc::clone(&ctx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        // Reload record failed on the dead bus
        assert!(!ctx.retries.is_empty());
        // Snapshot was taken regardless
        assert!(ctx.snapshots.buffered() >= 1);
    }

    #[tokio::test]
    async fn test_retry_drain_delivers_and_requeues() {
        let store = Arc::new(SinkStore::default());
        let delivery = DeliveryClient::new(store.clone(), None);
        let queue = RetryQueue::new();

        queue.push(PendingPublish {
            connector_id: "c1".into(),
            collection_id: "col".into(),
            record_date: "2026-03-01T10:00:00.000Z".into(),
            payload: "{}".into(),
        });

        let (delivered, requeued) = queue.drain(&delivery).await;
        assert_eq!((delivered, requeued), (1, 0));
        assert!(queue.is_empty());

        store.fail.store(true, Ordering::SeqCst);
        queue.push(PendingPublish {
            connector_id: "c2".into(),
            collection_id: "col".into(),
            record_date: "2026-03-01T10:01:00.000Z".into(),
            payload: "{}".into(),
        });
        let (delivered, requeued) = queue.drain(&delivery).await;
        assert_eq!((delivered, requeued), (0, 1));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_unblocks_task_waiting_for_provisioning() {
        let store = Arc::new(SinkStore::default());
        let ctx = unprovisioned_context(store, None).await;

        let handle = spawn(connector(), Arc::clone(&ctx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("stop must not hang on an unprovisioned collection");
        assert_eq!(ctx.snapshots.buffered(), 0);
    }

    #[tokio::test]
    async fn test_task_polls_once_collection_appears() {
        let store = Arc::new(SinkStore::default());
        let ctx = unprovisioned_context(store.clone(), None).await;

        let handle = spawn(connector(), Arc::clone(&ctx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.inserted.lock().is_empty());

        // Provisioning lands after the task started waiting.
        let desired = BTreeMap::from([("acme thermostat".to_string(), base_columns())]);
        ctx.schema.ensure_collections(&desired).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;
        ctx.publishes.close();
        ctx.publishes.wait().await;

        let inserted = store.inserted.lock();
        assert!(!inserted.is_empty(), "task should publish once provisioned");
        assert!(inserted[0].contains(STATUS_RELOADED));
    }

    #[tokio::test]
    async fn test_drain_drops_rejected_publish() {
        let store = Arc::new(SinkStore::default());
        store.reject.store(true, Ordering::SeqCst);
        let delivery = DeliveryClient::new(store.clone(), None);
        let queue = RetryQueue::new();

        queue.push(PendingPublish {
            connector_id: "c1".into(),
            collection_id: "col".into(),
            record_date: "2026-03-01T10:00:00.000Z".into(),
            payload: r#"{"bad":"field"}"#.into(),
        });

        let (delivered, requeued) = queue.drain(&delivery).await;
        assert_eq!((delivered, requeued), (0, 0));
        assert!(queue.is_empty(), "rejected payload must not be requeued");

        // A transient failure still goes back on the queue.
        store.reject.store(false, Ordering::SeqCst);
        store.fail.store(true, Ordering::SeqCst);
        queue.push(PendingPublish {
            connector_id: "c1".into(),
            collection_id: "col".into(),
            record_date: "2026-03-01T10:01:00.000Z".into(),
            payload: "{}".into(),
        });
        let (delivered, requeued) = queue.drain(&delivery).await;
        assert_eq!((delivered, requeued), (0, 1));
    }

    #[tokio::test]
    async fn test_purge_connector_drops_only_its_entries() {
        let queue = RetryQueue::new();
        for id in ["c1", "c2", "c1"] {
            queue.push(PendingPublish {
                connector_id: id.into(),
                collection_id: "col".into(),
                record_date: "2026-03-01T10:00:00.000Z".into(),
                payload: "{}".into(),
            });
        }
        queue.purge_connector("c1");
        assert_eq!(queue.len(), 1);
    }
}
