//! Failure-injection tests for the relay pipeline.
//!
//! A wrapper store fails specific calls by call count or by a toggled
//! outage flag, exercising the recovery paths: retry queue drains after
//! a transport outage, failed checks park windows for the sweep, and
//! partial resend failures are repaired by the next check.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use telemetry_relay::record::{base_columns, format_timestamp};
use telemetry_relay::{
    CollectionInfo, DeliveryClient, PendingPublish, ReconciliationEngine, RemoteError, RemoteRow,
    RemoteStore, RetryQueue, SchemaFields, SchemaManager, SnapshotEntry, SnapshotLog,
};

// =============================================================================
// Chaos store
// =============================================================================

/// Remote store with precise error injection.
///
/// Inserts fail when the 1-based insert call number appears in
/// `insert_fail_on_calls`; queries fail while `query_outage` is set.
#[derive(Default)]
struct ChaosRemote {
    records: parking_lot::Mutex<Vec<String>>,
    remote_rows: parking_lot::Mutex<Vec<RemoteRow>>,
    blobs: parking_lot::Mutex<Vec<String>>,
    insert_calls: AtomicU64,
    insert_fail_on_calls: parking_lot::Mutex<Vec<u64>>,
    query_outage: AtomicBool,
}

impl ChaosRemote {
    fn fail_inserts(&self, calls: &[u64]) {
        *self.insert_fail_on_calls.lock() = calls.to_vec();
    }

    fn set_query_outage(&self, down: bool) {
        self.query_outage.store(down, Ordering::SeqCst);
    }

    /// Make a row visible to window queries without going through insert.
    fn seed_remote_row(&self, connector: &str, date: &str) {
        self.remote_rows.lock().push(RemoteRow {
            connector_id: connector.to_string(),
            timestamp: date.to_string(),
        });
    }
}

#[async_trait]
impl RemoteStore for ChaosRemote {
    async fn list_collections(&self, _: &str) -> Result<Vec<CollectionInfo>, RemoteError> {
        Ok(Vec::new())
    }

    async fn create_collection(
        &self,
        name: &str,
        fields: &SchemaFields,
    ) -> Result<CollectionInfo, RemoteError> {
        Ok(CollectionInfo {
            id: "col-1".into(),
            name: name.to_string(),
            field_names: fields.keys().cloned().collect::<HashSet<_>>(),
        })
    }

    async fn patch_collection(&self, _: &str, _: &SchemaFields) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn insert_record(&self, _: &str, payload: &str) -> Result<(), RemoteError> {
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.insert_fail_on_calls.lock().contains(&call) {
            return Err(RemoteError::Connectivity(format!(
                "injected failure on insert call {call}"
            )));
        }
        let mut records = self.records.lock();
        records.push(payload.to_string());
        // Inserted records become queryable rows too
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
            if let (Some(connector), Some(date)) = (
                value.get("connector_id").and_then(|v| v.as_str()),
                value.get("record_date").and_then(|v| v.as_str()),
            ) {
                self.remote_rows.lock().push(RemoteRow {
                    connector_id: connector.to_string(),
                    timestamp: date.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn query_window(
        &self,
        _: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        if self.query_outage.load(Ordering::SeqCst) {
            return Err(RemoteError::Connectivity("injected query outage".into()));
        }
        let start = format_timestamp(start);
        let end = format_timestamp(end);
        Ok(self
            .remote_rows
            .lock()
            .iter()
            .filter(|row| row.timestamp >= start && row.timestamp < end)
            .cloned()
            .collect())
    }

    async fn upload_blob(&self, name: &str, _: Vec<u8>) -> Result<(), RemoteError> {
        self.blobs.lock().push(name.to_string());
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

struct Rig {
    _dir: TempDir,
    store: Arc<ChaosRemote>,
    snapshots: Arc<SnapshotLog>,
    delivery: Arc<DeliveryClient>,
    reconciler: ReconciliationEngine,
}

async fn rig() -> Rig {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ChaosRemote::default());
    let snapshots = Arc::new(SnapshotLog::open(dir.path().join("snap.db")).await.unwrap());

    let schema = Arc::new(SchemaManager::new(store.clone(), "relay_"));
    let desired = BTreeMap::from([("sensor".to_string(), base_columns())]);
    schema.ensure_collections(&desired).await.unwrap();

    let delivery = Arc::new(DeliveryClient::new(store.clone(), None));
    let reconciler = ReconciliationEngine::new(
        Arc::clone(&snapshots),
        Arc::clone(&delivery),
        schema,
        240,
        60,
    );
    Rig { _dir: dir, store, snapshots, delivery, reconciler }
}

fn pending(connector: &str, date: &str) -> PendingPublish {
    PendingPublish {
        connector_id: connector.to_string(),
        collection_id: "col-1".to_string(),
        record_date: date.to_string(),
        payload: format!(r#"{{"connector_id":"{connector}","record_date":"{date}"}}"#),
    }
}

fn entry(connector: &str, date: &str) -> SnapshotEntry {
    SnapshotEntry {
        connector_id: connector.to_string(),
        collection_id: "col-1".to_string(),
        record_date: date.to_string(),
        payload: format!(r#"{{"connector_id":"{connector}","record_date":"{date}"}}"#),
    }
}

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

// =============================================================================
// Retry queue under transport outage
// =============================================================================

#[tokio::test]
async fn test_retry_queue_drains_after_outage() {
    let rig = rig().await;
    // All inserts fail while the store is down
    rig.store.fail_inserts(&[1, 2, 3]);

    let queue = RetryQueue::new();
    for date in ["10:00:00", "10:00:10", "10:00:20"] {
        let date = format!("2026-03-01T{date}.000Z");
        queue.push(pending("c1", &date));
    }

    let (delivered, requeued) = queue.drain(&rig.delivery).await;
    assert_eq!((delivered, requeued), (0, 3));

    // Store back up: the next drain delivers everything in order
    let (delivered, requeued) = queue.drain(&rig.delivery).await;
    assert_eq!((delivered, requeued), (3, 0));
    assert!(queue.is_empty());

    let records = rig.store.records.lock();
    assert_eq!(records.len(), 3);
    assert!(records[0].contains("10:00:00"));
    assert!(records[2].contains("10:00:20"));
}

#[tokio::test]
async fn test_partial_drain_keeps_failures_in_order() {
    let rig = rig().await;
    // Only the second insert fails
    rig.store.fail_inserts(&[2]);

    let queue = RetryQueue::new();
    queue.push(pending("c1", "2026-03-01T10:00:00.000Z"));
    queue.push(pending("c1", "2026-03-01T10:00:10.000Z"));
    queue.push(pending("c1", "2026-03-01T10:00:20.000Z"));

    let (delivered, requeued) = queue.drain(&rig.delivery).await;
    assert_eq!((delivered, requeued), (2, 1));
    assert_eq!(queue.len(), 1);

    let (delivered, _) = queue.drain(&rig.delivery).await;
    assert_eq!(delivered, 1);
    assert_eq!(rig.store.records.lock().len(), 3);
}

// =============================================================================
// Reconciliation under store outage
// =============================================================================

#[tokio::test]
async fn test_outage_parks_windows_until_sweep_recovers() {
    let rig = rig().await;
    rig.snapshots.append(entry("c1", "2026-03-01T10:00:30.000Z"));
    rig.snapshots.append(entry("c1", "2026-03-01T10:04:30.000Z"));
    rig.snapshots.flush().await.unwrap();

    // Two checks run during the outage; both windows get parked
    rig.store.set_query_outage(true);
    rig.reconciler.run_check(ts("2026-03-01T10:04:00.000Z")).await.unwrap();
    rig.reconciler.run_check(ts("2026-03-01T10:08:00.000Z")).await.unwrap();
    assert_eq!(rig.snapshots.failed_windows().await.unwrap().len(), 2);

    // Sweep during the outage verifies nothing
    let stuck = rig.reconciler.run_sweep().await.unwrap();
    assert_eq!(stuck.recovered, 0);
    assert_eq!(stuck.remaining, 2);

    // Outage ends; the second record made it, the first never did
    rig.store.set_query_outage(false);
    rig.store.seed_remote_row("c1", "2026-03-01T10:04:30.000Z");

    let report = rig.reconciler.run_sweep().await.unwrap();
    assert_eq!(report.recovered, 2);
    assert_eq!(report.resent, 1);
    assert!(rig.snapshots.failed_windows().await.unwrap().is_empty());
    assert!(rig.store.records.lock()[0].contains("10:00:30"));
}

#[tokio::test]
async fn test_resend_failure_repaired_by_next_check() {
    let rig = rig().await;
    rig.snapshots.append(entry("c1", "2026-03-01T10:00:30.000Z"));
    rig.snapshots.flush().await.unwrap();

    // The record never arrived, and the first resend attempt fails too
    rig.store.fail_inserts(&[1]);
    let first = rig.reconciler.run_check(ts("2026-03-01T10:04:00.000Z")).await.unwrap();
    assert_eq!(first.gaps, 1);
    assert_eq!(first.resent, 0);

    // Next cycle sees the same gap and repairs it
    let second = rig.reconciler.run_check(ts("2026-03-01T10:04:00.000Z")).await.unwrap();
    assert_eq!(second.gaps, 1);
    assert_eq!(second.resent, 1);
    assert!(rig.store.records.lock()[0].contains("10:00:30"));
}

#[tokio::test]
async fn test_resend_continues_past_individual_failures() {
    let rig = rig().await;
    for date in ["10:00:10", "10:00:20", "10:00:30"] {
        rig.snapshots.append(entry("c1", &format!("2026-03-01T{date}.000Z")));
    }
    rig.snapshots.flush().await.unwrap();

    // Middle resend fails; the others must still go through
    rig.store.fail_inserts(&[2]);
    let report = rig.reconciler.run_check(ts("2026-03-01T10:04:00.000Z")).await.unwrap();
    assert_eq!(report.gaps, 3);
    assert_eq!(report.resent, 2);

    let records = rig.store.records.lock();
    assert!(records.iter().any(|p| p.contains("10:00:10")));
    assert!(records.iter().any(|p| p.contains("10:00:30")));
}

#[tokio::test]
async fn test_gap_report_upload_failure_does_not_block_resend() {
    let dir = TempDir::new().unwrap();

    /// Store whose blob uploads always fail.
    struct NoBlobStore(ChaosRemote);

    #[async_trait]
    impl RemoteStore for NoBlobStore {
        async fn list_collections(&self, p: &str) -> Result<Vec<CollectionInfo>, RemoteError> {
            self.0.list_collections(p).await
        }
        async fn create_collection(
            &self,
            name: &str,
            fields: &SchemaFields,
        ) -> Result<CollectionInfo, RemoteError> {
            self.0.create_collection(name, fields).await
        }
        async fn patch_collection(&self, id: &str, f: &SchemaFields) -> Result<(), RemoteError> {
            self.0.patch_collection(id, f).await
        }
        async fn insert_record(&self, id: &str, payload: &str) -> Result<(), RemoteError> {
            self.0.insert_record(id, payload).await
        }
        async fn query_window(
            &self,
            id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<RemoteRow>, RemoteError> {
            self.0.query_window(id, start, end).await
        }
        async fn upload_blob(&self, _: &str, _: Vec<u8>) -> Result<(), RemoteError> {
            Err(RemoteError::Connectivity("blob storage down".into()))
        }
    }

    let store = Arc::new(NoBlobStore(ChaosRemote::default()));
    let snapshots = Arc::new(SnapshotLog::open(dir.path().join("snap.db")).await.unwrap());
    let schema = Arc::new(SchemaManager::new(store.clone(), "relay_"));
    schema
        .ensure_collections(&BTreeMap::from([("sensor".to_string(), base_columns())]))
        .await
        .unwrap();
    let delivery = Arc::new(DeliveryClient::new(store.clone(), None));
    let reconciler = ReconciliationEngine::new(Arc::clone(&snapshots), delivery, schema, 240, 60);

    snapshots.append(entry("c1", "2026-03-01T10:00:30.000Z"));
    snapshots.flush().await.unwrap();

    let report = reconciler.run_check(ts("2026-03-01T10:04:00.000Z")).await.unwrap();
    assert_eq!(report.resent, 1);
    assert_eq!(store.0.records.lock().len(), 1);
}
