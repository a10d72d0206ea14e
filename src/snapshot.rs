// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable snapshot log backed by SQLite.
//!
//! Every published record is appended here before (or concurrently with)
//! delivery, so the reconciliation engine always has a local source of
//! truth to compare against the remote store. Two tables:
//!
//! ```sql
//! CREATE TABLE snapshots (
//!   id INTEGER PRIMARY KEY,
//!   connector_id TEXT NOT NULL,
//!   collection_id TEXT NOT NULL,
//!   record_date TEXT NOT NULL,   -- RFC 3339 UTC millis, lexicographic == chronological
//!   payload TEXT NOT NULL        -- exact serialized record as published
//! )
//!
//! CREATE TABLE failed_checks (
//!   id INTEGER PRIMARY KEY,
//!   window_start TEXT NOT NULL,
//!   window_end TEXT NOT NULL,
//!   recorded_at TEXT NOT NULL
//! )
//! ```
//!
//! Appends are buffered in memory and flushed in batches; a flush is
//! all-or-nothing, and on failure the batch goes back to the front of
//! the buffer so nothing is silently dropped.

use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::format_timestamp;
use crate::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for SnapshotError {
    fn from(e: sqlx::Error) -> Self {
        SnapshotError::Backend(e.to_string())
    }
}

/// One published record as retained locally.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub connector_id: String,
    pub collection_id: String,
    /// RFC 3339 UTC with millisecond precision.
    pub record_date: String,
    /// Exact serialized record as it went over the wire.
    pub payload: String,
}

/// A reconciliation window that could not be verified because the
/// remote query failed. Re-checked by the sweep, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedCheckWindow {
    pub id: i64,
    pub window_start: String,
    pub window_end: String,
    pub recorded_at: String,
}

pub struct SnapshotLog {
    pool: AnyPool,
    path: String,
    /// Entries accepted by `append` but not yet flushed to disk.
    buffer: parking_lot::Mutex<Vec<SnapshotEntry>>,
    /// Serializes flushes so two timers can't interleave batches.
    flush_lock: tokio::sync::Mutex<()>,
}

impl SnapshotLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        install_drivers();

        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);

        info!(path = %path_str, "Opening snapshot log");

        let pool = retry("snapshot_open", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await
                .map_err(|e| SnapshotError::Backend(e.to_string()))
        })
        .await?;

        let log = Self {
            pool,
            path: path_str,
            buffer: parking_lot::Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
        };
        log.enable_wal_mode().await?;
        log.init_schema().await?;

        let retained = log.count_snapshots().await.unwrap_or(0);
        if retained > 0 {
            debug!(retained, "Snapshot log has entries from previous run");
        }

        Ok(log)
    }

    async fn enable_wal_mode(&self) -> Result<(), SnapshotError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| SnapshotError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| SnapshotError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), SnapshotError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                connector_id TEXT NOT NULL,
                collection_id TEXT NOT NULL,
                record_date TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_date ON snapshots (record_date)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failed_checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Accept an entry into the in-memory buffer. Never blocks on I/O.
    pub fn append(&self, entry: SnapshotEntry) {
        self.buffer.lock().push(entry);
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Flush the buffer to disk in one transaction.
    ///
    /// On failure the batch is put back at the front of the buffer, ahead
    /// of anything appended while the flush was in flight, so disk order
    /// stays append order.
    pub async fn flush(&self) -> Result<usize, SnapshotError> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<SnapshotEntry> = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        let flushed = batch.len();
        match self.write_batch(&batch).await {
            Ok(()) => {
                debug!(flushed, "Snapshot batch flushed");
                Ok(flushed)
            }
            Err(e) => {
                warn!(error = %e, size = flushed, "Snapshot flush failed, batch requeued");
                let mut buffer = self.buffer.lock();
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);
                Err(e)
            }
        }
    }

    async fn write_batch(&self, batch: &[SnapshotEntry]) -> Result<(), SnapshotError> {
        let mut tx = self.pool.begin().await?;
        for entry in batch {
            sqlx::query(
                "INSERT INTO snapshots (connector_id, collection_id, record_date, payload) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(&entry.connector_id)
            .bind(&entry.collection_id)
            .bind(&entry.record_date)
            .bind(&entry.payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Identity keys of entries with `start <= record_date < end`.
    pub async fn entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>, SnapshotError> {
        let rows = sqlx::query(
            "SELECT connector_id, record_date FROM snapshots \
             WHERE record_date >= $1 AND record_date < $2 \
             ORDER BY record_date ASC",
        )
        .bind(format_timestamp(start))
        .bind(format_timestamp(end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("connector_id")?,
                    row.try_get::<String, _>("record_date")?,
                ))
            })
            .collect()
    }

    /// Full entries for the given (connector_id, record_date) keys, in the
    /// order the keys were given. Missing keys are skipped.
    pub async fn fetch_payloads(
        &self,
        keys: &[(String, String)],
    ) -> Result<Vec<SnapshotEntry>, SnapshotError> {
        let mut entries = Vec::with_capacity(keys.len());
        for (connector_id, record_date) in keys {
            let row = sqlx::query(
                "SELECT connector_id, collection_id, record_date, payload FROM snapshots \
                 WHERE connector_id = $1 AND record_date = $2 LIMIT 1",
            )
            .bind(connector_id)
            .bind(record_date)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                entries.push(SnapshotEntry {
                    connector_id: row.try_get("connector_id")?,
                    collection_id: row.try_get("collection_id")?,
                    record_date: row.try_get("record_date")?,
                    payload: row.try_get("payload")?,
                });
            }
        }
        Ok(entries)
    }

    /// Remember a window whose remote query failed so the sweep retries it.
    pub async fn record_failed_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), SnapshotError> {
        sqlx::query(
            "INSERT INTO failed_checks (window_start, window_end, recorded_at) \
             VALUES ($1, $2, $3)",
        )
        .bind(format_timestamp(start))
        .bind(format_timestamp(end))
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All unverified windows, oldest window first.
    pub async fn failed_windows(&self) -> Result<Vec<FailedCheckWindow>, SnapshotError> {
        let rows = sqlx::query(
            "SELECT id, window_start, window_end, recorded_at FROM failed_checks \
             ORDER BY window_start ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(FailedCheckWindow {
                    id: row.try_get("id")?,
                    window_start: row.try_get("window_start")?,
                    window_end: row.try_get("window_end")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    pub async fn delete_failed_window(&self, id: i64) -> Result<(), SnapshotError> {
        sqlx::query("DELETE FROM failed_checks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop failed-check rows whose window start falls inside
    /// `[from, to]`. Used after a sweep verifies a contiguous span.
    pub async fn clear_window_range(&self, from: &str, to: &str) -> Result<u64, SnapshotError> {
        let result = sqlx::query(
            "DELETE FROM failed_checks WHERE window_start >= $1 AND window_start <= $2",
        )
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Retention: drop snapshot rows older than the cutoff.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, SnapshotError> {
        let result = sqlx::query("DELETE FROM snapshots WHERE record_date < $1")
            .bind(format_timestamp(cutoff))
            .execute(&self.pool)
            .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            info!(purged, cutoff = %format_timestamp(cutoff), "Purged expired snapshots");
            // Reclaim file space after a large delete
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await?;
        }
        Ok(purged)
    }

    pub async fn count_snapshots(&self) -> Result<u64, SnapshotError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM snapshots")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn entry(connector: &str, date: &str) -> SnapshotEntry {
        SnapshotEntry {
            connector_id: connector.to_string(),
            collection_id: "col-1".to_string(),
            record_date: date.to_string(),
            payload: format!(r#"{{"connector_id":"{connector}","record_date":"{date}"}}"#),
        }
    }

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[tokio::test]
    async fn test_append_flush_and_query() {
        let dir = tempdir().unwrap();
        let log = SnapshotLog::open(dir.path().join("snap.db")).await.unwrap();

        log.append(entry("c1", "2026-03-01T10:00:00.000Z"));
        log.append(entry("c2", "2026-03-01T10:01:00.000Z"));
        log.append(entry("c1", "2026-03-01T10:05:00.000Z"));
        assert_eq!(log.buffered(), 3);

        assert_eq!(log.flush().await.unwrap(), 3);
        assert_eq!(log.buffered(), 0);

        let keys = log.entries_between(ts(10, 0, 0), ts(10, 2, 0)).await.unwrap();
        assert_eq!(
            keys,
            vec![
                ("c1".to_string(), "2026-03-01T10:00:00.000Z".to_string()),
                ("c2".to_string(), "2026-03-01T10:01:00.000Z".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let dir = tempdir().unwrap();
        let log = SnapshotLog::open(dir.path().join("snap.db")).await.unwrap();
        assert_eq!(log.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_payloads_preserves_key_order() {
        let dir = tempdir().unwrap();
        let log = SnapshotLog::open(dir.path().join("snap.db")).await.unwrap();

        log.append(entry("c1", "2026-03-01T10:00:00.000Z"));
        log.append(entry("c2", "2026-03-01T10:00:30.000Z"));
        log.flush().await.unwrap();

        let keys = vec![
            ("c2".to_string(), "2026-03-01T10:00:30.000Z".to_string()),
            ("c1".to_string(), "2026-03-01T10:00:00.000Z".to_string()),
            ("c3".to_string(), "2026-03-01T10:00:00.000Z".to_string()),
        ];
        let entries = log.fetch_payloads(&keys).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].connector_id, "c2");
        assert_eq!(entries[1].connector_id, "c1");
        assert!(entries[1].payload.contains("\"c1\""));
    }

    #[tokio::test]
    async fn test_failed_windows_oldest_first() {
        let dir = tempdir().unwrap();
        let log = SnapshotLog::open(dir.path().join("snap.db")).await.unwrap();

        // Recorded out of chronological order
        log.record_failed_window(ts(12, 0, 0), ts(12, 3, 0)).await.unwrap();
        log.record_failed_window(ts(11, 0, 0), ts(11, 3, 0)).await.unwrap();
        log.record_failed_window(ts(13, 0, 0), ts(13, 3, 0)).await.unwrap();

        let windows = log.failed_windows().await.unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].window_start, "2026-03-01T11:00:00.000Z");
        assert_eq!(windows[1].window_start, "2026-03-01T12:00:00.000Z");
        assert_eq!(windows[2].window_start, "2026-03-01T13:00:00.000Z");
    }

    #[tokio::test]
    async fn test_clear_window_range_bounded() {
        let dir = tempdir().unwrap();
        let log = SnapshotLog::open(dir.path().join("snap.db")).await.unwrap();

        log.record_failed_window(ts(10, 0, 0), ts(10, 3, 0)).await.unwrap();
        log.record_failed_window(ts(11, 0, 0), ts(11, 3, 0)).await.unwrap();
        log.record_failed_window(ts(12, 0, 0), ts(12, 3, 0)).await.unwrap();

        let cleared = log
            .clear_window_range("2026-03-01T10:00:00.000Z", "2026-03-01T11:00:00.000Z")
            .await
            .unwrap();
        assert_eq!(cleared, 2);

        let remaining = log.failed_windows().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].window_start, "2026-03-01T12:00:00.000Z");
    }

    #[tokio::test]
    async fn test_purge_older_than() {
        let dir = tempdir().unwrap();
        let log = SnapshotLog::open(dir.path().join("snap.db")).await.unwrap();

        log.append(entry("c1", "2026-02-20T10:00:00.000Z"));
        log.append(entry("c1", "2026-03-01T10:00:00.000Z"));
        log.flush().await.unwrap();

        let purged = log.purge_older_than(ts(0, 0, 0)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(log.count_snapshots().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.db");

        {
            let log = SnapshotLog::open(&path).await.unwrap();
            log.append(entry("c1", "2026-03-01T10:00:00.000Z"));
            log.flush().await.unwrap();
        }
        {
            let log = SnapshotLog::open(&path).await.unwrap();
            assert_eq!(log.count_snapshots().await.unwrap(), 1);
        }
    }
}
