// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delivery gap detection and recovery.
//!
//! The check compares what the snapshot log says was published inside a
//! trailing window against what the remote store actually holds, keyed
//! by (connector id, record date). Records missing remotely are resent
//! from their logged payloads and summarized in an uploaded gap report.
//!
//! The window lags behind "now" so in-flight records are not flagged as
//! gaps. When the remote query itself fails, the window is parked in the
//! snapshot log's failed-check table and the periodic sweep re-verifies
//! parked windows oldest-first, stopping at the first window that still
//! cannot be verified so recovery stays ordered.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::delivery::DeliveryClient;
use crate::metrics;
use crate::schema::SchemaManager;
use crate::snapshot::{SnapshotError, SnapshotLog};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("bad timestamp in failed-check table: {0}")]
    BadTimestamp(String),
}

/// Outcome of one window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    pub local: usize,
    pub gaps: usize,
    pub resent: usize,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub recovered: usize,
    pub remaining: usize,
    pub resent: usize,
}

pub struct ReconciliationEngine {
    snapshots: Arc<SnapshotLog>,
    delivery: Arc<DeliveryClient>,
    schema: Arc<SchemaManager>,
    /// Window start lag behind now.
    start_offset: ChronoDuration,
    /// Window end lag behind now. Must be smaller than `start_offset`.
    end_offset: ChronoDuration,
    /// Check and sweep never run concurrently.
    guard: tokio::sync::Mutex<()>,
}

impl ReconciliationEngine {
    pub fn new(
        snapshots: Arc<SnapshotLog>,
        delivery: Arc<DeliveryClient>,
        schema: Arc<SchemaManager>,
        start_offset_secs: u64,
        end_offset_secs: u64,
    ) -> Self {
        Self {
            snapshots,
            delivery,
            schema,
            start_offset: ChronoDuration::seconds(start_offset_secs as i64),
            end_offset: ChronoDuration::seconds(end_offset_secs as i64),
            guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Check the trailing window ending `end_offset` before `now`.
    ///
    /// A failed remote query parks the window for the sweep; that is a
    /// successful check from the caller's perspective.
    pub async fn run_check(&self, now: DateTime<Utc>) -> Result<CheckReport, ReconcileError> {
        let _guard = self.guard.lock().await;
        let started = Instant::now();
        let (start, end) = (now - self.start_offset, now - self.end_offset);

        let report = match self.check_window(start, end).await? {
            Some(report) => {
                metrics::record_check("success");
                report
            }
            None => {
                // Remote unreachable; remember the window and move on.
                self.snapshots.record_failed_window(start, end).await?;
                metrics::record_check("deferred");
                warn!(
                    start = %start, end = %end,
                    "Remote query failed, window parked for sweep"
                );
                CheckReport { local: 0, gaps: 0, resent: 0 }
            }
        };

        metrics::record_check_duration(started.elapsed());
        Ok(report)
    }

    /// Compare one window. `Ok(None)` means the remote query failed and
    /// the window could not be verified.
    async fn check_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<CheckReport>, ReconcileError> {
        let local = self.snapshots.entries_between(start, end).await?;
        if local.is_empty() {
            // Nothing was published; nothing to verify.
            return Ok(Some(CheckReport { local: 0, gaps: 0, resent: 0 }));
        }

        let collection_ids: Vec<String> = self.schema.collection_ids().into_values().collect();
        let remote = match self.delivery.query_window(&collection_ids, start, end).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, "Window query failed");
                return Ok(None);
            }
        };

        let present: HashSet<(String, String)> = remote
            .into_iter()
            .map(|row| (row.connector_id, row.timestamp))
            .collect();
        let gaps: Vec<(String, String)> = local
            .iter()
            .filter(|key| !present.contains(*key))
            .cloned()
            .collect();

        if gaps.is_empty() {
            return Ok(Some(CheckReport { local: local.len(), gaps: 0, resent: 0 }));
        }

        metrics::record_gaps_detected(gaps.len());
        info!(gaps = gaps.len(), local = local.len(), start = %start, end = %end,
            "Delivery gaps detected");

        let entries = self.snapshots.fetch_payloads(&gaps).await?;
        let resent = self.delivery.resend(&entries).await;
        if let Err(e) = self.delivery.archive_gaps(&entries).await {
            // Audit upload is best effort; the records themselves are resent.
            warn!(error = %e, "Gap report upload failed");
        }

        Ok(Some(CheckReport { local: local.len(), gaps: gaps.len(), resent }))
    }

    /// Re-verify parked windows, oldest first.
    ///
    /// Stops at the first window that still cannot be verified; windows
    /// behind it stay parked so recovery proceeds strictly in order. The
    /// verified span is then cleared in one bounded delete.
    pub async fn run_sweep(&self) -> Result<SweepReport, ReconcileError> {
        let _guard = self.guard.lock().await;

        let windows = self.snapshots.failed_windows().await?;
        if windows.is_empty() {
            return Ok(SweepReport::default());
        }

        let total = windows.len();
        let mut verified: Vec<String> = Vec::new();
        let mut resent = 0;

        for window in &windows {
            let start = parse_ts(&window.window_start)?;
            let end = parse_ts(&window.window_end)?;
            match self.check_window(start, end).await? {
                Some(report) => {
                    resent += report.resent;
                    verified.push(window.window_start.clone());
                }
                None => {
                    debug!(start = %window.window_start, "Window still unverifiable, sweep stops");
                    break;
                }
            }
        }

        if let (Some(first), Some(last)) = (verified.first(), verified.last()) {
            self.snapshots.clear_window_range(first, last).await?;
        }

        let report = SweepReport {
            recovered: verified.len(),
            remaining: total - verified.len(),
            resent,
        };
        metrics::record_sweep(report.recovered, report.remaining);
        if report.recovered > 0 {
            info!(
                recovered = report.recovered,
                remaining = report.remaining,
                resent = report.resent,
                "Sweep recovered parked windows"
            );
        }
        Ok(report)
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, ReconcileError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ReconcileError::BadTimestamp(s.to_string()))
}
