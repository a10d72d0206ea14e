// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record delivery over the configured transport.
//!
//! Two transports exist: the message bus (normal path, fire-and-forget
//! with broker-side fan-in) and the store's REST API (used when no bus
//! is configured, and always used for resends and window queries).
//!
//! Resends replay the exact payload that was originally logged, so a
//! recovered record carries its original `record_date`, not the time of
//! recovery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::record::format_timestamp;
use crate::remote::{Publisher, RemoteError, RemoteRow, RemoteStore};
use crate::snapshot::SnapshotEntry;

/// Audit document uploaded alongside a resend batch.
#[derive(Debug, Serialize)]
struct GapReport<'a> {
    detected_at: String,
    count: usize,
    payloads: Vec<&'a str>,
}

pub struct DeliveryClient {
    store: Arc<dyn RemoteStore>,
    /// Bus transport; absent means records go straight to the store.
    bus: Option<Arc<dyn Publisher>>,
    /// Last published record_date per connector, for status reporting.
    last_publish: DashMap<String, String>,
}

impl DeliveryClient {
    pub fn new(store: Arc<dyn RemoteStore>, bus: Option<Arc<dyn Publisher>>) -> Self {
        Self { store, bus, last_publish: DashMap::new() }
    }

    #[must_use]
    pub fn transport_name(&self) -> &'static str {
        if self.bus.is_some() { "bus" } else { "direct" }
    }

    #[must_use]
    pub fn is_bus_connected(&self) -> bool {
        self.bus.as_ref().map_or(false, |bus| bus.is_connected())
    }

    /// Deliver one freshly built record.
    pub async fn publish(
        &self,
        connector_id: &str,
        collection_id: &str,
        record_date: &str,
        payload: &str,
    ) -> Result<(), RemoteError> {
        let transport = self.transport_name();
        let result = match &self.bus {
            Some(bus) => bus.publish(payload).await,
            None => self.store.insert_record(collection_id, payload).await,
        };
        match &result {
            Ok(()) => {
                metrics::record_publish(transport, "success");
                self.last_publish.insert(connector_id.to_string(), record_date.to_string());
                debug!(connector = connector_id, transport, "Record published");
            }
            Err(e) => {
                metrics::record_publish(transport, "error");
                warn!(connector = connector_id, transport, error = %e, "Publish failed");
            }
        }
        result
    }

    /// Replay logged entries verbatim through the store API.
    ///
    /// Entries that fail stay missing; the next sweep sees the window
    /// again. Returns how many were accepted.
    pub async fn resend(&self, entries: &[SnapshotEntry]) -> usize {
        let mut resent = 0;
        for entry in entries {
            match self.store.insert_record(&entry.collection_id, &entry.payload).await {
                Ok(()) => resent += 1,
                Err(e) => {
                    warn!(
                        connector = %entry.connector_id,
                        record_date = %entry.record_date,
                        error = %e,
                        "Resend failed, record stays missing"
                    );
                }
            }
        }
        if resent > 0 {
            metrics::record_resent(resent);
            info!(resent, of = entries.len(), "Gap records resent");
        }
        resent
    }

    /// Identity rows the remote store holds for `[start, end)` across the
    /// given collections.
    pub async fn query_window(
        &self,
        collection_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        let mut rows = Vec::new();
        for collection_id in collection_ids {
            rows.extend(self.store.query_window(collection_id, start, end).await?);
        }
        Ok(rows)
    }

    /// Upload a gap audit document next to the resent records.
    pub async fn archive_gaps(&self, entries: &[SnapshotEntry]) -> Result<(), RemoteError> {
        let detected_at = format_timestamp(Utc::now());
        let report = GapReport {
            detected_at: detected_at.clone(),
            count: entries.len(),
            payloads: entries.iter().map(|e| e.payload.as_str()).collect(),
        };
        let bytes = serde_json::to_vec(&report)
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let name = format!(
            "gap-report-{}-{}.json",
            detected_at.replace(':', "-"),
            uuid::Uuid::new_v4()
        );
        self.store.upload_blob(&name, bytes).await
    }

    /// Last published record_date for a connector, if any this run.
    #[must_use]
    pub fn last_publish(&self, connector_id: &str) -> Option<String> {
        self.last_publish.get(connector_id).map(|v| v.clone())
    }

    pub fn forget_connector(&self, connector_id: &str) {
        self.last_publish.remove(connector_id);
    }
}
