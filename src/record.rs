//! Telemetry record data structures.
//!
//! A [`Record`] is the flat field → scalar mapping that flows from a
//! connector tick to the remote store. Records are built incrementally by a
//! [`CumulativeRecord`]: fields seen in a previous tick but absent from the
//! current one are reset to an explicit null rather than omitted, so every
//! emitted record has a stable shape for the destination schema.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Status marker stamped on a record when no monitored parameter produced
/// data during the tick.
pub const STATUS_UNAVAILABLE: &str = "device unavailable";

/// Status marker stamped on the one-shot snapshot published when a connector
/// task (re)starts, so downstream consumers can detect reconfigurations.
pub const STATUS_RELOADED: &str = "reloaded";

/// Field names stamped on every record regardless of parameter data.
pub const FIELD_CONNECTOR: &str = "connector_id";
pub const FIELD_COLLECTION: &str = "collection_id";
pub const FIELD_TIMESTAMP: &str = "record_date";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_AREA: &str = "area";
pub const FIELD_NAME: &str = "name";
pub const FIELD_PRODUCT: &str = "product_id";

/// A typed scalar value in a record.
///
/// Serializes to a plain JSON scalar (timestamps as RFC 3339 strings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Double(f64),
    /// Pre-formatted by [`format_timestamp`] so the serialized form is
    /// byte-identical to the snapshot log key.
    Timestamp(String),
    Text(String),
    Null,
}

impl FieldValue {
    /// The schema column type this value maps to, or `None` for null.
    #[must_use]
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Bool(_) => Some(FieldType::Bool),
            Self::Double(_) => Some(FieldType::Double),
            Self::Timestamp(_) => Some(FieldType::Timestamp),
            Self::Text(_) => Some(FieldType::String),
            Self::Null => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Column type in a remote collection schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Double,
    String,
    Timestamp,
}

/// One (type, required) column definition in a collection schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub kind: FieldType,
    pub required: bool,
}

impl ColumnDef {
    #[must_use]
    pub fn optional(kind: FieldType) -> Self {
        Self { kind, required: false }
    }

    #[must_use]
    pub fn required(kind: FieldType) -> Self {
        Self { kind, required: true }
    }
}

/// A named set of column definitions, keyed by field name.
pub type SchemaFields = BTreeMap<String, ColumnDef>;

/// Base columns present in every collection, independent of which parameter
/// kinds a connector monitors.
#[must_use]
pub fn base_columns() -> SchemaFields {
    let mut cols = SchemaFields::new();
    cols.insert(FIELD_CONNECTOR.into(), ColumnDef::required(FieldType::String));
    cols.insert(FIELD_COLLECTION.into(), ColumnDef::required(FieldType::String));
    cols.insert(FIELD_TIMESTAMP.into(), ColumnDef::required(FieldType::Timestamp));
    cols.insert(FIELD_STATUS.into(), ColumnDef::optional(FieldType::String));
    cols.insert(FIELD_AREA.into(), ColumnDef::optional(FieldType::String));
    cols.insert(FIELD_NAME.into(), ColumnDef::optional(FieldType::String));
    cols.insert(FIELD_PRODUCT.into(), ColumnDef::optional(FieldType::String));
    cols
}

/// Format a timestamp the way records and the snapshot log store it.
///
/// Millisecond precision, UTC, RFC 3339. The fixed precision keeps
/// lexicographic order equal to chronological order in SQL range scans.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A flat field → value mapping, the unit handed to the delivery client.
///
/// Fields are kept in a `BTreeMap` so serialization is deterministic: the
/// same record always serializes to the same bytes, which the snapshot log
/// round-trip relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self { fields: BTreeMap::new() }
    }

    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    /// Serialize to the canonical JSON payload.
    #[must_use]
    pub fn payload(&self) -> String {
        // BTreeMap keys serialize in order; serde_json on a map of scalars
        // cannot fail.
        serde_json::to_string(&self.fields).unwrap_or_default()
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

/// Cumulative record state carried across a connector's ticks.
///
/// Implements the sparse → dense merge: the field universe only grows, and a
/// field missing from the current tick is emitted as an explicit null.
#[derive(Debug, Default)]
pub struct CumulativeRecord {
    /// Last known value for every field ever produced by this connector.
    fields: BTreeMap<String, FieldValue>,
    /// Fields written during the current tick.
    current: BTreeSet<String>,
}

impl CumulativeRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new tick: forget which fields were present last tick.
    pub fn begin_tick(&mut self) {
        self.current.clear();
    }

    /// Record a field value produced during the current tick.
    pub fn put(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        self.current.insert(name.clone());
        self.fields.insert(name, value);
    }

    /// Number of fields with data in the current tick.
    #[must_use]
    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    /// Close the tick and emit a dense record.
    ///
    /// Fields absent this tick are reset to null (and stay null in the
    /// cumulative state until a later tick writes them again). The status
    /// field is `"device unavailable"` when no field produced data,
    /// otherwise null.
    pub fn finish_tick(&mut self) -> Record {
        let stale: Vec<String> = self
            .fields
            .keys()
            .filter(|name| !self.current.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            self.fields.insert(name, FieldValue::Null);
        }

        let mut record = Record::new();
        for (name, value) in &self.fields {
            record.set(name.clone(), value.clone());
        }
        let status = if self.current.is_empty() {
            FieldValue::Text(STATUS_UNAVAILABLE.to_string())
        } else {
            FieldValue::Null
        };
        record.set(FIELD_STATUS, status);
        record
    }
}
