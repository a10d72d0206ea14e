//! Per-kind parameter encoding registry.
//!
//! Maps `(parameter kind, device subclass)` to one or more typed record
//! fields, and derives the schema columns a set of monitored parameters
//! requires. The mapping is a registry rather than a hard-coded dispatcher
//! so deployments can register encoders for new kinds without touching the
//! connector task.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{ColumnDef, FieldType, FieldValue, SchemaFields};

/// The domain of a monitored parameter, as reported by the device state
/// source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// On/off style parameter (one boolean field).
    Binary,
    /// Measurement parameter (one double field).
    Numeric,
    /// Free-form text parameter.
    Text,
    /// Parameter constrained to a fixed option set.
    Enumeration,
    /// Point-in-time parameter.
    Timestamp,
}

/// Raw value read from the device state source.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// One available reading of a monitored parameter.
#[derive(Debug, Clone)]
pub struct ParameterReading {
    pub parameter_id: String,
    pub kind: ParameterKind,
    /// Device subclass refining the kind (e.g. `power`, `door`, `motion`).
    /// `None` when the device does not classify the parameter.
    pub subclass: Option<String>,
    pub value: StateValue,
}

/// Encoder function: reading → typed record fields.
pub type Encoder = Box<dyn Fn(&ParameterReading) -> Vec<(String, FieldValue)> + Send + Sync>;

struct EncoderEntry {
    /// Columns this encoder can emit, for schema provisioning.
    columns: SchemaFields,
    encode: Encoder,
}

/// Registry mapping parameter kinds (optionally refined by subclass) to
/// encoders.
///
/// Built-in encodings cover the five kinds plus a few composite device
/// classes whose single reading carries two facts; `register` overrides or
/// extends them for a specific `(kind, subclass)` pair.
pub struct EncoderRegistry {
    overrides: HashMap<(ParameterKind, String), EncoderEntry>,
}

impl EncoderRegistry {
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self { overrides: HashMap::new() };
        registry.register(
            ParameterKind::Numeric,
            "brightness",
            SchemaFields::from([
                ("brightness".to_string(), ColumnDef::optional(FieldType::Double)),
                ("binary__light".to_string(), ColumnDef::optional(FieldType::Bool)),
            ]),
            Box::new(|reading| match reading.value {
                StateValue::Number(level) => vec![
                    ("brightness".to_string(), FieldValue::Double(level)),
                    ("binary__light".to_string(), FieldValue::Bool(level > 0.0)),
                ],
                _ => Vec::new(),
            }),
        );
        registry.register(
            ParameterKind::Numeric,
            "position",
            SchemaFields::from([
                ("position".to_string(), ColumnDef::optional(FieldType::Double)),
                ("binary__open".to_string(), ColumnDef::optional(FieldType::Bool)),
            ]),
            Box::new(|reading| match reading.value {
                StateValue::Number(position) => vec![
                    ("position".to_string(), FieldValue::Double(position)),
                    ("binary__open".to_string(), FieldValue::Bool(position > 0.0)),
                ],
                _ => Vec::new(),
            }),
        );
        registry.register(
            ParameterKind::Enumeration,
            "hvac_action",
            SchemaFields::from([
                ("hvac_action".to_string(), ColumnDef::optional(FieldType::String)),
                ("binary__hvac_active".to_string(), ColumnDef::optional(FieldType::Bool)),
            ]),
            Box::new(|reading| match &reading.value {
                StateValue::Text(action) => vec![
                    ("hvac_action".to_string(), FieldValue::Text(action.clone())),
                    (
                        "binary__hvac_active".to_string(),
                        FieldValue::Bool(action != "idle" && action != "off"),
                    ),
                ],
                _ => Vec::new(),
            }),
        );
        registry
    }

    /// Register a custom encoder for a `(kind, subclass)` pair.
    ///
    /// `columns` declares every field the encoder can emit so schema
    /// provisioning covers them.
    pub fn register(
        &mut self,
        kind: ParameterKind,
        subclass: impl Into<String>,
        columns: SchemaFields,
        encoder: Encoder,
    ) {
        self.overrides
            .insert((kind, subclass.into()), EncoderEntry { columns, encode: encoder });
    }

    /// Encode a reading into record fields.
    ///
    /// Returns an empty vec when the raw value does not fit the declared
    /// kind (e.g. a text value on a numeric parameter); the tick treats
    /// that the same as an unavailable parameter.
    #[must_use]
    pub fn encode(&self, reading: &ParameterReading) -> Vec<(String, FieldValue)> {
        if let Some(sub) = &reading.subclass {
            if let Some(entry) = self.overrides.get(&(reading.kind, sub.clone())) {
                return (entry.encode)(reading);
            }
        }
        default_encode(reading)
    }

    /// Schema columns required by a parameter kind with the given
    /// subclasses. One call per kind a connector monitors; union across
    /// kinds yields the connector's full schema.
    #[must_use]
    pub fn columns(&self, kind: ParameterKind, subclasses: &[Option<String>]) -> SchemaFields {
        let mut fields = SchemaFields::new();
        for sub in subclasses {
            if let Some(sub_name) = sub {
                if let Some(entry) = self.overrides.get(&(kind, sub_name.clone())) {
                    fields.extend(entry.columns.clone());
                    continue;
                }
            }
            let name = field_name(kind, sub.as_deref());
            fields.insert(name, ColumnDef::optional(column_type(kind)));
        }
        fields
    }
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Field name for a `(kind, subclass)` pair.
///
/// Binary parameters are namespaced (`binary__door`) because the boolean
/// alone carries no meaning; other kinds use the subclass directly as the
/// measurement name, falling back to a kind-level name when the device
/// reports no subclass.
fn field_name(kind: ParameterKind, subclass: Option<&str>) -> String {
    match (kind, subclass) {
        (ParameterKind::Binary, Some(sub)) => format!("binary__{sub}"),
        (ParameterKind::Binary, None) => "binary".to_string(),
        (_, Some(sub)) => sub.to_string(),
        (ParameterKind::Numeric, None) => "value_numeric".to_string(),
        (ParameterKind::Text, None) => "text".to_string(),
        (ParameterKind::Enumeration, None) => "mode".to_string(),
        (ParameterKind::Timestamp, None) => "value_datetime".to_string(),
    }
}

fn column_type(kind: ParameterKind) -> FieldType {
    match kind {
        ParameterKind::Binary => FieldType::Bool,
        ParameterKind::Numeric => FieldType::Double,
        ParameterKind::Text | ParameterKind::Enumeration => FieldType::String,
        ParameterKind::Timestamp => FieldType::Timestamp,
    }
}

fn default_encode(reading: &ParameterReading) -> Vec<(String, FieldValue)> {
    let name = field_name(reading.kind, reading.subclass.as_deref());
    let value = match (reading.kind, &reading.value) {
        (ParameterKind::Binary, StateValue::Bool(b)) => FieldValue::Bool(*b),
        (ParameterKind::Numeric, StateValue::Number(n)) => FieldValue::Double(*n),
        (ParameterKind::Text | ParameterKind::Enumeration, StateValue::Text(s)) => {
            FieldValue::Text(s.clone())
        }
        (ParameterKind::Timestamp, StateValue::Timestamp(ts)) => {
            FieldValue::Timestamp(crate::record::format_timestamp(*ts))
        }
        // Value does not fit the declared kind; skip rather than guess.
        _ => return Vec::new(),
    };
    vec![(name, value)]
}
