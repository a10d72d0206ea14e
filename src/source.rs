//! Device state source interface.
//!
//! The engine never talks to devices directly; it reads current parameter
//! values and device metadata through this trait. Lookups are local and
//! non-blocking; the hosting platform keeps its own state cache.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::encoding::ParameterReading;

/// Metadata describing the device behind a connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadata {
    /// Area/room assignment, if any.
    pub area: Option<String>,
    /// Display name (user-assigned name preferred over the default).
    pub name: Option<String>,
    /// Vendor product identifier.
    pub product_id: Option<String>,
    /// Derived display identifier (manufacturer+model or fallback name)
    /// used to name the device's collection.
    pub model_identity: String,
}

/// Read-only view of current device state.
///
/// `value` returns `None` for parameters that are unavailable or unknown;
/// `device` returns `None` when the device has been removed from the
/// platform (the connector task treats that tick as a no-op).
pub trait DeviceStateSource: Send + Sync {
    fn value(&self, parameter_id: &str) -> Option<ParameterReading>;
    fn device(&self, device_id: &str) -> Option<DeviceMetadata>;
}

/// In-memory state source for embedding and tests.
#[derive(Default)]
pub struct MemoryStateSource {
    values: RwLock<HashMap<String, ParameterReading>>,
    devices: RwLock<HashMap<String, DeviceMetadata>>,
}

impl MemoryStateSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&self, reading: ParameterReading) {
        self.values.write().insert(reading.parameter_id.clone(), reading);
    }

    /// Mark a parameter unavailable.
    pub fn clear_value(&self, parameter_id: &str) {
        self.values.write().remove(parameter_id);
    }

    pub fn set_device(&self, device_id: impl Into<String>, metadata: DeviceMetadata) {
        self.devices.write().insert(device_id.into(), metadata);
    }

    pub fn remove_device(&self, device_id: &str) {
        self.devices.write().remove(device_id);
    }
}

impl DeviceStateSource for MemoryStateSource {
    fn value(&self, parameter_id: &str) -> Option<ParameterReading> {
        self.values.read().get(parameter_id).cloned()
    }

    fn device(&self, device_id: &str) -> Option<DeviceMetadata> {
        self.devices.read().get(device_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{ParameterKind, StateValue};

    fn metadata(model: &str) -> DeviceMetadata {
        DeviceMetadata {
            area: Some("kitchen".into()),
            name: Some("Plug".into()),
            product_id: Some("plug-01".into()),
            model_identity: model.into(),
        }
    }

    #[test]
    fn test_memory_source_round_trip() {
        let source = MemoryStateSource::new();
        source.set_device("dev-1", metadata("acme_smartplug"));
        source.set_value(ParameterReading {
            parameter_id: "dev-1.power".into(),
            kind: ParameterKind::Numeric,
            subclass: Some("power".into()),
            value: StateValue::Number(12.0),
        });

        assert!(source.device("dev-1").is_some());
        assert!(source.value("dev-1.power").is_some());
        assert!(source.value("dev-1.voltage").is_none());

        source.clear_value("dev-1.power");
        assert!(source.value("dev-1.power").is_none());

        source.remove_device("dev-1");
        assert!(source.device("dev-1").is_none());
    }
}
