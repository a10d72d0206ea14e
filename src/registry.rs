//! Connector registry: persisted connector configuration.
//!
//! Connectors are created by an out-of-scope configuration flow and stored
//! as a single JSON document on disk. The registry is loaded once at
//! startup; every mutation rewrites the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::encoding::ParameterKind;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry file is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("connector '{0}' does not exist")]
    NotFound(String),
}

/// A monitored parameter as declared when the connector was configured.
///
/// Kind and subclass are captured from the device registry at creation
/// time, so schema provisioning works from declared metadata and does not
/// depend on the parameter being readable at that moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub parameter_id: String,
    pub kind: ParameterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subclass: Option<String>,
}

/// A configured binding between one source device and a target collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub connector_id: String,
    pub project_id: String,
    pub device_id: String,
    /// Ordered set of monitored parameters.
    pub parameters: Vec<ParameterSpec>,
    pub poll_interval_secs: u64,
    /// Target collection name, derived from the device's model identity at
    /// creation time. Stable for the connector's lifetime; a device model
    /// change requires a new connector.
    pub collection_name: String,
}

/// JSON-file-backed store of configured connectors.
pub struct ConnectorRegistry {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Connector>>,
}

impl ConnectorRegistry {
    /// Load the registry, creating an empty file if none exists.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), connectors = entries.len(), "Connector registry loaded");
        Ok(Self { path, entries: RwLock::new(entries) })
    }

    #[must_use]
    pub fn get(&self, connector_id: &str) -> Option<Connector> {
        self.entries.read().get(connector_id).cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<Connector> {
        self.entries.read().values().cloned().collect()
    }

    #[must_use]
    pub fn list_for_project(&self, project_id: &str) -> Vec<Connector> {
        self.entries
            .read()
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect()
    }

    /// Create a connector entry. Creating an id that already exists returns
    /// the stored entry unchanged.
    pub fn create(&self, connector: Connector) -> Result<Connector, RegistryError> {
        {
            let mut entries = self.entries.write();
            if let Some(existing) = entries.get(&connector.connector_id) {
                return Ok(existing.clone());
            }
            entries.insert(connector.connector_id.clone(), connector.clone());
        }
        self.persist()?;
        Ok(connector)
    }

    /// Update the mutable parts of a connector: monitored parameters and
    /// poll interval. `None` leaves a field as is. Device and collection
    /// bindings are immutable.
    pub fn update(
        &self,
        connector_id: &str,
        parameters: Option<Vec<ParameterSpec>>,
        poll_interval_secs: Option<u64>,
    ) -> Result<Connector, RegistryError> {
        let updated = {
            let mut entries = self.entries.write();
            let entry = entries
                .get_mut(connector_id)
                .ok_or_else(|| RegistryError::NotFound(connector_id.to_string()))?;
            if let Some(parameters) = parameters {
                entry.parameters = parameters;
            }
            if let Some(poll_interval_secs) = poll_interval_secs {
                entry.poll_interval_secs = poll_interval_secs;
            }
            entry.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    pub fn delete(&self, connector_id: &str) -> Result<(), RegistryError> {
        {
            let mut entries = self.entries.write();
            if entries.remove(connector_id).is_none() {
                return Err(RegistryError::NotFound(connector_id.to_string()));
            }
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), RegistryError> {
        let raw = serde_json::to_string_pretty(&*self.entries.read())?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}
