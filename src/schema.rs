// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote collection provisioning.
//!
//! Before any records flow, every collection a connector publishes into
//! must exist remotely with at least the fields the connector can emit.
//! Schema evolution is additive only: fields are never removed or
//! retyped, because historical records still reference them.
//!
//! Provisioning outcome is signalled through a [`tokio::sync::Notify`];
//! publishers call [`SchemaManager::wait_ready`] instead of polling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::record::SchemaFields;
use crate::remote::{CollectionInfo, RemoteError, RemoteStore};

pub struct SchemaManager {
    store: Arc<dyn RemoteStore>,
    /// Collection name prefix, keeps relay-owned collections apart from
    /// anything else in the project.
    prefix: String,
    /// Provisioned collections keyed by logical model name.
    collections: parking_lot::RwLock<HashMap<String, CollectionInfo>>,
    ready: Notify,
    is_ready: AtomicBool,
}

impl SchemaManager {
    pub fn new(store: Arc<dyn RemoteStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            collections: parking_lot::RwLock::new(HashMap::new()),
            ready: Notify::new(),
            is_ready: AtomicBool::new(false),
        }
    }

    fn collection_name(&self, model: &str) -> String {
        format!("{}{}", self.prefix, model)
    }

    /// Provision every desired collection: create missing ones, patch
    /// existing ones whose field set has grown.
    ///
    /// Aborts on the first connectivity failure so the caller can retry
    /// the whole pass. A create that loses a race to a concurrent run is
    /// treated as success and resolved by re-listing.
    pub async fn ensure_collections(
        &self,
        desired: &BTreeMap<String, SchemaFields>,
    ) -> Result<(), RemoteError> {
        let existing = self.store.list_collections(&self.prefix).await?;
        let mut by_name: HashMap<String, CollectionInfo> =
            existing.into_iter().map(|c| (c.name.clone(), c)).collect();

        for (model, fields) in desired {
            let name = self.collection_name(model);
            let info = match by_name.remove(&name) {
                Some(mut info) => {
                    let missing: SchemaFields = fields
                        .iter()
                        .filter(|(field, _)| !info.field_names.contains(*field))
                        .map(|(field, def)| (field.clone(), def.clone()))
                        .collect();
                    if !missing.is_empty() {
                        // Patch with the full desired set; the store keeps
                        // columns it already has, so this is additive.
                        let mut merged = fields.clone();
                        for field in &info.field_names {
                            merged.entry(field.clone()).or_insert_with(|| {
                                crate::record::ColumnDef::optional(
                                    crate::record::FieldType::String,
                                )
                            });
                        }
                        info!(
                            collection = %name,
                            added = missing.len(),
                            "Extending collection schema"
                        );
                        self.store.patch_collection(&info.id, &merged).await?;
                        info.field_names.extend(missing.into_keys());
                    }
                    info
                }
                None => match self.store.create_collection(&name, fields).await {
                    Ok(info) => info,
                    Err(RemoteError::SchemaConflict(_)) => {
                        // Another run created it between list and create.
                        debug!(collection = %name, "Collection already exists, re-listing");
                        self.store
                            .list_collections(&self.prefix)
                            .await?
                            .into_iter()
                            .find(|c| c.name == name)
                            .ok_or_else(|| {
                                RemoteError::Malformed(format!(
                                    "collection {name} reported as existing but not listed"
                                ))
                            })?
                    }
                    Err(e) => return Err(e),
                },
            };
            self.collections.write().insert(model.clone(), info);
            self.ready.notify_waiters();
        }

        self.is_ready.store(true, Ordering::Release);
        info!(collections = desired.len(), "Schema provisioning complete");
        Ok(())
    }

    /// Remote collection id for a model, if provisioned. Never blocks.
    #[must_use]
    pub fn collection_id(&self, model: &str) -> Option<String> {
        self.collections.read().get(model).map(|c| c.id.clone())
    }

    /// All provisioned (model, collection id) pairs.
    #[must_use]
    pub fn collection_ids(&self) -> HashMap<String, String> {
        self.collections
            .read()
            .iter()
            .map(|(model, info)| (model.clone(), info.id.clone()))
            .collect()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Acquire)
    }

    /// Wait until the collection for `model` is provisioned and return its
    /// remote id.
    ///
    /// Readiness is per collection: a waiter on a model provisioned by a
    /// later `ensure_collections` pass still wakes. A notified waiter
    /// re-checks the map, and a timed fallback guards against registering
    /// after the notification fired.
    pub async fn wait_ready(&self, model: &str) -> String {
        loop {
            let notified = self.ready.notified();
            if let Some(id) = self.collection_id(model) {
                return id;
            }
            if tokio::time::timeout(Duration::from_secs(5), notified).await.is_err() {
                warn!(collection = model, "Still waiting for schema provisioning");
            }
        }
    }
}
