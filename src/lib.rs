//! # Telemetry Relay
//!
//! A reliable delivery and reconciliation engine for device telemetry.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Connector Tasks                         │
//! │  • One tokio task per configured connector                 │
//! │  • Polls device state, merges into a cumulative record    │
//! │  • Absent fields become explicit nulls (dense records)    │
//! └─────────────────────────────────────────────────────────────┘
//!               │                             │
//!        (append, always)            (publish, fire-and-forget)
//!               ▼                             ▼
//! ┌──────────────────────────┐  ┌──────────────────────────────┐
//! │   Snapshot Log (SQLite)  │  │   Delivery Transport         │
//! │  • Local source of truth │  │  • MQTT bus, or store REST  │
//! │  • Buffered batch flush  │  │  • Failures → retry queue   │
//! │  • 7-day retention       │  │                              │
//! └──────────────────────────┘  └──────────────────────────────┘
//!               │                             │
//!               └──────────┬──────────────────┘
//!                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Reconciliation Engine                       │
//! │  • Compares log vs remote store over a trailing window     │
//! │  • Resends missing records with original timestamps        │
//! │  • Parks unverifiable windows, sweeps them oldest-first    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use telemetry_relay::{RelayEngine, EngineConfig};
//! use telemetry_relay::encoding::{EncoderRegistry, ParameterKind};
//! use telemetry_relay::registry::{Connector, ConnectorRegistry, ParameterSpec};
//! use telemetry_relay::source::MemoryStateSource;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig {
//!         base_url: "https://store.example".into(),
//!         project_id: "proj-1".into(),
//!         token: "secret".into(),
//!         mqtt_host: Some("broker.example".into()),
//!         ..Default::default()
//!     };
//!
//!     let registry = Arc::new(ConnectorRegistry::load("connectors.json").unwrap());
//!     let source = Arc::new(MemoryStateSource::new());
//!     let encoders = Arc::new(EncoderRegistry::new());
//!
//!     let mut engine = RelayEngine::new(config, registry, source, encoders);
//!     engine.start().await.expect("Failed to start");
//!
//!     engine.add_connector(Connector {
//!         connector_id: "living-room-thermostat".into(),
//!         project_id: "proj-1".into(),
//!         device_id: "dev-42".into(),
//!         parameters: vec![ParameterSpec {
//!             parameter_id: "dev-42.temperature".into(),
//!             kind: ParameterKind::Numeric,
//!             subclass: Some("temperature".into()),
//!         }],
//!         poll_interval_secs: 30,
//!         collection_name: "acme thermostat v2".into(),
//!     }).await.expect("Failed to add connector");
//!
//!     engine.run().await.expect("Run loop exited");
//! }
//! ```
//!
//! ## Features
//!
//! - **Durable local log**: every record is retained in SQLite before the
//!   transport sees it
//! - **Gap detection**: trailing-window comparison against the remote store
//! - **Ordered recovery**: unverifiable windows are swept oldest-first
//! - **Verbatim resends**: recovered records keep their original timestamps
//! - **Additive schema evolution**: collections grow fields, never lose them
//! - **Retry policies**: configurable backoff for startup, publish, daemon use
//!
//! ## Configuration
//!
//! See [`EngineConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The main [`RelayEngine`] orchestrating all components
//! - [`record`]: Dense record building and the cumulative field merge
//! - [`encoding`]: Parameter readings to record fields
//! - [`source`]: Device state access trait
//! - [`registry`]: Persistent connector configuration
//! - [`snapshot`]: The local SQLite snapshot log
//! - [`delivery`]: Transport selection, resends, gap reports
//! - [`schema`]: Remote collection provisioning
//! - [`reconcile`]: Gap detection and the failed-window sweep
//! - [`remote`]: Store REST client and MQTT publisher

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod delivery;
pub mod encoding;
pub mod metrics;
pub mod reconcile;
pub mod record;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod schema;
pub mod snapshot;
pub mod source;

pub use config::EngineConfig;
pub use connector::{ConnectorHandle, PendingPublish, RetryQueue};
pub use coordinator::{ConnectorStatus, EngineError, EngineState, EngineStatus, RelayEngine};
pub use delivery::DeliveryClient;
pub use encoding::{EncoderRegistry, ParameterKind, ParameterReading, StateValue};
pub use reconcile::{CheckReport, ReconciliationEngine, SweepReport};
pub use record::{CumulativeRecord, FieldType, FieldValue, Record, SchemaFields};
pub use registry::{Connector, ConnectorRegistry, ParameterSpec, RegistryError};
pub use remote::{CollectionInfo, Publisher, RemoteError, RemoteRow, RemoteStore};
pub use retry::RetryConfig;
pub use schema::SchemaManager;
pub use snapshot::{FailedCheckWindow, SnapshotEntry, SnapshotError, SnapshotLog};
pub use source::{DeviceMetadata, DeviceStateSource, MemoryStateSource};
