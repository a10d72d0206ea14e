// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.

//! Remote store and bus transports.

pub mod http;
pub mod mqtt;
pub mod traits;

pub use http::HttpRemoteStore;
pub use mqtt::MqttPublisher;
pub use traits::{CollectionInfo, Publisher, RemoteError, RemoteRow, RemoteStore};
