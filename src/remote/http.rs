//! HTTP implementation of the remote store API.
//!
//! Talks to the store's REST surface with bearer-token auth and bounded
//! timeouts. Connection errors and status errors are mapped to distinct
//! [`RemoteError`] variants so callers can tell "the network is down" from
//! "the store said no".

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::record::{format_timestamp, SchemaFields};
use crate::remote::traits::{CollectionInfo, RemoteError, RemoteRow, RemoteStore};

/// REST client for the remote store's administrative API.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    token: String,
    /// Bucket receiving gap audit blobs.
    bucket_id: String,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct CollectionBody {
    id: String,
    name: String,
    #[serde(default)]
    schema_fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct QueryBody {
    rows: Vec<QueryRow>,
}

#[derive(Deserialize)]
struct QueryRow {
    connector_id: String,
    record_date: String,
}

#[derive(Serialize)]
struct FindRequest<'a> {
    fields: &'a [&'a str],
    filters: serde_json::Value,
    orders: serde_json::Value,
}

impl HttpRemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        token: impl Into<String>,
        bucket_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Connectivity(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            token: token.into(),
            bucket_id: bucket_id.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/rest/project/{}/{}", self.base_url, self.project_id, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .bearer_auth(&self.token)
    }

    /// Execute a request, mapping transport and status errors to the
    /// failure taxonomy and decoding the `data` envelope.
    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RemoteError::Rejected { status: status.as_u16(), message });
        }
        response
            .json::<ApiEnvelope<T>>()
            .await
            .map(|envelope| envelope.data)
            .map_err(|e| RemoteError::Malformed(e.to_string()))
    }

    /// Execute a request where only the status matters.
    async fn send_unit(&self, builder: reqwest::RequestBuilder) -> Result<(), RemoteError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RemoteError::Rejected { status: status.as_u16(), message });
        }
        Ok(())
    }
}

fn map_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        RemoteError::Connectivity(err.to_string())
    } else if err.is_decode() {
        RemoteError::Malformed(err.to_string())
    } else {
        RemoteError::Connectivity(err.to_string())
    }
}

fn to_collection_info(body: CollectionBody) -> CollectionInfo {
    CollectionInfo {
        id: body.id,
        name: body.name,
        field_names: body.schema_fields.keys().cloned().collect::<HashSet<_>>(),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn list_collections(&self, prefix: &str) -> Result<Vec<CollectionInfo>, RemoteError> {
        let bodies: Vec<CollectionBody> =
            self.send(self.request(reqwest::Method::GET, "collections")).await?;
        Ok(bodies
            .into_iter()
            .filter(|c| c.name.starts_with(prefix))
            .map(to_collection_info)
            .collect())
    }

    async fn create_collection(
        &self,
        name: &str,
        fields: &SchemaFields,
    ) -> Result<CollectionInfo, RemoteError> {
        let body = json!({
            "name": name,
            "schema_fields": fields,
            "opt_auth_column_id": false,
        });
        let result: Result<CollectionBody, RemoteError> = self
            .send(self.request(reqwest::Method::POST, "collection").json(&body))
            .await;
        match result {
            Ok(created) => {
                debug!(collection = name, "Collection created");
                Ok(to_collection_info(created))
            }
            // Name conflict means another run already created it.
            Err(RemoteError::Rejected { status: 400 | 409, message })
                if message.contains("exist") =>
            {
                Err(RemoteError::SchemaConflict(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn patch_collection(
        &self,
        collection_id: &str,
        fields: &SchemaFields,
    ) -> Result<(), RemoteError> {
        let body = json!({ "schema_fields": fields });
        self.send_unit(
            self.request(reqwest::Method::PATCH, &format!("collection/{collection_id}"))
                .json(&body),
        )
        .await
    }

    async fn insert_record(&self, collection_id: &str, payload: &str) -> Result<(), RemoteError> {
        let body: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| RemoteError::Malformed(format!("record payload: {e}")))?;
        self.send_unit(
            self.request(
                reqwest::Method::POST,
                &format!("collection/{collection_id}/record"),
            )
            .json(&body),
        )
        .await
    }

    async fn query_window(
        &self,
        collection_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        let request = FindRequest {
            fields: &["connector_id", "record_date"],
            filters: json!([
                { "field": "record_date", "op": ">=", "value": format_timestamp(start) },
                { "field": "record_date", "op": "<", "value": format_timestamp(end) },
            ]),
            orders: json!([{ "field": "record_date", "kind": "asc" }]),
        };
        let body: QueryBody = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("collection/{collection_id}/records"),
                )
                .json(&request),
            )
            .await?;
        Ok(body
            .rows
            .into_iter()
            .map(|row| RemoteRow { connector_id: row.connector_id, timestamp: row.record_date })
            .collect())
    }

    async fn upload_blob(&self, name: &str, bytes: Vec<u8>) -> Result<(), RemoteError> {
        self.send_unit(
            self.request(
                reqwest::Method::POST,
                &format!("bucket/{}/file?file_name={name}", self.bucket_id),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes),
        )
        .await
    }
}
