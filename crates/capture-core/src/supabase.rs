//! Supabase REST adapters for object storage and the session table
//!
//! Both adapters authenticate with the service role key, sent as `apikey`
//! and as a bearer token.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::metadata::{MetadataStore, SessionCompletion, SessionRecord};
use crate::storage::{ObjectStore, StoredObject, UploadResult};
use crate::{Error, Result};

/// Objects returned per list call
const LIST_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
struct RestClient {
    client: Client,
    base_url: String,
    service_key: String,
}

impl RestClient {
    fn new(config: &StorageConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(Error::InvalidConfig("storage.url (SUPABASE_URL) is not set".to_string()));
        }
        if config.service_key.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "storage.service_key (SUPABASE_SERVICE_ROLE_KEY) is not set".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim().trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }
}

/// Read the body of a non-2xx response into an error message
async fn failure_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    format!("HTTP {}: {}", status, body.trim())
}

/// Supabase Storage bucket
#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    rest: RestClient,
    bucket: String,
}

impl SupabaseStorage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Ok(Self {
            rest: RestClient::new(config)?,
            bucket: config.bucket.clone(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.rest.base_url, self.bucket, key)
    }

    fn bucket_url(&self) -> String {
        format!("{}/storage/v1/object/{}", self.rest.base_url, self.bucket)
    }

    fn list_url(&self) -> String {
        format!("{}/storage/v1/object/list/{}", self.rest.base_url, self.bucket)
    }
}

/// Path within the bucket from an upload response.
///
/// Depending on the server version the body carries `path`, or `Key` with
/// the bucket name prepended; anything else falls back to the requested key.
pub fn normalize_upload_key(body: &Value, bucket: &str, requested: &str) -> String {
    if let Some(path) = body.get("path").and_then(Value::as_str).filter(|p| !p.is_empty()) {
        return path.to_string();
    }
    if let Some(key) = body.get("Key").and_then(Value::as_str).filter(|k| !k.is_empty()) {
        let prefix = format!("{}/", bucket);
        return key.strip_prefix(&prefix).unwrap_or(key).to_string();
    }
    requested.to_string()
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<UploadResult> {
        let size = body.len() as u64;
        let response = self
            .rest
            .authorize(self.rest.client.post(self.object_url(key)))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::StorageError(failure_message(response).await));
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let normalized = normalize_upload_key(&body, &self.bucket, key);
        info!(bucket = %self.bucket, key = %normalized, size, content_type, "Object uploaded");

        Ok(UploadResult {
            key: normalized,
            bucket: self.bucket.clone(),
            size,
            content_type: content_type.to_string(),
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let response = self
            .rest
            .authorize(self.rest.client.delete(self.bucket_url()))
            .json(&json!({ "prefixes": [key] }))
            .send()
            .await?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(bucket = %self.bucket, key, "Object removed");
            Ok(())
        } else {
            Err(Error::StorageError(failure_message(response).await))
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let response = self
            .rest
            .authorize(self.rest.client.post(self.list_url()))
            .json(&json!({ "prefix": prefix, "limit": LIST_LIMIT, "offset": 0 }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::StorageError(failure_message(response).await));
        }

        let listed: Vec<ListedObject> = response.json().await?;
        Ok(listed
            .into_iter()
            .map(|object| StoredObject {
                size: object
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("size"))
                    .and_then(Value::as_u64),
                name: object.name,
                updated_at: object.updated_at,
            })
            .collect())
    }
}

/// Session table accessed through PostgREST
#[derive(Debug, Clone)]
pub struct SupabaseMetadata {
    rest: RestClient,
    table: String,
}

impl SupabaseMetadata {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Ok(Self {
            rest: RestClient::new(config)?,
            table: config.metadata_table.clone(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.rest.base_url, self.table)
    }
}

#[async_trait]
impl MetadataStore for SupabaseMetadata {
    async fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        let response = self
            .rest
            .authorize(self.rest.client.post(self.table_url()))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(record)
            .send()
            .await
            .map_err(|e| Error::MetadataError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::MetadataError(failure_message(response).await))
        }
    }

    async fn complete_session(&self, session_id: &str, completion: &SessionCompletion) -> Result<()> {
        let filter = format!("eq.{}", session_id);
        let response = self
            .rest
            .authorize(self.rest.client.patch(self.table_url()))
            .query(&[("id", filter.as_str())])
            .header("Prefer", "return=minimal")
            .json(completion)
            .send()
            .await
            .map_err(|e| Error::MetadataError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::MetadataError(failure_message(response).await))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StorageConfig {
        StorageConfig {
            url: "https://db.example.org/".to_string(),
            service_key: "service".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_url_and_key() {
        let err = SupabaseStorage::new(&StorageConfig::default()).unwrap_err();
        assert!(err.is_config_error());

        let mut cfg = config();
        cfg.service_key = String::new();
        assert!(SupabaseMetadata::new(&cfg).unwrap_err().is_config_error());
    }

    #[test]
    fn test_endpoint_urls() {
        let storage = SupabaseStorage::new(&config()).unwrap();
        assert_eq!(
            storage.object_url("sessions/a/audio.wav"),
            "https://db.example.org/storage/v1/object/recordings/sessions/a/audio.wav"
        );
        assert_eq!(storage.bucket_url(), "https://db.example.org/storage/v1/object/recordings");
        assert_eq!(storage.list_url(), "https://db.example.org/storage/v1/object/list/recordings");

        let metadata = SupabaseMetadata::new(&config()).unwrap();
        assert_eq!(metadata.table_url(), "https://db.example.org/rest/v1/screenings");
    }

    #[test]
    fn test_normalize_upload_key() {
        let requested = "sessions/a/recording.mp4";
        assert_eq!(
            normalize_upload_key(&json!({ "path": "sessions/a/recording.mp4" }), "recordings", "x"),
            "sessions/a/recording.mp4"
        );
        assert_eq!(
            normalize_upload_key(
                &json!({ "Key": "recordings/sessions/a/recording.mp4" }),
                "recordings",
                "x"
            ),
            "sessions/a/recording.mp4"
        );
        assert_eq!(normalize_upload_key(&json!({ "Id": "1" }), "recordings", requested), requested);
        assert_eq!(normalize_upload_key(&Value::Null, "recordings", requested), requested);
    }
}
