//! REST implementations of the collaborators.
//!
//! Endpoints (relative to the configured API base URL):
//! - `GET    /v1/debriefs`                     page of records
//! - `GET    /v1/debriefs/{id}`                single record
//! - `PATCH  /v1/debriefs/{id}/action-items`   write-through edit
//! - `DELETE /v1/debriefs/{id}`
//! - `POST   /v1/debriefs`                     multipart upload
//! - `POST   /v1/auth/exchange-key`            user key (503 = disabled)
//! - `GET    /v1/storage/download-url?path=`   signed audio URL
//!
//! Status changes are observed by polling the single-record endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{
    ensure_owner, BlobResolver, KeyProvider, PageCursor, RecordPage, RecordStore, RecordStream,
    UploadAck, UploadEndpoint, UploadRequest,
};
use crate::core::crypto::{KeyMaterial, NONCE_LEN, TAG_LEN};
use crate::domain::{DebriefRecord, DebriefStatus, RecordQuery};
use crate::error::{Result, SyncError};

/// Shared HTTP plumbing: base URL, bearer token, timeouts
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::unknown(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send and map non-2xx responses onto the error taxonomy
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::from_status(status.as_u16(), body))
    }

    async fn get_record(&self, id: &str) -> Result<DebriefRecord> {
        let response = self
            .send(self.client.get(self.url(&format!("/v1/debriefs/{}", id))))
            .await?;
        let value: serde_json::Value = response.json().await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Page response from `GET /v1/debriefs`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageResponse {
    #[serde(default)]
    debriefs: Vec<serde_json::Value>,
    next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionItemsBody<'a> {
    action_items: &'a [String],
    user_id: &'a str,
}

/// Record store over the REST API
pub struct HttpRecordStore {
    api: ApiClient,
    poll_interval: Duration,
}

impl HttpRecordStore {
    pub fn new(api: ApiClient, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }
}

fn query_params(
    user_id: &str,
    query: &RecordQuery,
    cursor: Option<&PageCursor>,
    limit: usize,
) -> Vec<(&'static str, String)> {
    let mut params = vec![("userId", user_id.to_string()), ("limit", limit.to_string())];
    if let Some(contact_id) = &query.contact_id {
        params.push(("contactId", contact_id.clone()));
    }
    if let Some(start) = query.range.start_ms {
        params.push(("startMs", start.to_string()));
    }
    if let Some(end) = query.range.end_ms {
        params.push(("endMs", end.to_string()));
    }
    if let Some(has_items) = query.has_action_items {
        params.push(("hasActionItems", has_items.to_string()));
    }
    if let Some(status) = query.status {
        params.push(("status", status.as_str().to_string()));
    }
    if let Some(cursor) = cursor {
        params.push(("cursor", cursor.as_str().to_string()));
    }
    params
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    #[instrument(skip(self, query, cursor))]
    async fn fetch_page(
        &self,
        user_id: &str,
        query: &RecordQuery,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<RecordPage> {
        let request = self
            .api
            .client
            .get(self.api.url("/v1/debriefs"))
            .query(&query_params(user_id, query, cursor, limit));
        let page: PageResponse = self.api.send(request).await?.json().await?;

        let total = page.debriefs.len();
        let records: Vec<DebriefRecord> = page
            .debriefs
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<DebriefRecord>(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping undecodable debrief: {}", e);
                    None
                }
            })
            .collect();
        debug!(fetched = total, decoded = records.len(), "Fetched page");

        // A page shortened by decode failures still continues from the server cursor
        let next_cursor = if total == limit {
            page.next_cursor.map(PageCursor::new)
        } else {
            None
        };
        Ok(RecordPage {
            records,
            next_cursor,
        })
    }

    async fn fetch_one(&self, user_id: &str, id: &str) -> Result<DebriefRecord> {
        let record = self.api.get_record(id).await?;
        ensure_owner(record, user_id)
    }

    async fn subscribe(&self, id: &str) -> Result<RecordStream> {
        let state = PollState {
            api: self.api.clone(),
            id: id.to_string(),
            interval: self.poll_interval,
            last: None,
            done: false,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.done {
                    return None;
                }
                if state.last.is_some() {
                    tokio::time::sleep(state.interval).await;
                }
                match state.api.get_record(&state.id).await {
                    Ok(record) => {
                        if state.last.as_ref() == Some(&record) {
                            continue;
                        }
                        state.last = Some(record.clone());
                        return Some((Ok(record), state));
                    }
                    Err(SyncError::NotFound) => {
                        state.done = true;
                        return Some((Err(SyncError::NotFound), state));
                    }
                    Err(err) => {
                        // Keep polling after transient errors
                        if state.last.is_none() {
                            tokio::time::sleep(state.interval).await;
                        }
                        return Some((Err(err), state));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    #[instrument(skip(self, items))]
    async fn update_action_items(&self, id: &str, items: &[String], user_id: &str) -> Result<()> {
        let request = self
            .api
            .client
            .patch(self.api.url(&format!("/v1/debriefs/{}/action-items", id)))
            .json(&ActionItemsBody {
                action_items: items,
                user_id,
            });
        self.api.send(request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        let request = self
            .api
            .client
            .delete(self.api.url(&format!("/v1/debriefs/{}", id)));
        self.api.send(request).await?;
        Ok(())
    }
}

struct PollState {
    api: ApiClient,
    id: String,
    interval: Duration,
    last: Option<DebriefRecord>,
    done: bool,
}

/// Response from `POST /v1/auth/exchange-key`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyExchangeResponse {
    user_key: String,
    algorithm: Option<String>,
    version: Option<String>,
    nonce_size: Option<usize>,
    tag_size: Option<usize>,
}

/// Key provisioning over the REST API
pub struct HttpKeyProvider {
    api: ApiClient,
}

impl HttpKeyProvider {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl KeyProvider for HttpKeyProvider {
    #[instrument(skip(self))]
    async fn fetch_key(&self, user_id: &str) -> Result<Option<KeyMaterial>> {
        let request = self
            .api
            .authorized(self.api.client.post(self.api.url("/v1/auth/exchange-key")))
            .json(&serde_json::json!({ "userId": user_id }));
        let response = request.send().await?;

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), body));
        }

        let exchange: KeyExchangeResponse = response.json().await?;
        if exchange.nonce_size.is_some_and(|n| n != NONCE_LEN)
            || exchange.tag_size.is_some_and(|t| t != TAG_LEN)
        {
            return Err(SyncError::DecryptionFailed(format!(
                "unsupported cipher parameters: {:?}",
                exchange.algorithm
            )));
        }
        debug!(version = ?exchange.version, "Key exchange complete");
        Ok(Some(KeyMaterial::from_base64(&exchange.user_key)?))
    }
}

#[derive(Debug, Deserialize)]
struct DownloadUrlResponse {
    url: String,
}

/// Storage path resolution and blob download
pub struct HttpBlobResolver {
    api: ApiClient,
}

impl HttpBlobResolver {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl BlobResolver for HttpBlobResolver {
    async fn resolve_download_url(&self, path: &str) -> Result<String> {
        let request = self
            .api
            .client
            .get(self.api.url("/v1/storage/download-url"))
            .query(&[("path", path)]);
        let response: DownloadUrlResponse = self.api.send(request).await?.json().await?;
        Ok(response.url)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        // Signed URLs carry their own credentials
        let response = self.api.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::from_status(status.as_u16(), String::new()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    debrief_id: String,
    status: DebriefStatus,
}

/// Multipart upload of new recordings
pub struct HttpUploadEndpoint {
    api: ApiClient,
}

impl HttpUploadEndpoint {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl UploadEndpoint for HttpUploadEndpoint {
    #[instrument(skip(self, request), fields(id = %request.client_id))]
    async fn create_debrief(&self, request: &UploadRequest) -> Result<UploadAck> {
        let file_name = request
            .audio_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}.m4a", request.client_id));
        let bytes = tokio::fs::read(&request.audio_path).await?;

        let audio = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mp4")?;
        let form = Form::new()
            .text("debriefId", request.client_id.clone())
            .text("userId", request.user_id.clone())
            .text("contactId", request.contact_id.clone())
            .text("duration", request.duration_secs.to_string())
            .part("audio", audio);

        let post = self.api.client.post(self.api.url("/v1/debriefs")).multipart(form);
        let ack: UploadResponse = self.api.send(post).await?.json().await?;
        Ok(UploadAck {
            id: ack.debrief_id,
            status: ack.status,
        })
    }
}
