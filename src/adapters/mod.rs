//! Collaborator interfaces for systems outside the sync engine.
//!
//! Every external system (record store, blob storage, key service, address
//! book, ingest endpoint) sits behind a trait so the engine can be wired
//! with the HTTP implementations in production and the in-memory ones in
//! tests.

pub mod contacts;
pub mod http;
pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::core::crypto::KeyMaterial;
use crate::domain::{DebriefRecord, DebriefStatus, RecordQuery};
use crate::error::{Result, SyncError};

pub use contacts::JsonAddressBook;
pub use http::{ApiClient, HttpBlobResolver, HttpKeyProvider, HttpRecordStore, HttpUploadEndpoint};
pub use memory::{
    MemoryAddressBook, MemoryBlobResolver, MemoryRecordStore, MemoryUploadEndpoint,
    StaticKeyProvider,
};

/// Opaque continuation token returned after the last item of a page
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageCursor(String);

impl PageCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of records plus the cursor for the next one
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<DebriefRecord>,
    pub next_cursor: Option<PageCursor>,
}

/// Live feed of a single record (each item is a full snapshot)
pub type RecordStream = BoxStream<'static, Result<DebriefRecord>>;

/// Typed façade over the remote debrief collection
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch up to `limit` records after `cursor` (`None` = from the start)
    async fn fetch_page(
        &self,
        user_id: &str,
        query: &RecordQuery,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<RecordPage>;

    /// Fetch a single record; fails with `Unauthorized` if it is not the user's
    async fn fetch_one(&self, user_id: &str, id: &str) -> Result<DebriefRecord>;

    /// Subscribe to changes of one record
    async fn subscribe(&self, id: &str) -> Result<RecordStream>;

    async fn update_action_items(&self, id: &str, items: &[String], user_id: &str) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Resolves blob storage paths to downloadable URLs
#[async_trait]
pub trait BlobResolver: Send + Sync {
    async fn resolve_download_url(&self, path: &str) -> Result<String>;

    /// Download the bytes behind a URL
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

/// Issues the per-user symmetric key
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// `Ok(None)` means encryption is not enabled for this account
    async fn fetch_key(&self, user_id: &str) -> Result<Option<KeyMaterial>>;
}

/// Device address book
#[async_trait]
pub trait AddressBook: Send + Sync {
    async fn lookup_name(&self, contact_id: &str) -> Option<String>;

    async fn find_by_phone(&self, _phone: &str) -> Option<String> {
        None
    }

    async fn find_by_email(&self, _email: &str) -> Option<String> {
        None
    }
}

/// A new recording handed to the ingest endpoint
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Locally generated id the endpoint should adopt
    pub client_id: String,
    pub user_id: String,
    pub contact_id: String,
    pub audio_path: PathBuf,
    pub duration_secs: f64,
}

/// What the ingest endpoint returns for an accepted recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAck {
    pub id: String,
    pub status: DebriefStatus,
}

/// Accepts new recordings for server-side processing
#[async_trait]
pub trait UploadEndpoint: Send + Sync {
    async fn create_debrief(&self, request: &UploadRequest) -> Result<UploadAck>;
}

/// Reject records that belong to a different user
pub(crate) fn ensure_owner(record: DebriefRecord, user_id: &str) -> Result<DebriefRecord> {
    if record.user_id != user_id {
        tracing::warn!(id = %record.id, "Record belongs to a different user");
        return Err(SyncError::Unauthorized);
    }
    Ok(record)
}
