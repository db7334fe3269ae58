//! In-memory collaborators.
//!
//! Used by the test suite and for running the engine without a backend.
//! Each one counts the calls made against it and can be told to fail, so
//! callers can assert on "exactly one write" style properties.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;

use super::{
    ensure_owner, AddressBook, BlobResolver, KeyProvider, PageCursor, RecordPage, RecordStore,
    RecordStream, UploadAck, UploadEndpoint, UploadRequest,
};
use crate::core::crypto::KeyMaterial;
use crate::domain::{DebriefRecord, DebriefStatus, RecordQuery};
use crate::error::{Result, SyncError};

const FEED_CAPACITY: usize = 32;

type FeedEvent = std::result::Result<DebriefRecord, String>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record store backed by a vector, ordered by `occurred_at` descending
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<DebriefRecord>>,
    feeds: Mutex<HashMap<String, broadcast::Sender<FeedEvent>>>,
    page_failures: Mutex<VecDeque<SyncError>>,
    delete_failures: Mutex<VecDeque<SyncError>>,
    update_failures: Mutex<VecDeque<SyncError>>,
    fetch_delay: Mutex<Option<Duration>>,
    action_item_writes: Mutex<Vec<(String, Vec<String>)>>,
    fetch_page_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = DebriefRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Insert or replace a record without notifying subscribers
    pub fn insert(&self, record: DebriefRecord) {
        let mut records = lock(&self.records);
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        records.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at).then_with(|| a.id.cmp(&b.id)));
    }

    /// Insert or replace a record and push it to its change feed
    pub fn push_update(&self, record: DebriefRecord) {
        self.insert(record.clone());
        let _ = self.feed(&record.id).send(Ok(record));
    }

    /// Push an error onto a record's change feed
    pub fn push_feed_error(&self, id: &str, message: impl Into<String>) {
        let _ = self.feed(id).send(Err(message.into()));
    }

    /// Number of live subscriptions on a record's change feed
    pub fn subscriber_count(&self, id: &str) -> usize {
        lock(&self.feeds)
            .get(id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn fail_next_page(&self, err: SyncError) {
        lock(&self.page_failures).push_back(err);
    }

    pub fn fail_next_delete(&self, err: SyncError) {
        lock(&self.delete_failures).push_back(err);
    }

    pub fn fail_next_update(&self, err: SyncError) {
        lock(&self.update_failures).push_back(err);
    }

    /// Delay every page fetch (to observe in-flight behavior)
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *lock(&self.fetch_delay) = delay;
    }

    pub fn get(&self, id: &str) -> Option<DebriefRecord> {
        lock(&self.records).iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fetch_page_calls(&self) -> usize {
        self.fetch_page_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Every `update_action_items` call that reached the store
    pub fn action_item_writes(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.action_item_writes).clone()
    }

    fn feed(&self, id: &str) -> broadcast::Sender<FeedEvent> {
        lock(&self.feeds)
            .entry(id.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn fetch_page(
        &self,
        user_id: &str,
        query: &RecordQuery,
        cursor: Option<&PageCursor>,
        limit: usize,
    ) -> Result<RecordPage> {
        self.fetch_page_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.fetch_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = lock(&self.page_failures).pop_front() {
            return Err(err);
        }

        let matching: Vec<DebriefRecord> = lock(&self.records)
            .iter()
            .filter(|r| r.user_id == user_id && query.matches(r))
            .cloned()
            .collect();

        let start = match cursor {
            None => 0,
            Some(cursor) => match matching.iter().position(|r| r.id == cursor.as_str()) {
                Some(pos) => pos + 1,
                // Cursor no longer resolvable; never restart from the top
                None => matching.len(),
            },
        };

        let records: Vec<DebriefRecord> = matching.into_iter().skip(start).take(limit).collect();
        let next_cursor = if records.len() == limit {
            records.last().map(|r| PageCursor::new(r.id.clone()))
        } else {
            None
        };

        Ok(RecordPage {
            records,
            next_cursor,
        })
    }

    async fn fetch_one(&self, user_id: &str, id: &str) -> Result<DebriefRecord> {
        let record = self.get(id).ok_or(SyncError::NotFound)?;
        ensure_owner(record, user_id)
    }

    async fn subscribe(&self, id: &str) -> Result<RecordStream> {
        let rx = self.feed(id).subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(Ok(record)) => return Some((Ok(record), rx)),
                    Ok(Err(message)) => return Some((Err(SyncError::Unknown(message)), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn update_action_items(&self, id: &str, items: &[String], user_id: &str) -> Result<()> {
        lock(&self.action_item_writes).push((id.to_string(), items.to_vec()));
        if let Some(err) = lock(&self.update_failures).pop_front() {
            return Err(err);
        }

        let mut records = lock(&self.records);
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(SyncError::NotFound)?;
        if record.user_id != user_id {
            return Err(SyncError::Unauthorized);
        }
        record.action_items = Some(items.to_vec());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.delete_failures).pop_front() {
            return Err(err);
        }

        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(SyncError::NotFound);
        }
        Ok(())
    }
}

/// Address book backed by maps, counting id lookups
#[derive(Default)]
pub struct MemoryAddressBook {
    names: Mutex<HashMap<String, String>>,
    phones: Mutex<HashMap<String, String>>,
    emails: Mutex<HashMap<String, String>>,
    lookups: AtomicUsize,
}

impl MemoryAddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contacts<'a>(contacts: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let book = Self::new();
        for (id, name) in contacts {
            book.insert(id, name);
        }
        book
    }

    pub fn insert(&self, contact_id: &str, name: &str) {
        lock(&self.names).insert(contact_id.to_string(), name.to_string());
    }

    pub fn remove(&self, contact_id: &str) {
        lock(&self.names).remove(contact_id);
    }

    pub fn insert_phone(&self, phone: &str, name: &str) {
        lock(&self.phones).insert(phone.to_string(), name.to_string());
    }

    pub fn insert_email(&self, email: &str, name: &str) {
        lock(&self.emails).insert(email.to_lowercase(), name.to_string());
    }

    /// Number of `lookup_name` calls served
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressBook for MemoryAddressBook {
    async fn lookup_name(&self, contact_id: &str) -> Option<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        lock(&self.names).get(contact_id).cloned()
    }

    async fn find_by_phone(&self, phone: &str) -> Option<String> {
        lock(&self.phones).get(phone).cloned()
    }

    async fn find_by_email(&self, email: &str) -> Option<String> {
        lock(&self.emails).get(&email.to_lowercase()).cloned()
    }
}

/// Key provider returning a fixed key (or none), counting fetches
#[derive(Default)]
pub struct StaticKeyProvider {
    key: Option<KeyMaterial>,
    failures: Mutex<VecDeque<SyncError>>,
    fetches: AtomicUsize,
}

impl StaticKeyProvider {
    pub fn new(key: Option<KeyMaterial>) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    pub fn fail_next(&self, err: SyncError) {
        lock(&self.failures).push_back(err);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn fetch_key(&self, _user_id: &str) -> Result<Option<KeyMaterial>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        Ok(self.key.clone())
    }
}

/// Blob storage with fixed path → URL and URL → bytes maps
#[derive(Default)]
pub struct MemoryBlobResolver {
    urls: Mutex<HashMap<String, String>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    resolves: AtomicUsize,
    downloads: AtomicUsize,
}

impl MemoryBlobResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_path(&self, path: &str, url: &str) {
        lock(&self.urls).insert(path.to_string(), url.to_string());
    }

    pub fn insert_blob(&self, url: &str, bytes: Vec<u8>) {
        lock(&self.blobs).insert(url.to_string(), bytes);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobResolver for MemoryBlobResolver {
    async fn resolve_download_url(&self, path: &str) -> Result<String> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        lock(&self.urls).get(path).cloned().ok_or(SyncError::NotFound)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        lock(&self.blobs).get(url).cloned().ok_or(SyncError::NotFound)
    }
}

/// Ingest endpoint that accepts every upload under the client id
pub struct MemoryUploadEndpoint {
    ack_status: DebriefStatus,
    failures: Mutex<VecDeque<SyncError>>,
    requests: Mutex<Vec<UploadRequest>>,
}

impl Default for MemoryUploadEndpoint {
    fn default() -> Self {
        Self::new(DebriefStatus::Processing)
    }
}

impl MemoryUploadEndpoint {
    pub fn new(ack_status: DebriefStatus) -> Self {
        Self {
            ack_status,
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self, err: SyncError) {
        lock(&self.failures).push_back(err);
    }

    pub fn requests(&self) -> Vec<UploadRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl UploadEndpoint for MemoryUploadEndpoint {
    async fn create_debrief(&self, request: &UploadRequest) -> Result<UploadAck> {
        lock(&self.requests).push(request.clone());
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        Ok(UploadAck {
            id: request.client_id.clone(),
            status: self.ack_status,
        })
    }
}
