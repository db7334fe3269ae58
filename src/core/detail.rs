//! Single-record view: fetch, decrypt and resolve audio for playback.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::crypto::{DecryptedRecord, EncryptionGateway};
use super::resolver::ContactNameResolver;
use crate::adapters::{BlobResolver, RecordStore};
use crate::domain::{AudioRef, DebriefRecord};
use crate::error::{Result, SyncError};

/// Where to play a record's audio from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    /// Plain audio, streamable from this URL
    Remote(String),

    /// Decrypted copy in the local audio cache
    LocalFile(PathBuf),
}

pub struct DetailService {
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobResolver>,
    resolver: Arc<ContactNameResolver>,
    gateway: Arc<EncryptionGateway>,
}

impl DetailService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobResolver>,
        resolver: Arc<ContactNameResolver>,
        gateway: Arc<EncryptionGateway>,
    ) -> Self {
        Self {
            store,
            blobs,
            resolver,
            gateway,
        }
    }

    /// Fetch one record with its display name resolved and its text
    /// fields decrypted. Audio is left alone until [`Self::playback`].
    #[instrument(skip(self))]
    pub async fn open(&self, user_id: &str, id: &str) -> Result<DecryptedRecord> {
        let record = self.store.fetch_one(user_id, id).await?;
        let record = self.resolver.resolve_record(record).await;
        Ok(self.gateway.decrypt_record(user_id, record).await)
    }

    /// Playable URL for the record's audio (storage paths are resolved)
    pub async fn resolve_audio(&self, record: &DebriefRecord) -> Result<String> {
        match record.audio_ref() {
            Some(AudioRef::Url(url)) => Ok(url),
            Some(AudioRef::StoragePath(path)) => {
                debug!(%path, "Resolving storage path");
                self.blobs.resolve_download_url(&path).await
            }
            None => Err(SyncError::NotFound),
        }
    }

    /// Audio ready to play, decrypting into the audio cache when needed
    #[instrument(skip(self, record), fields(id = %record.id))]
    pub async fn playback(&self, user_id: &str, record: &DebriefRecord) -> Result<PlaybackSource> {
        let url = self.resolve_audio(record).await?;
        if !record.encrypted {
            return Ok(PlaybackSource::Remote(url));
        }
        let path = self
            .gateway
            .decrypt_audio_to_file(user_id, &record.id, &url)
            .await?;
        Ok(PlaybackSource::LocalFile(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryAddressBook, MemoryBlobResolver, MemoryRecordStore, StaticKeyProvider};
    use crate::core::crypto::{encrypt_bytes, encrypt_text, KeyMaterial};
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        service: DetailService,
        store: Arc<MemoryRecordStore>,
        blobs: Arc<MemoryBlobResolver>,
        keys: Arc<StaticKeyProvider>,
        key: KeyMaterial,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let key = KeyMaterial::generate();
        let store = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobResolver::new());
        let keys = Arc::new(StaticKeyProvider::new(Some(key.clone())));
        let book = Arc::new(MemoryAddressBook::with_contacts([("c-1", "Alice")]));
        let resolver = Arc::new(ContactNameResolver::new(book, 10));
        let gateway = Arc::new(EncryptionGateway::new(
            keys.clone(),
            blobs.clone(),
            dir.path().join("audio"),
        ));
        Fixture {
            service: DetailService::new(store.clone(), blobs.clone(), resolver, gateway),
            store,
            blobs,
            keys,
            key,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_open_resolves_and_decrypts() {
        let f = fixture();
        let mut record = DebriefRecord::new_local("u-1", "c-1", "", Utc::now(), 30.0);
        record.encrypted = true;
        record.summary = Some(encrypt_text("Renewal in May", &f.key).unwrap());
        f.store.insert(record.clone());

        let opened = f.service.open("u-1", &record.id).await.unwrap();
        assert!(!opened.is_degraded());
        assert_eq!(opened.record.contact_name, "Alice");
        assert_eq!(opened.record.summary.as_deref(), Some("Renewal in May"));
        // Audio is not touched on open
        assert_eq!(f.blobs.download_count(), 0);
    }

    #[tokio::test]
    async fn test_open_rejects_other_user() {
        let f = fixture();
        let record = DebriefRecord::new_local("u-2", "c-1", "", Utc::now(), 30.0);
        f.store.insert(record.clone());

        let err = f.service.open("u-1", &record.id).await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized));
    }

    #[tokio::test]
    async fn test_plain_audio_plays_remotely() {
        let f = fixture();
        let mut record = DebriefRecord::new_local("u-1", "c-1", "", Utc::now(), 30.0);
        record.audio_storage_path = Some("audio/u-1/a.m4a".to_string());
        f.blobs.insert_path("audio/u-1/a.m4a", "https://cdn.test/a.m4a");

        let source = f.service.playback("u-1", &record).await.unwrap();
        assert_eq!(source, PlaybackSource::Remote("https://cdn.test/a.m4a".to_string()));
        assert_eq!(f.keys.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_encrypted_audio_decrypted_once() {
        let f = fixture();
        let mut record = DebriefRecord::new_local("u-1", "c-1", "", Utc::now(), 30.0);
        record.encrypted = true;
        record.audio_url = Some("https://cdn.test/b.enc".to_string());
        f.blobs.insert_blob(
            "https://cdn.test/b.enc",
            encrypt_bytes(b"AUDIO", &f.key).unwrap(),
        );

        let first = f.service.playback("u-1", &record).await.unwrap();
        let PlaybackSource::LocalFile(path) = &first else {
            panic!("expected local file");
        };
        assert_eq!(tokio::fs::read(path).await.unwrap(), b"AUDIO");

        let second = f.service.playback("u-1", &record).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.blobs.download_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_audio_is_not_found() {
        let f = fixture();
        let record = DebriefRecord::new_local("u-1", "c-1", "", Utc::now(), 30.0);
        assert!(matches!(
            f.service.resolve_audio(&record).await,
            Err(SyncError::NotFound)
        ));
    }
}
