//! Field-level decryption of debrief content.
//!
//! Ciphertext layout (AES-256-GCM):
//! - text fields: `base64(nonce(12) ‖ ciphertext ‖ tag(16))`
//! - audio: the same layout as raw bytes
//!
//! The per-user key is fetched once per session and cached. A field that
//! fails to decrypt keeps its raw value and yields a [`FieldWarning`]; the
//! record itself is never dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{BlobResolver, KeyProvider};
use crate::domain::DebriefRecord;
use crate::error::{Result, SyncError};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Errors from the cipher layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Invalid ciphertext format: {0}")]
    InvalidFormat(String),

    #[error("Invalid key: expected {KEY_LEN} bytes, got {0}")]
    InvalidKey(usize),

    #[error("Decryption failed")]
    DecryptionFailed,
}

impl From<CryptoError> for SyncError {
    fn from(err: CryptoError) -> Self {
        SyncError::DecryptionFailed(err.to_string())
    }
}

/// A user's 256-bit symmetric key
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn from_base64(encoded: &str) -> std::result::Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    fn cipher(&self) -> std::result::Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidKey(self.0.len()))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Decrypt `nonce ‖ ciphertext ‖ tag`
pub fn decrypt_bytes(data: &[u8], key: &KeyMaterial) -> std::result::Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "payload too short ({} bytes)",
            data.len()
        )));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    key.cipher()?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt to `nonce ‖ ciphertext ‖ tag` with a random nonce
pub fn encrypt_bytes(plaintext: &[u8], key: &KeyMaterial) -> std::result::Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = key
        .cipher()?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn decrypt_text(encoded: &str, key: &KeyMaterial) -> std::result::Result<String, CryptoError> {
    let data = BASE64
        .decode(encoded.trim().as_bytes())
        .map_err(|_| CryptoError::InvalidFormat("invalid base64 encoding".to_string()))?;
    let plaintext = decrypt_bytes(&data, key)?;
    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::InvalidFormat("plaintext is not valid UTF-8".to_string()))
}

pub fn encrypt_text(plaintext: &str, key: &KeyMaterial) -> std::result::Result<String, CryptoError> {
    Ok(BASE64.encode(encrypt_bytes(plaintext.as_bytes(), key)?))
}

/// A protected field that is shown in its raw form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWarning {
    /// `summary`, `transcript`, `actionItems[i]` or `key`
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for FieldWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Could not decrypt {}: {}", self.field, self.message)
    }
}

/// A record with its protected fields decrypted where possible
#[derive(Debug, Clone)]
pub struct DecryptedRecord {
    pub record: DebriefRecord,
    pub warnings: Vec<FieldWarning>,
}

impl DecryptedRecord {
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Key cache entry; `key == None` means encryption is disabled for the user
struct CachedKey {
    user_id: String,
    key: Option<KeyMaterial>,
}

/// Obtains the user key and decrypts record fields and audio
pub struct EncryptionGateway {
    keys: Arc<dyn KeyProvider>,
    blobs: Arc<dyn BlobResolver>,
    audio_dir: PathBuf,
    cached: RwLock<Option<CachedKey>>,
    fetch_lock: Mutex<()>,
}

impl EncryptionGateway {
    pub fn new(
        keys: Arc<dyn KeyProvider>,
        blobs: Arc<dyn BlobResolver>,
        audio_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            keys,
            blobs,
            audio_dir: audio_dir.into(),
            cached: RwLock::new(None),
            fetch_lock: Mutex::new(()),
        }
    }

    /// The user's key, fetching it on first use
    #[instrument(skip(self))]
    pub async fn ensure_key(&self, user_id: &str) -> Result<Option<KeyMaterial>> {
        if let Some(key) = self.cached_key(user_id).await {
            return Ok(key);
        }

        // Single fetch even when several fields ask at once
        let _guard = self.fetch_lock.lock().await;
        if let Some(key) = self.cached_key(user_id).await {
            return Ok(key);
        }

        let key = self.keys.fetch_key(user_id).await?;
        match &key {
            Some(_) => info!("Encryption key loaded"),
            None => info!("Encryption not enabled for user"),
        }
        *self.cached.write().await = Some(CachedKey {
            user_id: user_id.to_string(),
            key: key.clone(),
        });
        Ok(key)
    }

    /// Drop the cached key and any decrypted audio (logout, key rotation)
    pub async fn invalidate(&self) {
        if self.cached.write().await.take().is_some() {
            debug!("Encryption key cache cleared");
        }
        match tokio::fs::remove_dir_all(&self.audio_dir).await {
            Ok(()) => debug!(path = %self.audio_dir.display(), "Decrypted audio cache cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clear decrypted audio cache: {}", e),
        }
    }

    pub async fn has_cached_key(&self) -> bool {
        self.cached.read().await.is_some()
    }

    async fn cached_key(&self, user_id: &str) -> Option<Option<KeyMaterial>> {
        self.cached
            .read()
            .await
            .as_ref()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.key.clone())
    }

    /// Decrypt `summary`, `transcript` and each action item.
    ///
    /// Never fails: fields that cannot be decrypted keep their raw value.
    pub async fn decrypt_record(&self, user_id: &str, record: DebriefRecord) -> DecryptedRecord {
        if !record.encrypted {
            return DecryptedRecord {
                record,
                warnings: Vec::new(),
            };
        }

        let key = match self.ensure_key(user_id).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                return degraded(record, "encryption key not provisioned".to_string());
            }
            Err(err) => return degraded(record, err.to_string()),
        };

        let mut record = record;
        let mut warnings = Vec::new();

        record.summary = decrypt_field(record.summary.take(), "summary", &key, &mut warnings);
        record.transcript =
            decrypt_field(record.transcript.take(), "transcript", &key, &mut warnings);
        if let Some(items) = record.action_items.take() {
            let items = items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    let field = format!("actionItems[{}]", i);
                    decrypt_field(Some(item), &field, &key, &mut warnings).unwrap_or_default()
                })
                .collect();
            record.action_items = Some(items);
        }

        for warning in &warnings {
            warn!(id = %record.id, field = %warning.field, "{}", warning.message);
        }
        DecryptedRecord { record, warnings }
    }

    /// Download and decrypt a record's audio into the audio cache.
    ///
    /// Returns the cached file if it already exists.
    #[instrument(skip(self, url))]
    pub async fn decrypt_audio_to_file(
        &self,
        user_id: &str,
        record_id: &str,
        url: &str,
    ) -> Result<PathBuf> {
        let target = self.audio_path(record_id);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            debug!(path = %target.display(), "Using cached decrypted audio");
            return Ok(target);
        }

        let key = self
            .ensure_key(user_id)
            .await?
            .ok_or_else(|| SyncError::DecryptionFailed("encryption key not provisioned".into()))?;

        let encrypted = self.blobs.download(url).await?;
        debug!(bytes = encrypted.len(), "Downloaded encrypted audio");
        let audio = decrypt_bytes(&encrypted, &key)?;

        tokio::fs::create_dir_all(&self.audio_dir).await?;
        write_atomic(&target, &audio).await?;
        info!(path = %target.display(), bytes = audio.len(), "Audio decrypted");
        Ok(target)
    }

    fn audio_path(&self, record_id: &str) -> PathBuf {
        let safe: String = record_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.audio_dir.join(format!("{}.m4a", safe))
    }
}

fn degraded(record: DebriefRecord, message: String) -> DecryptedRecord {
    warn!(id = %record.id, "Showing encrypted record without decryption: {}", message);
    DecryptedRecord {
        record,
        warnings: vec![FieldWarning {
            field: "key".to_string(),
            message,
        }],
    }
}

fn decrypt_field(
    value: Option<String>,
    field: &str,
    key: &KeyMaterial,
    warnings: &mut Vec<FieldWarning>,
) -> Option<String> {
    let raw = value?;
    if raw.is_empty() {
        return Some(raw);
    }
    match decrypt_text(&raw, key) {
        Ok(plain) => Some(plain),
        Err(err) => {
            warnings.push(FieldWarning {
                field: field.to_string(),
                message: err.to_string(),
            });
            Some(raw)
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("m4a.part");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
