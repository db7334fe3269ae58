//! Debrief records and their wire format.
//!
//! A debrief is one recorded interaction with a contact plus whatever the
//! backend derived from it (summary, transcript, action items). Records
//! arrive from the remote store as loosely-typed JSON documents, so decoding
//! goes through [`RawDebrief`] and normalizes timestamps, durations and the
//! encryption flag before a [`DebriefRecord`] exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retry budget the backend grants a failed debrief.
pub const MAX_RETRIES: u32 = 3;

/// Display name for a record without any contact reference.
pub const UNKNOWN_CONTACT: &str = "Unknown";

/// Display name cached for a contact id the address book no longer knows.
pub const DELETED_CONTACT: &str = "Deleted Contact";

/// Epoch values above this are milliseconds, below it seconds.
///
/// Present-day instants are ~1.7e9 in seconds and ~1.7e12 in milliseconds.
pub const EPOCH_MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

/// Processing status of a debrief
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DebriefStatus {
    /// Created locally or accepted by the ingest endpoint
    Created,

    /// Backend is transcribing / summarizing
    Processing,

    /// Summary and transcript are available
    Ready,

    /// Processing failed (may still be retried by the backend)
    Failed,
}

impl DebriefStatus {
    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Processing => "PROCESSING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for DebriefStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the audio for a record can be found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioRef {
    /// Directly playable URL
    Url(String),

    /// Blob storage path that must be resolved to a URL first
    StoragePath(String),
}

/// A single debrief as seen by the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDebrief", rename_all = "camelCase")]
pub struct DebriefRecord {
    /// Stable id (client-generated while offline)
    #[serde(rename = "debriefId")]
    pub id: String,

    pub user_id: String,

    pub contact_id: String,

    /// Locally resolved display name; never authoritative
    pub contact_name: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub occurred_at: DateTime<Utc>,

    /// Length of the recording in seconds (never negative)
    #[serde(rename = "duration")]
    pub duration_secs: f64,

    pub status: DebriefStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_items: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_storage_path: Option<String>,

    pub encrypted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    pub retry_count: u32,

    #[serde(
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub next_retry_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DebriefRecord {
    /// Create a record for a recording made on this device
    pub fn new_local(
        user_id: impl Into<String>,
        contact_id: impl Into<String>,
        contact_name: impl Into<String>,
        occurred_at: DateTime<Utc>,
        duration_secs: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            contact_id: contact_id.into(),
            contact_name: contact_name.into(),
            occurred_at,
            duration_secs: clamp_duration(duration_secs),
            status: DebriefStatus::Created,
            summary: None,
            transcript: None,
            action_items: None,
            audio_url: None,
            audio_storage_path: None,
            encrypted: false,
            encryption_version: None,
            phone_number: None,
            email: None,
            retry_count: 0,
            next_retry_at: None,
            error_message: None,
        }
    }

    /// Failed, but the backend has another attempt scheduled
    pub fn is_retrying(&self) -> bool {
        self.status == DebriefStatus::Failed
            && self.retry_count < MAX_RETRIES
            && self.next_retry_at.is_some()
    }

    /// Failed with no further automatic retry
    pub fn is_permanently_failed(&self) -> bool {
        self.status == DebriefStatus::Failed && !self.is_retrying()
    }

    /// No further status change is expected without user action
    pub fn is_terminal(&self) -> bool {
        self.status == DebriefStatus::Ready || self.is_permanently_failed()
    }

    /// Audio location, preferring a direct URL over a storage path
    pub fn audio_ref(&self) -> Option<AudioRef> {
        if let Some(url) = self.audio_url.as_deref().filter(|u| !u.is_empty()) {
            return Some(AudioRef::Url(url.to_string()));
        }
        self.audio_storage_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| AudioRef::StoragePath(p.to_string()))
    }

    /// Copy of this record with a different display name
    pub fn with_contact_name(mut self, name: impl Into<String>) -> Self {
        self.contact_name = name.into();
        self
    }

    /// Action items, treating a missing list as empty
    pub fn action_items(&self) -> &[String] {
        self.action_items.as_deref().unwrap_or(&[])
    }
}

/// An edit to a record's action item list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionItemEdit {
    /// Replace the item at `index`
    Edit { index: usize, text: String },

    /// Remove the item at `index`
    Delete { index: usize },

    /// Append a new item
    Add { text: String },
}

impl ActionItemEdit {
    /// Apply the edit, returning `None` when the index is out of range
    pub fn apply(&self, items: &[String]) -> Option<Vec<String>> {
        let mut items = items.to_vec();
        match self {
            Self::Edit { index, text } => {
                let slot = items.get_mut(*index)?;
                *slot = text.clone();
            }
            Self::Delete { index } => {
                if *index >= items.len() {
                    return None;
                }
                items.remove(*index);
            }
            Self::Add { text } => items.push(text.clone()),
        }
        Some(items)
    }
}

/// Convert an epoch number of unknown scale to an instant.
///
/// Values above [`EPOCH_MILLIS_THRESHOLD`] are read as milliseconds.
pub fn instant_from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value > EPOCH_MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis.round() as i64)
}

/// Format a duration as `m:ss`
pub fn format_duration(duration_secs: f64) -> String {
    let total = clamp_duration(duration_secs) as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

fn clamp_duration(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Loosely-typed document as stored remotely (and in the pending queue)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDebrief {
    #[serde(rename = "debriefId", alias = "id")]
    id: String,
    status: DebriefStatus,
    user_id: Option<String>,
    contact_id: Option<String>,
    contact_name: Option<String>,
    occurred_at: Option<serde_json::Value>,
    audio_duration_sec: Option<f64>,
    duration: Option<f64>,
    summary: Option<String>,
    transcript: Option<String>,
    action_items: Option<Vec<String>>,
    audio_url: Option<String>,
    audio_storage_path: Option<String>,
    encrypted: Option<bool>,
    encryption_version: Option<String>,
    phone_number: Option<String>,
    email: Option<String>,
    retry_count: Option<i64>,
    next_retry_at: Option<f64>,
    error_message: Option<String>,
}

impl TryFrom<RawDebrief> for DebriefRecord {
    type Error = String;

    fn try_from(raw: RawDebrief) -> Result<Self, Self::Error> {
        let occurred_at = match raw.occurred_at {
            Some(serde_json::Value::Number(n)) => n
                .as_f64()
                .and_then(instant_from_epoch)
                .ok_or_else(|| format!("occurredAt out of range: {}", n))?,
            Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| format!("invalid occurredAt '{}': {}", s, e))?,
            Some(other) => return Err(format!("unsupported occurredAt value: {}", other)),
            None => return Err("missing occurredAt".to_string()),
        };

        let encryption_version = raw.encryption_version.filter(|v| !v.is_empty());
        let encrypted = encryption_version.is_some() || raw.encrypted.unwrap_or(false);

        Ok(Self {
            id: raw.id,
            user_id: raw.user_id.unwrap_or_default(),
            contact_id: raw.contact_id.unwrap_or_default(),
            contact_name: raw
                .contact_name
                .unwrap_or_else(|| UNKNOWN_CONTACT.to_string()),
            occurred_at,
            duration_secs: clamp_duration(
                raw.audio_duration_sec.or(raw.duration).unwrap_or(0.0),
            ),
            status: raw.status,
            summary: raw.summary,
            transcript: raw.transcript,
            action_items: raw.action_items,
            audio_url: raw.audio_url,
            audio_storage_path: raw.audio_storage_path,
            encrypted,
            encryption_version,
            phone_number: raw.phone_number,
            email: raw.email,
            retry_count: raw.retry_count.unwrap_or(0).clamp(0, u32::MAX as i64) as u32,
            next_retry_at: raw.next_retry_at.and_then(|ms| {
                if ms.is_finite() {
                    DateTime::from_timestamp_millis(ms.round() as i64)
                } else {
                    None
                }
            }),
            error_message: raw.error_message,
        })
    }
}
