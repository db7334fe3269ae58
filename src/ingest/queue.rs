//! Durable queue of debriefs created on this device but not yet confirmed
//! by the remote store.
//!
//! Follows the event-log pattern: an append-only JSONL file whose replay
//! yields the current entries. Every mutation is appended under an
//! exclusive file lock and announced on a broadcast channel so the
//! timeline can re-merge without polling.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::domain::{DebriefRecord, DebriefStatus};

const CHANGE_CAPACITY: usize = 64;

/// Errors that can occur with the pending queue
#[derive(Debug, Error)]
pub enum PendingQueueError {
    #[error("Pending debrief not found: {0}")]
    NotFound(String),

    #[error("Pending debrief already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An event in the queue log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub timestamp: DateTime<Utc>,

    /// Debrief id the event applies to
    pub item_id: String,

    pub event_type: QueueEventType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Types of queue events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    /// Entry added (data: the full [`PendingEntry`])
    Enqueued,

    /// Ingest endpoint accepted the upload (data: `{"status": ...}`)
    Acknowledged,

    /// Record replaced (data: `{"record": ...}`)
    Updated,

    /// Entry removed
    Removed,
}

/// A locally created debrief awaiting confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub record: DebriefRecord,

    /// Whether the ingest endpoint has accepted the upload
    #[serde(default)]
    pub acknowledged: bool,

    /// Local recording, kept until the upload is acknowledged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,
}

impl PendingEntry {
    pub fn new(record: DebriefRecord, audio_path: Option<PathBuf>) -> Self {
        Self {
            record,
            acknowledged: false,
            audio_path,
        }
    }
}

/// Notification pushed to observers on every mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueChange {
    Added(String),
    Updated(String),
    Removed(String),
}

impl QueueChange {
    pub fn id(&self) -> &str {
        match self {
            Self::Added(id) | Self::Updated(id) | Self::Removed(id) => id,
        }
    }
}

/// Durable, observable queue of pending debriefs
pub struct PendingUploadQueue {
    /// Path to the queue JSONL file (`None` = memory only)
    path: Option<PathBuf>,

    /// Current entries in insertion order
    entries: Mutex<Vec<PendingEntry>>,

    changes: broadcast::Sender<QueueChange>,
}

impl PendingUploadQueue {
    /// Open (or create) a queue backed by `path`, replaying its log
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PendingQueueError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entries = replay(&path).await?;
        info!(path = %path.display(), pending = entries.len(), "Pending queue opened");

        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
            changes,
        })
    }

    /// Queue without persistence
    pub fn in_memory() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
            changes,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Observe add/update/remove notifications
    pub fn subscribe(&self) -> broadcast::Receiver<QueueChange> {
        self.changes.subscribe()
    }

    /// Add a new entry; ids are unique within the queue
    pub async fn enqueue(&self, entry: PendingEntry) -> Result<(), PendingQueueError> {
        let id = entry.record.id.clone();
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.record.id == id) {
            return Err(PendingQueueError::AlreadyExists(id));
        }

        self.append(QueueEvent {
            timestamp: Utc::now(),
            item_id: id.clone(),
            event_type: QueueEventType::Enqueued,
            data: Some(serde_json::to_value(&entry)?),
        })
        .await?;
        entries.push(entry);
        drop(entries);

        debug!(%id, "Pending debrief enqueued");
        self.notify(QueueChange::Added(id));
        Ok(())
    }

    /// Record the ingest endpoint's acknowledgment
    pub async fn mark_acknowledged(
        &self,
        id: &str,
        status: DebriefStatus,
    ) -> Result<PendingEntry, PendingQueueError> {
        let mut entries = self.entries.lock().await;
        let pos = position(&entries, id)?;

        self.append(QueueEvent {
            timestamp: Utc::now(),
            item_id: id.to_string(),
            event_type: QueueEventType::Acknowledged,
            data: Some(serde_json::json!({ "status": status })),
        })
        .await?;
        let entry = &mut entries[pos];
        entry.acknowledged = true;
        entry.record.status = status;
        let entry = entry.clone();
        drop(entries);

        self.notify(QueueChange::Updated(id.to_string()));
        Ok(entry)
    }

    /// Replace the record of an existing entry (same id)
    pub async fn update(&self, record: DebriefRecord) -> Result<(), PendingQueueError> {
        let id = record.id.clone();
        let mut entries = self.entries.lock().await;
        let pos = position(&entries, &id)?;

        self.append(QueueEvent {
            timestamp: Utc::now(),
            item_id: id.clone(),
            event_type: QueueEventType::Updated,
            data: Some(serde_json::json!({ "record": record })),
        })
        .await?;
        entries[pos].record = record;
        drop(entries);

        self.notify(QueueChange::Updated(id));
        Ok(())
    }

    /// Move an entry to a server-issued id
    pub async fn rekey(&self, old_id: &str, new_id: &str) -> Result<(), PendingQueueError> {
        let mut entries = self.entries.lock().await;
        let pos = position(&entries, old_id)?;
        if entries.iter().any(|e| e.record.id == new_id) {
            return Err(PendingQueueError::AlreadyExists(new_id.to_string()));
        }

        let mut entry = entries[pos].clone();
        entry.record.id = new_id.to_string();
        self.append(QueueEvent {
            timestamp: Utc::now(),
            item_id: old_id.to_string(),
            event_type: QueueEventType::Removed,
            data: None,
        })
        .await?;
        self.append(QueueEvent {
            timestamp: Utc::now(),
            item_id: new_id.to_string(),
            event_type: QueueEventType::Enqueued,
            data: Some(serde_json::to_value(&entry)?),
        })
        .await?;
        entries[pos] = entry;
        drop(entries);

        warn!(old_id, new_id, "Pending debrief re-keyed to server id");
        self.notify(QueueChange::Removed(old_id.to_string()));
        self.notify(QueueChange::Added(new_id.to_string()));
        Ok(())
    }

    /// Remove an entry; returns it if it was present
    pub async fn dequeue(&self, id: &str) -> Result<Option<PendingEntry>, PendingQueueError> {
        let mut entries = self.entries.lock().await;
        let Some(pos) = entries.iter().position(|e| e.record.id == id) else {
            return Ok(None);
        };

        self.append(QueueEvent {
            timestamp: Utc::now(),
            item_id: id.to_string(),
            event_type: QueueEventType::Removed,
            data: None,
        })
        .await?;
        let entry = entries.remove(pos);
        drop(entries);

        debug!(%id, "Pending debrief dequeued");
        self.notify(QueueChange::Removed(id.to_string()));
        Ok(Some(entry))
    }

    pub async fn get(&self, id: &str) -> Option<PendingEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.record.id == id)
            .cloned()
    }

    pub async fn entries(&self) -> Vec<PendingEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn records(&self) -> Vec<DebriefRecord> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.record.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Rewrite the log as one `Enqueued` event per live entry
    pub async fn compact(&self) -> Result<(), PendingQueueError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let entries = self.entries.lock().await;

        let mut lines = String::new();
        for entry in entries.iter() {
            let event = QueueEvent {
                timestamp: Utc::now(),
                item_id: entry.record.id.clone(),
                event_type: QueueEventType::Enqueued,
                data: Some(serde_json::to_value(entry)?),
            };
            lines.push_str(&serde_json::to_string(&event)?);
            lines.push('\n');
        }
        let count = entries.len();

        tokio::task::spawn_blocking(move || rewrite_locked(&path, &lines))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        drop(entries);

        info!(entries = count, "Pending queue compacted");
        Ok(())
    }

    async fn append(&self, event: QueueEvent) -> Result<(), PendingQueueError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let json = serde_json::to_string(&event)?;
        tokio::task::spawn_blocking(move || append_locked(&path, &json))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        Ok(())
    }

    fn notify(&self, change: QueueChange) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }
}

fn position(entries: &[PendingEntry], id: &str) -> Result<usize, PendingQueueError> {
    entries
        .iter()
        .position(|e| e.record.id == id)
        .ok_or_else(|| PendingQueueError::NotFound(id.to_string()))
}

/// Append one line with an exclusive lock; the lock drops with the file
fn append_locked(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    writeln!(file, "{}", line)?;
    file.flush()?;
    file.sync_data()
}

fn rewrite_locked(path: &Path, content: &str) -> std::io::Result<()> {
    let lock = OpenOptions::new().create(true).append(true).open(path)?;
    lock.lock_exclusive()?;

    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_data()?;
    }
    std::fs::rename(&tmp, path)
}

/// Replay the log; unreadable lines are skipped so one bad write cannot
/// lose every other offline recording
async fn replay(path: &Path) -> Result<Vec<PendingEntry>, PendingQueueError> {
    let mut entries: Vec<PendingEntry> = Vec::new();
    if !tokio::fs::try_exists(path).await? {
        return Ok(entries);
    }

    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<QueueEvent>(&line) {
            Ok(event) => apply_event(&mut entries, event),
            Err(e) => warn!(line = line_no, "Skipping unreadable queue event: {}", e),
        }
    }

    Ok(entries)
}

/// Apply a single event to the state
fn apply_event(entries: &mut Vec<PendingEntry>, event: QueueEvent) {
    let pos = entries.iter().position(|e| e.record.id == event.item_id);
    match event.event_type {
        QueueEventType::Enqueued => {
            let Some(data) = event.data else { return };
            match serde_json::from_value::<PendingEntry>(data) {
                Ok(entry) => match pos {
                    Some(pos) => entries[pos] = entry,
                    None => entries.push(entry),
                },
                Err(e) => warn!(id = %event.item_id, "Skipping undecodable pending entry: {}", e),
            }
        }
        QueueEventType::Acknowledged => {
            let Some(pos) = pos else { return };
            let status = event
                .data
                .as_ref()
                .and_then(|d| d.get("status").cloned())
                .and_then(|s| serde_json::from_value::<DebriefStatus>(s).ok());
            entries[pos].acknowledged = true;
            if let Some(status) = status {
                entries[pos].record.status = status;
            }
        }
        QueueEventType::Updated => {
            let Some(pos) = pos else { return };
            let record = event
                .data
                .and_then(|mut d| d.get_mut("record").map(serde_json::Value::take))
                .and_then(|r| serde_json::from_value::<DebriefRecord>(r).ok());
            if let Some(record) = record {
                entries[pos].record = record;
            }
        }
        QueueEventType::Removed => {
            if let Some(pos) = pos {
                entries.remove(pos);
            }
        }
    }
}
