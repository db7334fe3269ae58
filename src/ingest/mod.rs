//! Local ingestion of new recordings.
//!
//! Recordings made on this device become pending debriefs before any
//! network call:
//!
//! 1. **Queue**: durable JSONL event log of pending debriefs (survives restarts)
//! 2. **Upload**: optimistic submission to the ingest endpoint, with explicit retry
//!
//! # Architecture
//!
//! ```text
//! Recording → Uploader → Queue ──(QueueChange)──→ Reconciler
//!                ↓          ↓
//!         Ingest endpoint  pending.jsonl
//! ```

pub mod queue;
pub mod upload;

// Re-export key types
pub use queue::{PendingEntry, PendingQueueError, PendingUploadQueue, QueueChange};
pub use upload::{DebriefUploader, NewRecording, UploadOutcome};
