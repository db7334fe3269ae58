//! debrief-sync - Offline-first sync engine for recorded debriefs
//!
//! Keeps a local timeline of debriefs consistent with a remote record
//! store: recordings made offline are queued durably, merged with fetched
//! pages, followed through processing and decrypted on demand.
//!
//! # Architecture
//!
//! A single actor owns the timeline state:
//! - Pending uploads live in an append-only JSONL event log
//! - Fetched pages and pending entries are merged by id (fetched wins)
//! - In-flight records are followed by per-record status subscriptions
//! - Every change publishes an immutable snapshot on a watch channel
//!
//! # Modules
//!
//! - `adapters`: Collaborator traits with HTTP and in-memory implementations
//! - `core`: Reconciler, timeline, subscriptions, contact resolver, crypto
//! - `domain`: Data structures (DebriefRecord, filters, lifecycle)
//! - `ingest`: Pending upload queue and uploader
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Show today's debriefs
//! debrief timeline --range today
//!
//! # Inspect one debrief and decrypt its audio
//! debrief show <id> --audio
//!
//! # Retry a failed upload
//! debrief pending retry <id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod ingest;

// Re-export main types at crate root for convenience
pub use core::{
    ContactNameResolver, DetailService, EncryptionGateway, LoadOutcome, Reconciler,
    ReconcilerHandle, TimelineSnapshot,
};
pub use domain::{ActionItemEdit, DebriefFilters, DebriefRecord, DebriefStatus};
pub use error::{Result, SyncError};
pub use ingest::{DebriefUploader, PendingUploadQueue};
