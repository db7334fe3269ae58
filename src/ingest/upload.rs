//! Optimistic upload of new recordings.
//!
//! A recording becomes a pending debrief before any network call, so it is
//! visible (and durable) while offline. The ingest endpoint's answer then
//! either acknowledges the entry or marks it `Failed` for an explicit retry.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use super::queue::{PendingEntry, PendingQueueError, PendingUploadQueue};
use crate::adapters::{UploadAck, UploadEndpoint, UploadRequest};
use crate::domain::lifecycle::{self, check_transition, TransitionCause};
use crate::domain::{DebriefRecord, DebriefStatus};
use crate::error::{Result, SyncError};

/// A recording captured on this device
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub user_id: String,
    pub contact_id: String,
    pub contact_name: String,
    pub occurred_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub audio_path: PathBuf,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

/// How an upload attempt ended
#[derive(Debug)]
pub enum UploadOutcome {
    /// Accepted by the ingest endpoint; still pending until fetched
    Acknowledged(DebriefRecord),

    /// Kept locally as `Failed`
    Failed {
        record: DebriefRecord,
        error: SyncError,
    },
}

impl UploadOutcome {
    pub fn record(&self) -> &DebriefRecord {
        match self {
            Self::Acknowledged(record) | Self::Failed { record, .. } => record,
        }
    }
}

/// Creates pending debriefs and pushes them to the ingest endpoint
pub struct DebriefUploader {
    queue: Arc<PendingUploadQueue>,
    endpoint: Arc<dyn UploadEndpoint>,
}

impl DebriefUploader {
    pub fn new(queue: Arc<PendingUploadQueue>, endpoint: Arc<dyn UploadEndpoint>) -> Self {
        Self { queue, endpoint }
    }

    /// Enqueue a new recording and upload it
    #[instrument(skip(self, recording), fields(contact = %recording.contact_id))]
    pub async fn submit(&self, recording: NewRecording) -> Result<UploadOutcome> {
        let mut record = DebriefRecord::new_local(
            recording.user_id,
            recording.contact_id,
            recording.contact_name,
            recording.occurred_at,
            recording.duration_secs,
        );
        record.phone_number = recording.phone_number;
        record.email = recording.email;

        self.queue
            .enqueue(PendingEntry::new(record.clone(), Some(recording.audio_path.clone())))
            .await?;
        info!(id = %record.id, "Debrief queued for upload");

        self.upload(record, recording.audio_path).await
    }

    /// Explicitly retry a failed, unacknowledged upload
    #[instrument(skip(self))]
    pub async fn retry_upload(&self, id: &str) -> Result<UploadOutcome> {
        let entry = self
            .queue
            .get(id)
            .await
            .ok_or_else(|| PendingQueueError::NotFound(id.to_string()))?;
        if entry.acknowledged {
            return Err(SyncError::invalid_request(format!(
                "Debrief {} was already uploaded",
                id
            )));
        }
        let audio_path = entry.audio_path.clone().ok_or_else(|| {
            SyncError::invalid_request(format!("No local recording for debrief {}", id))
        })?;

        // An attempt interrupted before the endpoint answered counts as failed
        let mut record = entry.record;
        if record.status != DebriefStatus::Failed {
            warn!(status = %record.status, "Resuming interrupted upload");
            record = lifecycle::mark_upload_failed(&record, "Upload interrupted")?;
        }

        // Only the attempt is persisted; the status moves once the endpoint acks
        let retried = lifecycle::retry(&record)?;
        let mut attempt = record;
        attempt.retry_count = retried.retry_count;
        self.queue.update(attempt.clone()).await?;
        info!(attempt = attempt.retry_count, "Retrying upload");

        self.upload(attempt, audio_path).await
    }

    async fn upload(&self, record: DebriefRecord, audio_path: PathBuf) -> Result<UploadOutcome> {
        let request = UploadRequest {
            client_id: record.id.clone(),
            user_id: record.user_id.clone(),
            contact_id: record.contact_id.clone(),
            audio_path,
            duration_secs: record.duration_secs,
        };

        match self.endpoint.create_debrief(&request).await {
            Ok(ack) => self.acknowledge(record, ack).await,
            Err(error) => {
                warn!(id = %record.id, "Upload failed: {}", error);
                let failed = lifecycle::mark_upload_failed(&record, error.user_message())?;
                self.queue.update(failed.clone()).await?;
                Ok(UploadOutcome::Failed {
                    record: failed,
                    error,
                })
            }
        }
    }

    async fn acknowledge(&self, mut record: DebriefRecord, ack: UploadAck) -> Result<UploadOutcome> {
        // The endpoint only ever answers Created or Processing
        let status = match ack.status {
            DebriefStatus::Created | DebriefStatus::Processing => ack.status,
            other => {
                warn!(id = %ack.id, status = %other, "Unexpected upload status, treating as processing");
                DebriefStatus::Processing
            }
        };
        if record.status == DebriefStatus::Failed {
            // A retried upload restarts server-side processing
            check_transition(&record, DebriefStatus::Processing, TransitionCause::Retry)?;
            record.status = status;
            record.next_retry_at = None;
            record.error_message = None;
            self.queue.update(record.clone()).await?;
        } else {
            check_transition(&record, status, TransitionCause::Local)?;
        }

        let mut id = record.id.clone();
        if ack.id != record.id {
            self.queue.rekey(&record.id, &ack.id).await?;
            id = ack.id;
        }

        let entry = self.queue.mark_acknowledged(&id, status).await?;
        info!(%id, status = %status, "Upload acknowledged");
        Ok(UploadOutcome::Acknowledged(entry.record))
    }
}
