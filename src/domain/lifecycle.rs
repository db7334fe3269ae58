//! Debrief lifecycle: `Created → Processing → {Ready, Failed}`.
//!
//! Status only changes through a remote change event, a local optimistic
//! write, or an explicit retry. Nothing here looks at the clock: a record
//! whose `next_retry_at` has passed is still `Failed` until something says
//! otherwise.

use thiserror::Error;

use super::debrief::{DebriefRecord, DebriefStatus, MAX_RETRIES};

/// Errors raised by lifecycle checks
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("Invalid status transition: {from} → {to}")]
    InvalidTransition {
        from: DebriefStatus,
        to: DebriefStatus,
    },

    #[error("Only failed debriefs can be retried (status is {0})")]
    NotFailed(DebriefStatus),

    #[error("Retry budget exhausted after {0} attempts")]
    RetryExhausted(u32),
}

/// What caused a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// Pushed by the status change feed
    Remote,

    /// Written optimistically on this device (upload ack, upload failure)
    Local,

    /// Explicit user- or backend-initiated retry
    Retry,
}

/// Check whether `from → to` is allowed for the given cause
pub fn check_transition(
    record: &DebriefRecord,
    to: DebriefStatus,
    cause: TransitionCause,
) -> Result<(), LifecycleError> {
    use DebriefStatus::*;

    let from = record.status;
    let allowed = match (from, to) {
        (a, b) if a == b => true,
        (Created, Processing | Ready | Failed) => cause != TransitionCause::Retry,
        (Processing, Ready | Failed) => cause != TransitionCause::Retry,
        // A scheduled backend retry shows up as a remote Failed → Processing
        (Failed, Processing) => match cause {
            TransitionCause::Retry => true,
            TransitionCause::Remote => record.is_retrying(),
            TransitionCause::Local => false,
        },
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition { from, to })
    }
}

/// Merge a pushed remote version into the in-memory record.
///
/// The remote copy wins for every field except `contact_name`, which is
/// always the locally resolved value.
pub fn apply_remote_update(
    current: &DebriefRecord,
    incoming: DebriefRecord,
) -> Result<DebriefRecord, LifecycleError> {
    check_transition(current, incoming.status, TransitionCause::Remote)?;
    Ok(incoming.with_contact_name(current.contact_name.clone()))
}

/// Explicit retry: `Failed → Processing`, consuming one attempt
pub fn retry(record: &DebriefRecord) -> Result<DebriefRecord, LifecycleError> {
    if record.status != DebriefStatus::Failed {
        return Err(LifecycleError::NotFailed(record.status));
    }
    if record.retry_count >= MAX_RETRIES {
        return Err(LifecycleError::RetryExhausted(record.retry_count));
    }
    check_transition(record, DebriefStatus::Processing, TransitionCause::Retry)?;

    let mut next = record.clone();
    next.status = DebriefStatus::Processing;
    next.retry_count += 1;
    next.next_retry_at = None;
    next.error_message = None;
    Ok(next)
}

/// Local failure of an upload: `Failed` with no scheduled retry
pub fn mark_upload_failed(
    record: &DebriefRecord,
    message: impl Into<String>,
) -> Result<DebriefRecord, LifecycleError> {
    check_transition(record, DebriefStatus::Failed, TransitionCause::Local)?;
    let mut next = record.clone();
    next.status = DebriefStatus::Failed;
    next.next_retry_at = None;
    next.error_message = Some(message.into());
    Ok(next)
}
