//! Domain types for the debrief sync engine.
//!
//! This module contains the core data structures:
//! - DebriefRecord: a recorded interaction and its derived artifacts
//! - Filters: timeline filters and the store query predicate
//! - Lifecycle: the per-record status state machine

pub mod debrief;
pub mod filters;
pub mod lifecycle;

// Re-export commonly used types
pub use debrief::{
    format_duration, instant_from_epoch, ActionItemEdit, AudioRef, DebriefRecord, DebriefStatus,
    DELETED_CONTACT, MAX_RETRIES, UNKNOWN_CONTACT,
};
pub use filters::{DateRange, DateRangeOption, DebriefFilters, RecordQuery};
pub use lifecycle::{LifecycleError, TransitionCause};
