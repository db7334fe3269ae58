//! Core sync logic.
//!
//! This module contains:
//! - Reconciler: actor owning the merged timeline (pending ∪ fetched)
//! - Timeline: pure merge, search and day grouping
//! - Subscription: per-record status feeds until terminal
//! - Resolver: contact id → display name with a bounded cache
//! - Crypto: key cache and per-field / audio decryption
//! - Detail: single-record view and lazy audio playback

pub mod crypto;
pub mod detail;
pub mod reconciler;
pub mod resolver;
pub mod subscription;
pub mod timeline;

// Re-export commonly used types
pub use crypto::{CryptoError, DecryptedRecord, EncryptionGateway, FieldWarning, KeyMaterial};
pub use detail::{DetailService, PlaybackSource};
pub use reconciler::{LoadOutcome, Reconciler, ReconcilerHandle, TimelineSettings, TimelineSnapshot};
pub use resolver::ContactNameResolver;
pub use subscription::{CloseReason, StatusEvent, StatusSubscription, SubscriptionSet};
pub use timeline::{Clock, FixedClock, LocalClock, RecentContact, TimelineSection};
