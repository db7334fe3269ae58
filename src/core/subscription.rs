//! Live status subscriptions for in-flight debriefs.
//!
//! One background task per non-terminal record. Each pushed update is
//! merged (keeping the local display name) and forwarded as a
//! [`StatusEvent`]. The task ends on its own once the record is terminal,
//! or when cancelled. Cancelling is idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::adapters::RecordStore;
use crate::domain::lifecycle::apply_remote_update;
use crate::domain::DebriefRecord;

/// Why a subscription stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Record reached `Ready` or permanently `Failed`
    Terminal,
    Cancelled,
    /// The store closed the feed (or refused to open it)
    StreamEnded,
}

/// Events forwarded by subscription tasks
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// Merged record after a remote change
    Updated(DebriefRecord),

    /// Feed error; the last good state is kept
    Error { id: String, message: String },

    /// `token` identifies the subscription instance that closed
    Closed {
        id: String,
        token: u64,
        reason: CloseReason,
    },
}

/// Handle to one running subscription
pub struct StatusSubscription {
    id: String,
    token: u64,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatusSubscription {
    /// Start following `record`
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        record: DebriefRecord,
        token: u64,
        events: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        let id = record.id.clone();
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(follow(store, record, token, events, cancel_rx));
        Self {
            id,
            token,
            cancel,
            task,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Stop the subscription (safe to call more than once)
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Resolves once cancellation is requested or the handle is gone
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[instrument(skip_all, fields(id = %record.id))]
async fn follow(
    store: Arc<dyn RecordStore>,
    record: DebriefRecord,
    token: u64,
    events: mpsc::UnboundedSender<StatusEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let id = record.id.clone();
    let close = |reason: CloseReason| {
        debug!(?reason, "Status subscription closed");
        let _ = events.send(StatusEvent::Closed {
            id: id.clone(),
            token,
            reason,
        });
    };

    let opened = tokio::select! {
        _ = cancelled(&mut cancel_rx) => {
            close(CloseReason::Cancelled);
            return;
        }
        opened = store.subscribe(&id) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to open status feed: {}", e);
            let _ = events.send(StatusEvent::Error {
                id: id.clone(),
                message: e.to_string(),
            });
            close(CloseReason::StreamEnded);
            return;
        }
    };
    debug!("Status subscription opened");

    let mut current = record;
    let reason = loop {
        tokio::select! {
            _ = cancelled(&mut cancel_rx) => break CloseReason::Cancelled,
            item = stream.next() => match item {
                None => break CloseReason::StreamEnded,
                Some(Err(e)) => {
                    warn!("Status feed error: {}", e);
                    let _ = events.send(StatusEvent::Error {
                        id: id.clone(),
                        message: e.to_string(),
                    });
                }
                Some(Ok(incoming)) => match apply_remote_update(&current, incoming) {
                    Ok(next) => {
                        let changed = next != current;
                        current = next;
                        if changed {
                            let _ = events.send(StatusEvent::Updated(current.clone()));
                        }
                        if current.is_terminal() {
                            info!(status = %current.status, "Debrief reached terminal state");
                            break CloseReason::Terminal;
                        }
                    }
                    Err(e) => warn!("Ignoring remote update: {}", e),
                },
            },
        }
    };

    // Release the feed before announcing the close
    drop(stream);
    close(reason);
}

/// The set of live subscriptions, at most one per record
pub struct SubscriptionSet {
    store: Arc<dyn RecordStore>,
    events: mpsc::UnboundedSender<StatusEvent>,
    active: HashMap<String, StatusSubscription>,
    next_token: u64,
}

impl SubscriptionSet {
    pub fn new(store: Arc<dyn RecordStore>, events: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self {
            store,
            events,
            active: HashMap::new(),
            next_token: 0,
        }
    }

    /// Subscribe to `record` unless it is terminal or already followed.
    /// Returns whether a new subscription was started.
    pub fn ensure(&mut self, record: &DebriefRecord) -> bool {
        if record.is_terminal() {
            return false;
        }
        if let Some(existing) = self.active.get(&record.id) {
            if !existing.is_finished() {
                return false;
            }
        }
        self.next_token += 1;
        let sub = StatusSubscription::spawn(
            self.store.clone(),
            record.clone(),
            self.next_token,
            self.events.clone(),
        );
        self.active.insert(record.id.clone(), sub);
        true
    }

    /// Cancel one subscription; returns whether one was active
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.active.remove(id) {
            Some(sub) => {
                sub.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.active.len();
        for (_, sub) in self.active.drain() {
            sub.cancel();
        }
        count
    }

    /// Forget a subscription that closed itself; stale tokens are ignored
    pub fn remove(&mut self, id: &str, token: u64) -> bool {
        if self.active.get(id).is_some_and(|sub| sub.token() == token) {
            self.active.remove(id);
            return true;
        }
        false
    }

    pub fn contains(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryRecordStore;
    use crate::domain::DebriefStatus;
    use chrono::Utc;
    use std::time::Duration;

    fn processing() -> DebriefRecord {
        let mut r = DebriefRecord::new_local("u-1", "c-1", "Alice", Utc::now(), 10.0);
        r.status = DebriefStatus::Processing;
        r
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<StatusEvent>) -> StatusEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_for_feed(store: &MemoryRecordStore, id: &str) {
        for _ in 0..100 {
            if store.subscriber_count(id) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscription never attached");
    }

    #[tokio::test]
    async fn test_closes_on_ready_and_keeps_name() {
        let record = processing();
        let store = Arc::new(MemoryRecordStore::with_records([record.clone()]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = StatusSubscription::spawn(store.clone(), record.clone(), 1, tx);
        wait_for_feed(&store, &record.id).await;

        let mut ready = record.clone().with_contact_name("Unknown");
        ready.status = DebriefStatus::Ready;
        store.push_update(ready);

        let StatusEvent::Updated(updated) = next_event(&mut rx).await else {
            panic!("expected update");
        };
        assert_eq!(updated.status, DebriefStatus::Ready);
        assert_eq!(updated.contact_name, "Alice");

        let StatusEvent::Closed { reason, .. } = next_event(&mut rx).await else {
            panic!("expected close");
        };
        assert_eq!(reason, CloseReason::Terminal);
        assert_eq!(store.subscriber_count(&record.id), 0);
    }

    #[tokio::test]
    async fn test_error_keeps_subscription_open() {
        let record = processing();
        let store = Arc::new(MemoryRecordStore::with_records([record.clone()]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = StatusSubscription::spawn(store.clone(), record.clone(), 1, tx);
        wait_for_feed(&store, &record.id).await;

        store.push_feed_error(&record.id, "permission denied");
        assert!(matches!(next_event(&mut rx).await, StatusEvent::Error { .. }));
        assert!(!sub.is_finished());
        assert_eq!(store.subscriber_count(&record.id), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let record = processing();
        let store = Arc::new(MemoryRecordStore::with_records([record.clone()]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = StatusSubscription::spawn(store.clone(), record.clone(), 1, tx);
        wait_for_feed(&store, &record.id).await;

        sub.cancel();
        sub.cancel();
        let StatusEvent::Closed { reason, .. } = next_event(&mut rx).await else {
            panic!("expected close");
        };
        assert_eq!(reason, CloseReason::Cancelled);
        assert_eq!(store.subscriber_count(&record.id), 0);
    }

    #[tokio::test]
    async fn test_set_skips_terminal_and_duplicates() {
        let store = Arc::new(MemoryRecordStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut set = SubscriptionSet::new(store, tx);

        let mut ready = processing();
        ready.status = DebriefStatus::Ready;
        assert!(!set.ensure(&ready));

        let record = processing();
        assert!(set.ensure(&record));
        assert!(!set.ensure(&record));
        assert_eq!(set.len(), 1);

        assert!(!set.remove(&record.id, 99));
        assert!(set.cancel(&record.id));
        assert!(!set.cancel(&record.id));
        assert!(set.is_empty());
    }
}
