//! Timeline reconciler.
//!
//! A single actor task owns all timeline state: the fetched pages, the
//! cursor, the pending entries and the search query. Everything else talks
//! to it through a [`ReconcilerHandle`]:
//!
//! - commands arrive on an `mpsc` channel and reply on a `oneshot`
//! - network calls (page fetch, write-through, delete) run in spawned tasks
//!   that post their results back to the actor
//! - each state change publishes an immutable [`TimelineSnapshot`] on a
//!   `watch` channel
//!
//! Page results carry the generation they were started in; a reset bumps
//! the generation so late results from before the reset are discarded.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};

use super::resolver::ContactNameResolver;
use super::subscription::{StatusEvent, SubscriptionSet};
use super::timeline::{
    filter_search, group, merge, recent_contacts, should_load_more, Clock, LocalClock,
    RecentContact, TimelineSection,
};
use crate::adapters::{PageCursor, RecordPage, RecordStore};
use crate::domain::{ActionItemEdit, DebriefFilters, DebriefRecord, DebriefStatus, RecordQuery};
use crate::error::{Result, SyncError};
use crate::ingest::{PendingEntry, PendingUploadQueue, QueueChange};

const COMMAND_CAPACITY: usize = 64;
const MAX_WARNINGS: usize = 20;

/// Timeline tunables
#[derive(Debug, Clone)]
pub struct TimelineSettings {
    /// Records per page
    pub page_size: usize,

    /// Load the next page when this close to the end
    pub load_more_threshold: usize,

    pub search_debounce: Duration,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            page_size: 20,
            load_more_threshold: 5,
            search_debounce: Duration::from_millis(300),
        }
    }
}

/// What a page request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was fetched and merged
    Loaded { count: usize, has_more: bool },

    /// Another fetch is outstanding; nothing was started
    AlreadyLoading,

    /// The fetch finished after a reset and was dropped
    Discarded,

    /// No more pages
    Exhausted,

    /// Not close enough to the end to load more
    NotNeeded,
}

/// Immutable view of the timeline
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimelineSnapshot {
    pub sections: Vec<TimelineSection>,

    /// Merged, search-filtered records in display order
    pub records: Vec<DebriefRecord>,

    pub has_more: bool,
    pub is_loading: bool,

    /// User-facing message of the last failed operation
    pub last_error: Option<String>,

    /// Non-fatal problems (feed errors), most recent last
    pub warnings: Vec<String>,

    pub recent_contacts: Vec<RecentContact>,
    pub search_query: String,
    pub filters: DebriefFilters,
    pub pending_count: usize,
    pub active_subscriptions: usize,
}

impl TimelineSnapshot {
    pub fn find(&self, id: &str) -> Option<&DebriefRecord> {
        self.records.iter().find(|r| r.id == id)
    }
}

enum Command {
    LoadPage {
        user_id: String,
        filters: DebriefFilters,
        reset: bool,
        respond: oneshot::Sender<Result<LoadOutcome>>,
    },
    Search {
        query: String,
    },
    SearchNow {
        query: String,
        respond: oneshot::Sender<()>,
    },
    LoadMoreIfNeeded {
        id: String,
        respond: oneshot::Sender<Result<LoadOutcome>>,
    },
    EditActionItems {
        id: String,
        edit: ActionItemEdit,
        respond: oneshot::Sender<Result<Vec<String>>>,
    },
    Delete {
        id: String,
        respond: oneshot::Sender<Result<()>>,
    },
    CancelSubscription {
        id: String,
        respond: oneshot::Sender<bool>,
    },
    CancelSubscriptions {
        respond: oneshot::Sender<usize>,
    },
    RefreshContacts {
        respond: oneshot::Sender<()>,
    },
    Shutdown {
        respond: oneshot::Sender<()>,
    },
}

/// Results posted back by spawned tasks
enum Internal {
    PageLoaded {
        generation: u64,
        result: Result<RecordPage>,
    },
    SearchDue {
        seq: u64,
    },
    EditFinished {
        id: String,
        items: Vec<String>,
        previous: Option<Vec<String>>,
        result: Result<()>,
        respond: oneshot::Sender<Result<Vec<String>>>,
    },
    DeleteFinished {
        id: String,
        status: Option<DebriefStatus>,
        result: Result<()>,
        respond: oneshot::Sender<Result<()>>,
    },
    NamesResolved {
        generation: u64,
        records: Vec<DebriefRecord>,
    },
}

struct InFlight {
    generation: u64,
    respond: Option<oneshot::Sender<Result<LoadOutcome>>>,
}

/// Builder for the reconciler actor
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    queue: Arc<PendingUploadQueue>,
    resolver: Arc<ContactNameResolver>,
    clock: Arc<dyn Clock>,
    settings: TimelineSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<PendingUploadQueue>,
        resolver: Arc<ContactNameResolver>,
    ) -> Self {
        Self {
            store,
            queue,
            resolver,
            clock: Arc::new(LocalClock),
            settings: TimelineSettings::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: TimelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Start the actor task
    pub fn spawn(self) -> ReconcilerHandle {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(TimelineSnapshot::default());
        let queue_rx = self.queue.subscribe();

        let actor = Actor {
            subscriptions: SubscriptionSet::new(self.store.clone(), status_tx),
            store: self.store,
            queue: self.queue,
            resolver: self.resolver,
            clock: self.clock,
            settings: self.settings,
            internal,
            snapshots,
            state: TimelineState::default(),
        };
        tokio::spawn(actor.run(command_rx, internal_rx, status_rx, queue_rx));

        ReconcilerHandle {
            commands,
            snapshots: snapshot_rx,
        }
    }
}

/// Cloneable client of the reconciler actor
#[derive(Clone)]
pub struct ReconcilerHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<TimelineSnapshot>,
}

impl ReconcilerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(build(respond))
            .await
            .map_err(|_| SyncError::ReconcilerClosed)?;
        rx.await.map_err(|_| SyncError::ReconcilerClosed)
    }

    /// Fetch the next page (or the first one after `reset`)
    pub async fn load_page(
        &self,
        user_id: &str,
        filters: DebriefFilters,
        reset: bool,
    ) -> Result<LoadOutcome> {
        self.request(|respond| Command::LoadPage {
            user_id: user_id.to_string(),
            filters,
            reset,
            respond,
        })
        .await?
    }

    /// Debounced search; only the last query in a burst is applied
    pub async fn search(&self, query: &str) -> Result<()> {
        self.commands
            .send(Command::Search {
                query: query.to_string(),
            })
            .await
            .map_err(|_| SyncError::ReconcilerClosed)
    }

    /// Apply a search query immediately
    pub async fn search_now(&self, query: &str) -> Result<()> {
        self.request(|respond| Command::SearchNow {
            query: query.to_string(),
            respond,
        })
        .await
    }

    /// Load the next page if `id` is near the end of the loaded records
    pub async fn load_more_if_needed(&self, id: &str) -> Result<LoadOutcome> {
        self.request(|respond| Command::LoadMoreIfNeeded {
            id: id.to_string(),
            respond,
        })
        .await?
    }

    /// Edit a record's action items and write them through to the store
    pub async fn edit_action_items(&self, id: &str, edit: ActionItemEdit) -> Result<Vec<String>> {
        self.request(|respond| Command::EditActionItems {
            id: id.to_string(),
            edit,
            respond,
        })
        .await?
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.request(|respond| Command::Delete {
            id: id.to_string(),
            respond,
        })
        .await?
    }

    pub async fn cancel_subscription(&self, id: &str) -> Result<bool> {
        self.request(|respond| Command::CancelSubscription {
            id: id.to_string(),
            respond,
        })
        .await
    }

    /// Cancel every live status subscription (view torn down)
    pub async fn cancel_subscriptions(&self) -> Result<usize> {
        self.request(|respond| Command::CancelSubscriptions { respond })
            .await
    }

    /// Clear the contact name cache and re-resolve the loaded records
    pub async fn refresh_contacts(&self) -> Result<()> {
        self.request(|respond| Command::RefreshContacts { respond })
            .await
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TimelineSnapshot> {
        self.snapshots.clone()
    }

    /// Wait for the first snapshot satisfying `predicate`
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&TimelineSnapshot) -> bool,
    ) -> Result<TimelineSnapshot> {
        let mut rx = self.snapshots.clone();
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if predicate(&snapshot) {
                    return Ok(snapshot.clone());
                }
            }
            rx.changed()
                .await
                .map_err(|_| SyncError::ReconcilerClosed)?;
        }
    }

    /// Stop the actor and cancel its subscriptions
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|respond| Command::Shutdown { respond }).await
    }
}

#[derive(Default)]
struct TimelineState {
    user_id: Option<String>,
    filters: DebriefFilters,
    /// Resolved once per reset so relative ranges hold still across pages
    query: RecordQuery,
    cursor: Option<PageCursor>,
    fetched: Vec<DebriefRecord>,
    pending: Vec<PendingEntry>,
    visible: Vec<DebriefRecord>,
    sections: Vec<TimelineSection>,
    has_more: bool,
    exhausted: bool,
    generation: u64,
    in_flight: Option<InFlight>,
    last_error: Option<String>,
    warnings: Vec<String>,
    search_query: String,
    search_seq: u64,
    search_pending: Option<String>,
    recent_contacts: Vec<RecentContact>,
}

impl TimelineState {
    fn find(&self, id: &str) -> Option<&DebriefRecord> {
        self.fetched
            .iter()
            .find(|r| r.id == id)
            .or_else(|| self.pending_entry(id).map(|e| &e.record))
    }

    fn pending_entry(&self, id: &str) -> Option<&PendingEntry> {
        self.pending.iter().find(|e| e.record.id == id)
    }

    fn push_warning(&mut self, warning: String) {
        self.warnings.push(warning);
        if self.warnings.len() > MAX_WARNINGS {
            self.warnings.remove(0);
        }
    }
}

struct Actor {
    store: Arc<dyn RecordStore>,
    queue: Arc<PendingUploadQueue>,
    resolver: Arc<ContactNameResolver>,
    clock: Arc<dyn Clock>,
    settings: TimelineSettings,
    subscriptions: SubscriptionSet,
    internal: mpsc::UnboundedSender<Internal>,
    snapshots: watch::Sender<TimelineSnapshot>,
    state: TimelineState,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut status: mpsc::UnboundedReceiver<StatusEvent>,
        mut queue_changes: broadcast::Receiver<QueueChange>,
    ) {
        self.refresh_pending().await;
        self.publish();
        debug!("Timeline reconciler started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { respond }) => {
                        self.subscriptions.cancel_all();
                        let _ = respond.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.subscriptions.cancel_all();
                        break;
                    }
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
                Some(event) = status.recv() => self.handle_status(event).await,
                change = queue_changes.recv() => match change {
                    Ok(change) => {
                        debug!(id = change.id(), "Pending queue changed");
                        self.refresh_pending().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Pending queue notifications lagged");
                        self.refresh_pending().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
            self.publish();
        }

        debug!("Timeline reconciler stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::LoadPage {
                user_id,
                filters,
                reset,
                respond,
            } => self.load_page(user_id, filters, reset, respond).await,
            Command::Search { query } => self.schedule_search(query),
            Command::SearchNow { query, respond } => {
                self.state.search_seq += 1;
                self.state.search_pending = None;
                self.apply_search(query);
                self.reply(respond, ());
            }
            Command::LoadMoreIfNeeded { id, respond } => self.load_more_if_needed(&id, respond),
            Command::EditActionItems { id, edit, respond } => {
                self.edit_action_items(id, edit, respond).await
            }
            Command::Delete { id, respond } => self.delete(id, respond).await,
            Command::CancelSubscription { id, respond } => {
                let cancelled = self.subscriptions.cancel(&id);
                self.reply(respond, cancelled);
            }
            Command::CancelSubscriptions { respond } => {
                let count = self.subscriptions.cancel_all();
                info!(count, "Status subscriptions cancelled");
                self.reply(respond, count);
            }
            Command::RefreshContacts { respond } => {
                self.refresh_contacts().await;
                self.reply(respond, ());
            }
            // Handled by the run loop
            Command::Shutdown { respond } => {
                let _ = respond.send(());
            }
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::PageLoaded { generation, result } => {
                self.page_loaded(generation, result).await
            }
            Internal::SearchDue { seq } => {
                if seq == self.state.search_seq {
                    if let Some(query) = self.state.search_pending.take() {
                        self.apply_search(query);
                    }
                }
            }
            Internal::EditFinished {
                id,
                items,
                previous,
                result,
                respond,
            } => self.edit_finished(id, items, previous, result, respond).await,
            Internal::DeleteFinished {
                id,
                status,
                result,
                respond,
            } => self.delete_finished(id, status, result, respond).await,
            Internal::NamesResolved {
                generation,
                records,
            } => {
                if generation != self.state.generation {
                    return;
                }
                for resolved in records {
                    if let Some(record) = self.state.fetched.iter_mut().find(|r| r.id == resolved.id) {
                        record.contact_name = resolved.contact_name;
                    }
                }
                self.recompute().await;
            }
        }
    }

    #[instrument(skip(self, filters, respond))]
    async fn load_page(
        &mut self,
        user_id: String,
        filters: DebriefFilters,
        reset: bool,
        respond: oneshot::Sender<Result<LoadOutcome>>,
    ) {
        let context_changed =
            self.state.user_id.as_deref() != Some(user_id.as_str()) || self.state.filters != filters;
        if reset || context_changed {
            self.reset(user_id, filters).await;
        } else if self.state.in_flight.is_some() {
            debug!("Page fetch already in flight");
            self.reply(respond, Ok(LoadOutcome::AlreadyLoading));
            return;
        } else if self.state.exhausted {
            self.reply(respond, Ok(LoadOutcome::Exhausted));
            return;
        }

        self.start_fetch(Some(respond));
    }

    async fn reset(&mut self, user_id: String, filters: DebriefFilters) {
        self.state.generation += 1;
        if let Some(stale) = self.state.in_flight.take() {
            debug!(generation = stale.generation, "Dropping in-flight page after reset");
            if let Some(respond) = stale.respond {
                self.reply(respond, Ok(LoadOutcome::Discarded));
            }
        }

        let pending_ids: HashSet<String> =
            self.state.pending.iter().map(|e| e.record.id.clone()).collect();
        for record in &self.state.fetched {
            if !pending_ids.contains(&record.id) {
                self.subscriptions.cancel(&record.id);
            }
        }

        self.state.user_id = Some(user_id);
        self.state.query = filters.to_query(&self.clock.now());
        self.state.filters = filters;
        self.state.cursor = None;
        self.state.fetched.clear();
        self.state.has_more = false;
        self.state.exhausted = false;
        self.state.last_error = None;
        self.state.recent_contacts.clear();
        self.recompute().await;
    }

    fn current_query(&self) -> RecordQuery {
        self.state.query.clone()
    }

    fn start_fetch(&mut self, respond: Option<oneshot::Sender<Result<LoadOutcome>>>) {
        let Some(user_id) = self.state.user_id.clone() else {
            if let Some(respond) = respond {
                self.reply(respond, Err(SyncError::invalid_request("No user loaded")));
            }
            return;
        };

        let generation = self.state.generation;
        self.state.in_flight = Some(InFlight {
            generation,
            respond,
        });

        let store = self.store.clone();
        let resolver = self.resolver.clone();
        let internal = self.internal.clone();
        let query = self.current_query();
        let cursor = self.state.cursor.clone();
        let limit = self.settings.page_size;

        tokio::spawn(async move {
            let result: Result<RecordPage> = async {
                let page = store
                    .fetch_page(&user_id, &query, cursor.as_ref(), limit)
                    .await?;
                let records = resolver.resolve_many(page.records).await;
                Ok(RecordPage {
                    records,
                    next_cursor: page.next_cursor,
                })
            }
            .await;
            let _ = internal.send(Internal::PageLoaded { generation, result });
        });
    }

    async fn page_loaded(&mut self, generation: u64, result: Result<RecordPage>) {
        if generation != self.state.generation {
            warn!(generation, current = self.state.generation, "Discarding stale page");
            return;
        }
        let respond = self.state.in_flight.take().and_then(|f| f.respond);

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!("Page fetch failed: {}", e);
                self.state.last_error = Some(e.user_message());
                if let Some(respond) = respond {
                    self.reply(respond, Err(e));
                }
                return;
            }
        };

        let count = page.records.len();
        for record in page.records {
            match self.state.fetched.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => self.state.fetched.push(record),
            }
        }
        self.state.cursor = page.next_cursor;
        self.state.has_more = count == self.settings.page_size && self.state.cursor.is_some();
        self.state.exhausted = !self.state.has_more;
        self.state.last_error = None;
        info!(count, has_more = self.state.has_more, "Page loaded");

        if self.state.recent_contacts.is_empty() && !self.state.filters.is_active() {
            self.state.recent_contacts = recent_contacts(&self.state.fetched);
        }

        // A confirmed upload may still be followed from its pending copy
        for record in &self.state.fetched {
            if record.is_terminal() {
                self.subscriptions.cancel(&record.id);
            } else {
                self.subscriptions.ensure(record);
            }
        }

        self.recompute().await;

        if let Some(respond) = respond {
            self.reply(respond, Ok(LoadOutcome::Loaded {
                count,
                has_more: self.state.has_more,
            }));
        }
    }

    fn load_more_if_needed(&mut self, id: &str, respond: oneshot::Sender<Result<LoadOutcome>>) {
        let Some(index) = self.state.visible.iter().position(|r| r.id == id) else {
            self.reply(respond, Ok(LoadOutcome::NotNeeded));
            return;
        };
        let near_end = should_load_more(
            index,
            self.state.visible.len(),
            self.settings.load_more_threshold,
        );
        if !near_end || !self.state.has_more {
            self.reply(respond, Ok(LoadOutcome::NotNeeded));
            return;
        }
        if self.state.in_flight.is_some() {
            self.reply(respond, Ok(LoadOutcome::AlreadyLoading));
            return;
        }
        debug!(index, "Loading more");
        self.start_fetch(Some(respond));
    }

    fn schedule_search(&mut self, query: String) {
        self.state.search_seq += 1;
        self.state.search_pending = Some(query);

        let seq = self.state.search_seq;
        let delay = self.settings.search_debounce;
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::SearchDue { seq });
        });
    }

    fn apply_search(&mut self, query: String) {
        if query == self.state.search_query {
            return;
        }
        self.state.search_query = query;
        self.regroup();
    }

    #[instrument(skip(self, edit, respond))]
    async fn edit_action_items(
        &mut self,
        id: String,
        edit: ActionItemEdit,
        respond: oneshot::Sender<Result<Vec<String>>>,
    ) {
        let Some(user_id) = self.state.user_id.clone() else {
            self.reply(respond, Err(SyncError::invalid_request("No user loaded")));
            return;
        };
        if self.state.pending_entry(&id).is_some_and(|e| !e.acknowledged) {
            self.reply(respond, Err(SyncError::invalid_request(
                "Debrief has not been uploaded yet",
            )));
            return;
        }
        let Some(record) = self.state.find(&id) else {
            self.reply(respond, Err(SyncError::NotFound));
            return;
        };

        let previous = record.action_items.clone();
        let Some(items) = edit.apply(record.action_items()) else {
            self.reply(respond, Err(SyncError::invalid_request(format!(
                "Action item index out of range ({} items)",
                record.action_items().len()
            ))));
            return;
        };

        // Shown immediately, rolled back if the write fails
        self.set_action_items(&id, Some(items.clone())).await;

        let store = self.store.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = store.update_action_items(&id, &items, &user_id).await;
            let _ = internal.send(Internal::EditFinished {
                id,
                items,
                previous,
                result,
                respond,
            });
        });
    }

    async fn edit_finished(
        &mut self,
        id: String,
        items: Vec<String>,
        previous: Option<Vec<String>>,
        result: Result<()>,
        respond: oneshot::Sender<Result<Vec<String>>>,
    ) {
        match result {
            Ok(()) => {
                debug!(%id, count = items.len(), "Action items saved");
                self.reply(respond, Ok(items));
            }
            Err(e) => {
                warn!(%id, "Failed to save action items: {}", e);
                // Only roll back if no later edit replaced ours
                let unchanged = self
                    .state
                    .find(&id)
                    .is_some_and(|r| r.action_items.as_ref() == Some(&items));
                if unchanged {
                    self.set_action_items(&id, previous).await;
                }
                self.state.last_error = Some(e.user_message());
                self.reply(respond, Err(e));
            }
        }
    }

    async fn set_action_items(&mut self, id: &str, items: Option<Vec<String>>) {
        if let Some(record) = self.state.fetched.iter_mut().find(|r| r.id == id) {
            record.action_items = items.clone();
        }
        if let Some(entry) = self.state.pending.iter_mut().find(|e| e.record.id == id) {
            entry.record.action_items = items;
            let record = entry.record.clone();
            if let Err(e) = self.queue.update(record).await {
                warn!(%id, "Failed to persist pending edit: {}", e);
            }
        }
        self.recompute().await;
    }

    #[instrument(skip(self, respond))]
    async fn delete(&mut self, id: String, respond: oneshot::Sender<Result<()>>) {
        // Never uploaded: nothing exists remotely
        if self.state.pending_entry(&id).is_some_and(|e| !e.acknowledged) {
            info!("Deleting local-only debrief");
            let result = self.remove_locally(&id).await;
            self.reply(respond, result);
            return;
        }

        let status = self.state.find(&id).map(|r| r.status);
        let store = self.store.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = store.delete(&id).await;
            let _ = internal.send(Internal::DeleteFinished {
                id,
                status,
                result,
                respond,
            });
        });
    }

    async fn delete_finished(
        &mut self,
        id: String,
        status: Option<DebriefStatus>,
        result: Result<()>,
        respond: oneshot::Sender<Result<()>>,
    ) {
        let status = self.state.find(&id).map(|r| r.status).or(status);
        let outcome = match result {
            Ok(()) => {
                info!(%id, "Debrief deleted");
                self.remove_locally(&id).await
            }
            Err(e) if status == Some(DebriefStatus::Failed) => {
                warn!(%id, "Remote delete failed for failed debrief, removing locally: {}", e);
                self.remove_locally(&id).await
            }
            Err(e) => {
                warn!(%id, "Delete failed: {}", e);
                self.state.last_error = Some(e.user_message());
                Err(e)
            }
        };
        self.reply(respond, outcome);
    }

    async fn remove_locally(&mut self, id: &str) -> Result<()> {
        self.subscriptions.cancel(id);
        self.state.fetched.retain(|r| r.id != id);
        self.queue.dequeue(id).await?;
        self.state.pending.retain(|e| e.record.id != id);
        self.recompute().await;
        Ok(())
    }

    async fn handle_status(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::Updated(record) => {
                debug!(id = %record.id, status = %record.status, "Status update");
                // The actor's name is the latest resolution; the feed may hold an older one
                if let Some(existing) = self.state.fetched.iter_mut().find(|r| r.id == record.id) {
                    *existing = record.clone().with_contact_name(existing.contact_name.clone());
                }
                if let Some(entry) = self.state.pending.iter_mut().find(|e| e.record.id == record.id) {
                    let updated = record.with_contact_name(entry.record.contact_name.clone());
                    entry.record = updated.clone();
                    if let Err(e) = self.queue.update(updated).await {
                        warn!("Failed to persist status update: {}", e);
                    }
                }
                self.recompute().await;
            }
            StatusEvent::Error { id, message } => {
                self.state
                    .push_warning(format!("Status updates for {} failed: {}", id, message));
            }
            StatusEvent::Closed { id, token, reason } => {
                if self.subscriptions.remove(&id, token) {
                    debug!(%id, ?reason, "Subscription finished");
                }
            }
        }
    }

    async fn refresh_pending(&mut self) {
        self.state.pending = self.queue.entries().await;
        let in_progress: Vec<DebriefRecord> = self
            .state
            .pending
            .iter()
            .filter(|e| e.acknowledged && !e.record.is_terminal())
            .map(|e| e.record.clone())
            .collect();
        for record in &in_progress {
            self.subscriptions.ensure(record);
        }
        self.recompute().await;
    }

    async fn refresh_contacts(&mut self) {
        self.resolver.clear_cache().await;

        let records = self.state.fetched.clone();
        if records.is_empty() {
            return;
        }
        let resolver = self.resolver.clone();
        let internal = self.internal.clone();
        let generation = self.state.generation;
        tokio::spawn(async move {
            let records = resolver.resolve_many(records).await;
            let _ = internal.send(Internal::NamesResolved {
                generation,
                records,
            });
        });
    }

    /// Re-merge pending and fetched; confirmed pending entries are dequeued
    async fn recompute(&mut self) {
        let fetched_ids: HashSet<&str> = self.state.fetched.iter().map(|r| r.id.as_str()).collect();
        let confirmed: Vec<String> = self
            .state
            .pending
            .iter()
            .filter(|e| fetched_ids.contains(e.record.id.as_str()))
            .map(|e| e.record.id.clone())
            .collect();

        for id in &confirmed {
            debug!(%id, "Pending debrief confirmed by store");
            if let Err(e) = self.queue.dequeue(id).await {
                warn!(%id, "Failed to dequeue confirmed debrief: {}", e);
            }
        }
        if !confirmed.is_empty() {
            self.state.pending.retain(|e| !confirmed.contains(&e.record.id));
        }

        self.regroup();
    }

    /// Merge, search and group without touching the queue
    fn regroup(&mut self) {
        let query = self.current_query();
        let pending: Vec<DebriefRecord> = self
            .state
            .pending
            .iter()
            .map(|e| e.record.clone())
            .filter(|r| query.matches(r))
            .collect();

        let merged = merge(&pending, &self.state.fetched).records;
        self.state.visible = filter_search(&merged, &self.state.search_query);
        self.state.sections = group(&self.state.visible, &self.clock.now());
    }

    /// Publish first so the caller sees the state its reply describes
    fn reply<T>(&self, respond: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = respond.send(value);
    }

    fn publish(&self) {
        let state = &self.state;
        let snapshot = TimelineSnapshot {
            sections: state.sections.clone(),
            records: state.visible.clone(),
            has_more: state.has_more,
            is_loading: state.in_flight.is_some(),
            last_error: state.last_error.clone(),
            warnings: state.warnings.clone(),
            recent_contacts: state.recent_contacts.clone(),
            search_query: state.search_query.clone(),
            filters: state.filters.clone(),
            pending_count: state.pending.len(),
            active_subscriptions: self.subscriptions.len(),
        };
        self.snapshots.send_replace(snapshot);
    }
}
