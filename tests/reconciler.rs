//! Reconciler Integration Tests
//!
//! Drives the timeline actor through its handle with in-memory
//! collaborators: pagination, merge with the pending queue, grouping,
//! search, edits, deletes and status subscriptions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use debrief_sync::adapters::{MemoryAddressBook, MemoryRecordStore};
use debrief_sync::core::{
    Clock, ContactNameResolver, FixedClock, LoadOutcome, Reconciler, ReconcilerHandle, TimelineSettings,
    TimelineSnapshot,
};
use debrief_sync::domain::{
    ActionItemEdit, DateRangeOption, DebriefFilters, DebriefRecord, DebriefStatus,
};
use debrief_sync::ingest::{PendingEntry, PendingUploadQueue};
use debrief_sync::SyncError;
use tokio_test::assert_ok;

const USER: &str = "u-1";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

fn record(id: &str, contact: &str, minutes_ago: i64, status: DebriefStatus) -> DebriefRecord {
    let mut r = DebriefRecord::new_local(
        USER,
        contact,
        "",
        now() - chrono::Duration::minutes(minutes_ago),
        60.0,
    );
    r.id = id.to_string();
    r.status = status;
    r
}

fn ready(id: &str, minutes_ago: i64) -> DebriefRecord {
    record(id, "c-1", minutes_ago, DebriefStatus::Ready)
}

struct Harness {
    store: Arc<MemoryRecordStore>,
    queue: Arc<PendingUploadQueue>,
    book: Arc<MemoryAddressBook>,
    timeline: ReconcilerHandle,
}

fn settings() -> TimelineSettings {
    TimelineSettings {
        page_size: 3,
        load_more_threshold: 1,
        search_debounce: Duration::from_millis(50),
    }
}

fn harness(records: Vec<DebriefRecord>) -> Harness {
    harness_with_queue(records, PendingUploadQueue::in_memory())
}

fn harness_with_queue(records: Vec<DebriefRecord>, queue: PendingUploadQueue) -> Harness {
    let store = Arc::new(MemoryRecordStore::with_records(records));
    let queue = Arc::new(queue);
    let book = Arc::new(MemoryAddressBook::with_contacts([("c-1", "Alice"), ("c-2", "Bob")]));
    let resolver = Arc::new(ContactNameResolver::new(book.clone(), 100));
    let timeline = Reconciler::new(store.clone(), queue.clone(), resolver)
        .with_clock(Arc::new(FixedClock(now().fixed_offset())))
        .with_settings(settings())
        .spawn();
    Harness {
        store,
        queue,
        book,
        timeline,
    }
}

async fn wait_for(
    timeline: &ReconcilerHandle,
    predicate: impl FnMut(&TimelineSnapshot) -> bool,
) -> TimelineSnapshot {
    tokio::time::timeout(Duration::from_secs(2), timeline.wait_for(predicate))
        .await
        .expect("timed out waiting for snapshot")
        .unwrap()
}

async fn wait_for_feed(store: &MemoryRecordStore, id: &str) {
    for _ in 0..200 {
        if store.subscriber_count(id) > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("status feed for {} never attached", id);
}

fn ids(snapshot: &TimelineSnapshot) -> Vec<String> {
    snapshot.records.iter().map(|r| r.id.clone()).collect()
}

#[tokio::test]
async fn test_pagination_terminates() {
    let records: Vec<_> = (0..7).map(|i| ready(&format!("d-{}", i), i * 10)).collect();
    let h = harness(records);
    let filters = DebriefFilters::default();

    let first = h.timeline.load_page(USER, filters.clone(), true).await.unwrap();
    assert_eq!(first, LoadOutcome::Loaded { count: 3, has_more: true });
    let second = h.timeline.load_page(USER, filters.clone(), false).await.unwrap();
    assert_eq!(second, LoadOutcome::Loaded { count: 3, has_more: true });
    let third = h.timeline.load_page(USER, filters.clone(), false).await.unwrap();
    assert_eq!(third, LoadOutcome::Loaded { count: 1, has_more: false });

    // No further fetch once exhausted
    let fourth = h.timeline.load_page(USER, filters, false).await.unwrap();
    assert_eq!(fourth, LoadOutcome::Exhausted);
    assert_eq!(h.store.fetch_page_calls(), 3);

    let snapshot = h.timeline.snapshot();
    assert!(!snapshot.has_more);
    assert_eq!(
        ids(&snapshot),
        ["d-0", "d-1", "d-2", "d-3", "d-4", "d-5", "d-6"]
    );
}

#[tokio::test]
async fn test_second_fetch_while_in_flight_is_ignored() {
    let h = harness((0..5).map(|i| ready(&format!("d-{}", i), i)).collect());
    h.store.set_fetch_delay(Some(Duration::from_millis(200)));

    let timeline = h.timeline.clone();
    let first = tokio::spawn(async move {
        timeline
            .load_page(USER, DebriefFilters::default(), true)
            .await
    });
    wait_for(&h.timeline, |s| s.is_loading).await;

    let second = h
        .timeline
        .load_page(USER, DebriefFilters::default(), false)
        .await
        .unwrap();
    assert_eq!(second, LoadOutcome::AlreadyLoading);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first, LoadOutcome::Loaded { count: 3, has_more: true });
    assert_eq!(h.store.fetch_page_calls(), 1);
    assert_eq!(h.timeline.snapshot().records.len(), 3);
}

#[tokio::test]
async fn test_reset_discards_stale_page() {
    let h = harness((0..5).map(|i| ready(&format!("d-{}", i), i)).collect());
    h.store.set_fetch_delay(Some(Duration::from_millis(150)));

    let timeline = h.timeline.clone();
    let stale = tokio::spawn(async move {
        timeline
            .load_page(USER, DebriefFilters::default(), true)
            .await
    });
    wait_for(&h.timeline, |s| s.is_loading).await;

    let fresh = h
        .timeline
        .load_page(USER, DebriefFilters::default(), true)
        .await
        .unwrap();
    assert_eq!(stale.await.unwrap().unwrap(), LoadOutcome::Discarded);
    assert_eq!(fresh, LoadOutcome::Loaded { count: 3, has_more: true });

    // The stale page never landed, so nothing is duplicated
    let snapshot = h.timeline.snapshot();
    assert_eq!(ids(&snapshot), ["d-0", "d-1", "d-2"]);
    assert!(!snapshot.is_loading);
}

#[tokio::test]
async fn test_load_error_keeps_loaded_pages() {
    let h = harness((0..5).map(|i| ready(&format!("d-{}", i), i)).collect());
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    h.store
        .fail_next_page(SyncError::NetworkUnavailable("offline".to_string()));
    let err = h
        .timeline
        .load_page(USER, DebriefFilters::default(), false)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let snapshot = h.timeline.snapshot();
    assert_eq!(snapshot.records.len(), 3);
    assert!(snapshot.last_error.is_some());
    assert!(snapshot.has_more);

    // The cursor did not move, so the retry continues where it left off
    let retry = h
        .timeline
        .load_page(USER, DebriefFilters::default(), false)
        .await
        .unwrap();
    assert_eq!(retry, LoadOutcome::Loaded { count: 2, has_more: false });
    assert!(h.timeline.snapshot().last_error.is_none());
}

#[tokio::test]
async fn test_confirmed_pending_entry_is_dequeued() {
    let queue = PendingUploadQueue::in_memory();
    let confirmed = ready("shared", 5);
    let mut local = record("local-1", "c-2", 1, DebriefStatus::Created);
    local.contact_name = "Bob".to_string();
    queue
        .enqueue(PendingEntry::new(confirmed.clone(), None))
        .await
        .unwrap();
    queue.enqueue(PendingEntry::new(local, None)).await.unwrap();

    let h = harness_with_queue(vec![confirmed, ready("f-1", 10)], queue);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    let snapshot = h.timeline.snapshot();
    assert_eq!(ids(&snapshot), ["local-1", "shared", "f-1"]);
    assert_eq!(snapshot.pending_count, 1);
    assert!(h.queue.get("shared").await.is_none());
    assert!(h.queue.get("local-1").await.is_some());
}

#[tokio::test]
async fn test_enqueued_recording_shows_up() {
    let h = harness(vec![ready("f-1", 30)]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    let fresh = record("new-1", "c-1", 0, DebriefStatus::Created).with_contact_name("Alice");
    h.queue
        .enqueue(PendingEntry::new(fresh, None))
        .await
        .unwrap();

    let snapshot = wait_for(&h.timeline, |s| s.find("new-1").is_some()).await;
    assert_eq!(ids(&snapshot), ["new-1", "f-1"]);
    assert_eq!(snapshot.pending_count, 1);
}

#[tokio::test]
async fn test_sections_grouped_by_day() {
    let h = harness(vec![
        ready("today", 60),
        ready("yesterday", 25 * 60),
        ready("older", 5 * 24 * 60),
    ]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    let snapshot = h.timeline.snapshot();
    let titles: Vec<&str> = snapshot.sections.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, ["Today", "Yesterday", "March 5"]);
    assert_eq!(snapshot.sections[0].records[0].id, "today");
}

#[tokio::test]
async fn test_names_resolved_and_recent_contacts() {
    let h = harness(vec![
        record("a", "c-1", 1, DebriefStatus::Ready),
        record("b", "c-2", 2, DebriefStatus::Ready),
        record("c", "gone", 3, DebriefStatus::Ready),
    ]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    let snapshot = h.timeline.snapshot();
    let names: Vec<&str> = snapshot.records.iter().map(|r| r.contact_name.as_str()).collect();
    assert_eq!(names, ["Alice", "Bob", "Deleted Contact"]);
    let recent: Vec<&str> = snapshot.recent_contacts.iter().map(|c| c.contact_id.as_str()).collect();
    assert_eq!(recent, ["c-1", "c-2", "gone"]);
}

#[tokio::test]
async fn test_refresh_contacts_renames() {
    let h = harness(vec![ready("a", 1)]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    h.book.insert("c-1", "Alicia");
    h.timeline.refresh_contacts().await.unwrap();
    let snapshot = wait_for(&h.timeline, |s| {
        s.find("a").is_some_and(|r| r.contact_name == "Alicia")
    })
    .await;
    assert_eq!(snapshot.records.len(), 1);
}

#[tokio::test]
async fn test_status_update_keeps_refreshed_name() {
    let h = harness(vec![record("p", "c-1", 1, DebriefStatus::Processing)]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);
    wait_for_feed(&h.store, "p").await;

    h.book.insert("c-1", "Alicia");
    h.timeline.refresh_contacts().await.unwrap();
    wait_for(&h.timeline, |s| {
        s.find("p").is_some_and(|r| r.contact_name == "Alicia")
    })
    .await;

    let mut update = record("p", "c-1", 1, DebriefStatus::Processing);
    update.summary = Some("Draft summary".into());
    h.store.push_update(update);

    let snapshot = wait_for(&h.timeline, |s| {
        s.find("p").is_some_and(|r| r.summary.is_some())
    })
    .await;
    assert_eq!(snapshot.find("p").unwrap().contact_name, "Alicia");
}

#[tokio::test]
async fn test_search_is_debounced() {
    let h = harness(vec![
        record("a", "c-1", 1, DebriefStatus::Ready),
        record("b", "c-2", 2, DebriefStatus::Ready),
    ]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    h.timeline.search("ali").await.unwrap();
    h.timeline.search("BOB").await.unwrap();

    let snapshot = wait_for(&h.timeline, |s| s.search_query == "BOB").await;
    assert_eq!(ids(&snapshot), ["b"]);

    h.timeline.search_now("").await.unwrap();
    assert_eq!(h.timeline.snapshot().records.len(), 2);
}

#[tokio::test]
async fn test_filter_change_resets_timeline() {
    let h = harness(vec![
        record("a", "c-1", 1, DebriefStatus::Ready),
        record("b", "c-2", 2, DebriefStatus::Ready),
    ]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    let filters = DebriefFilters {
        contact_id: Some("c-2".to_string()),
        ..Default::default()
    };
    let outcome = h.timeline.load_page(USER, filters, false).await.unwrap();
    assert_eq!(outcome, LoadOutcome::Loaded { count: 1, has_more: false });

    let snapshot = h.timeline.snapshot();
    assert_eq!(ids(&snapshot), ["b"]);
    assert_eq!(snapshot.filters.contact_id.as_deref(), Some("c-2"));
}

#[tokio::test]
async fn test_load_more_near_end() {
    let h = harness((0..5).map(|i| ready(&format!("d-{}", i), i)).collect());
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    assert_eq!(
        h.timeline.load_more_if_needed("d-0").await.unwrap(),
        LoadOutcome::NotNeeded
    );
    assert_eq!(
        h.timeline.load_more_if_needed("d-2").await.unwrap(),
        LoadOutcome::Loaded { count: 2, has_more: false }
    );
    assert_eq!(
        h.timeline.load_more_if_needed("d-4").await.unwrap(),
        LoadOutcome::NotNeeded
    );
    assert_eq!(h.store.fetch_page_calls(), 2);
}

#[tokio::test]
async fn test_edit_action_item_writes_once() {
    let mut r = ready("a", 1);
    r.action_items = Some(vec!["A".into(), "B".into(), "C".into()]);
    let h = harness(vec![r]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    let items = h
        .timeline
        .edit_action_items(
            "a",
            ActionItemEdit::Edit {
                index: 1,
                text: "B2".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(items, ["A", "B2", "C"]);

    let writes = h.store.action_item_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, ["A", "B2", "C"]);
    assert_eq!(
        h.timeline.snapshot().find("a").unwrap().action_items(),
        ["A", "B2", "C"]
    );
}

#[tokio::test]
async fn test_failed_edit_rolls_back() {
    let mut r = ready("a", 1);
    r.action_items = Some(vec!["A".into()]);
    let h = harness(vec![r]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    h.store
        .fail_next_update(SyncError::NetworkUnavailable("offline".into()));
    let result = h
        .timeline
        .edit_action_items("a", ActionItemEdit::Add { text: "B".into() })
        .await;
    assert!(matches!(result, Err(SyncError::NetworkUnavailable(_))));

    let snapshot = h.timeline.snapshot();
    assert_eq!(snapshot.find("a").unwrap().action_items(), ["A"]);
    assert!(snapshot.last_error.is_some());
}

#[tokio::test]
async fn test_out_of_range_edit_is_rejected() {
    let h = harness(vec![ready("a", 1)]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    let result = h
        .timeline
        .edit_action_items("a", ActionItemEdit::Delete { index: 0 })
        .await;
    assert!(matches!(result, Err(SyncError::InvalidRequest(_))));
    assert!(h.store.action_item_writes().is_empty());
}

#[tokio::test]
async fn test_delete_failed_record_missing_remotely() {
    let failed = record("f", "c-1", 1, DebriefStatus::Failed);
    assert!(failed.is_permanently_failed());
    let h = harness(vec![failed, ready("keep", 2)]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    h.store.fail_next_delete(SyncError::NotFound);
    assert_ok!(h.timeline.delete("f").await);

    let snapshot = h.timeline.snapshot();
    assert_eq!(ids(&snapshot), ["keep"]);
    assert_eq!(h.store.delete_calls(), 1);
}

#[tokio::test]
async fn test_delete_local_only_skips_store() {
    let queue = PendingUploadQueue::in_memory();
    let mut local = record("local-1", "c-1", 1, DebriefStatus::Failed);
    local.error_message = Some("Upload failed".into());
    queue.enqueue(PendingEntry::new(local, None)).await.unwrap();

    let h = harness_with_queue(vec![ready("f-1", 5)], queue);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);
    assert!(h.timeline.snapshot().find("local-1").is_some());

    assert_ok!(h.timeline.delete("local-1").await);
    assert_eq!(h.store.delete_calls(), 0);
    assert!(h.queue.is_empty().await);
    assert_eq!(ids(&h.timeline.snapshot()), ["f-1"]);
}

#[tokio::test]
async fn test_delete_error_keeps_record() {
    let h = harness(vec![ready("a", 1)]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);

    h.store.fail_next_delete(SyncError::ServerError(500));
    let result = h.timeline.delete("a").await;
    assert!(matches!(result, Err(SyncError::ServerError(500))));

    let snapshot = h.timeline.snapshot();
    assert!(snapshot.find("a").is_some());
    assert!(snapshot.last_error.is_some());
}

#[tokio::test]
async fn test_status_update_applied_until_terminal() {
    let h = harness(vec![record("p", "c-1", 1, DebriefStatus::Processing)]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);
    assert_eq!(h.timeline.snapshot().active_subscriptions, 1);
    wait_for_feed(&h.store, "p").await;

    let mut done = record("p", "c-1", 1, DebriefStatus::Ready);
    done.summary = Some("Agreed on pricing".into());
    h.store.push_update(done);

    let snapshot = wait_for(&h.timeline, |s| {
        s.active_subscriptions == 0
            && s.find("p").is_some_and(|r| r.status == DebriefStatus::Ready)
    })
    .await;
    let updated = snapshot.find("p").unwrap();
    assert_eq!(updated.summary.as_deref(), Some("Agreed on pricing"));
    assert_eq!(updated.contact_name, "Alice");
}

#[tokio::test]
async fn test_feed_error_keeps_record_visible() {
    let h = harness(vec![record("p", "c-1", 1, DebriefStatus::Processing)]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);
    wait_for_feed(&h.store, "p").await;

    h.store.push_feed_error("p", "permission denied");
    let snapshot = wait_for(&h.timeline, |s| !s.warnings.is_empty()).await;
    assert!(snapshot.find("p").is_some());
    assert_eq!(snapshot.active_subscriptions, 1);
}

#[tokio::test]
async fn test_cancel_subscriptions_is_idempotent() {
    let h = harness(vec![
        record("p1", "c-1", 1, DebriefStatus::Processing),
        record("p2", "c-2", 2, DebriefStatus::Created),
    ]);
    assert_ok!(h.timeline.load_page(USER, DebriefFilters::default(), true).await);
    assert_eq!(h.timeline.snapshot().active_subscriptions, 2);

    assert!(h.timeline.cancel_subscription("p1").await.unwrap());
    assert!(!h.timeline.cancel_subscription("p1").await.unwrap());
    assert_eq!(h.timeline.cancel_subscriptions().await.unwrap(), 1);
    assert_eq!(h.timeline.cancel_subscriptions().await.unwrap(), 0);
    assert_eq!(h.timeline.snapshot().active_subscriptions, 0);
}

#[tokio::test]
async fn test_shutdown_closes_handle() {
    let h = harness(vec![]);
    h.timeline.shutdown().await.unwrap();

    let result = h
        .timeline
        .load_page(USER, DebriefFilters::default(), true)
        .await;
    assert!(matches!(result, Err(SyncError::ReconcilerClosed)));
}

struct SteppingClock(std::sync::Mutex<DateTime<FixedOffset>>);

impl SteppingClock {
    fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.0.lock().unwrap()
    }
}

#[tokio::test]
async fn test_relative_range_fixed_across_pages() {
    let mut old = ready("old", 0);
    old.occurred_at = now() - chrono::Duration::days(6);
    let store = Arc::new(MemoryRecordStore::with_records(vec![
        ready("a", 1),
        ready("b", 2),
        ready("c", 3),
        old,
    ]));
    let book = Arc::new(MemoryAddressBook::with_contacts([("c-1", "Alice")]));
    let clock = Arc::new(SteppingClock(std::sync::Mutex::new(now().fixed_offset())));
    let timeline = Reconciler::new(
        store,
        Arc::new(PendingUploadQueue::in_memory()),
        Arc::new(ContactNameResolver::new(book, 100)),
    )
    .with_clock(clock.clone())
    .with_settings(settings())
    .spawn();

    let filters = DebriefFilters {
        date_option: DateRangeOption::ThisWeek,
        ..Default::default()
    };
    let outcome = timeline.load_page(USER, filters.clone(), true).await.unwrap();
    assert_eq!(outcome, LoadOutcome::Loaded { count: 3, has_more: true });

    // Two days later the same scan still covers the week it started with
    clock.advance(chrono::Duration::days(2));
    assert_ok!(timeline.load_page(USER, filters, false).await);
    let snapshot = timeline.snapshot();
    assert_eq!(ids(&snapshot), ["a", "b", "c", "old"]);
}
