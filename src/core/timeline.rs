//! Pure timeline computations: merge, search, grouping.
//!
//! Everything here is synchronous and side-effect free; the reconciler
//! owns the state and calls into these functions.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate};
use serde::Serialize;

use crate::domain::{DebriefRecord, UNKNOWN_CONTACT};

/// Maximum number of recent contacts derived from the timeline
pub const RECENT_CONTACTS_LIMIT: usize = 10;

/// Source of "now" in the viewer's time zone
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// The system clock in the local time zone
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// A clock stuck at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

/// Result of merging pending and fetched records
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Deduplicated records, newest first
    pub records: Vec<DebriefRecord>,

    /// Pending ids that the fetched set now confirms
    pub confirmed: Vec<String>,
}

/// `pending ∪ fetched`, the fetched copy winning on id collisions.
///
/// Sorted by `occurred_at` descending; on equal timestamps pending records
/// come first, otherwise input order is kept.
pub fn merge(pending: &[DebriefRecord], fetched: &[DebriefRecord]) -> MergeOutcome {
    let mut seen: HashSet<&str> = HashSet::with_capacity(fetched.len());
    let fetched: Vec<&DebriefRecord> = fetched
        .iter()
        .filter(|r| seen.insert(r.id.as_str()))
        .collect();

    let mut confirmed = Vec::new();
    let mut tagged: Vec<(bool, &DebriefRecord)> = Vec::with_capacity(pending.len() + fetched.len());
    for record in pending {
        if seen.contains(record.id.as_str()) {
            confirmed.push(record.id.clone());
        } else {
            tagged.push((true, record));
        }
    }
    tagged.extend(fetched.into_iter().map(|r| (false, r)));

    tagged.sort_by(|(a_pending, a), (b_pending, b)| {
        b.occurred_at
            .cmp(&a.occurred_at)
            .then_with(|| b_pending.cmp(a_pending))
    });

    MergeOutcome {
        records: tagged.into_iter().map(|(_, r)| r.clone()).collect(),
        confirmed,
    }
}

/// Case-insensitive substring match on contact name, summary and transcript
pub fn matches_search(record: &DebriefRecord, query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    let hit = |text: &str| text.to_lowercase().contains(&needle);
    hit(record.contact_name.as_str())
        || record.summary.as_deref().is_some_and(hit)
        || record.transcript.as_deref().is_some_and(hit)
}

pub fn filter_search(records: &[DebriefRecord], query: &str) -> Vec<DebriefRecord> {
    records
        .iter()
        .filter(|r| matches_search(r, query))
        .cloned()
        .collect()
}

/// One calendar day of the timeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineSection {
    /// `Today`, `Yesterday`, or e.g. `March 4`
    pub title: String,
    pub day: NaiveDate,
    pub records: Vec<DebriefRecord>,
}

/// Bucket records by local calendar day, most recent day first
pub fn group(records: &[DebriefRecord], now: &DateTime<FixedOffset>) -> Vec<TimelineSection> {
    let tz = now.timezone();
    let today = now.date_naive();

    let mut buckets: BTreeMap<NaiveDate, Vec<DebriefRecord>> = BTreeMap::new();
    for record in records {
        let day = record.occurred_at.with_timezone(&tz).date_naive();
        buckets.entry(day).or_default().push(record.clone());
    }

    buckets
        .into_iter()
        .rev()
        .map(|(day, mut records)| {
            records.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
            TimelineSection {
                title: section_title(day, today),
                day,
                records,
            }
        })
        .collect()
}

pub fn section_title(day: NaiveDate, today: NaiveDate) -> String {
    if day == today {
        "Today".to_string()
    } else if today - Duration::days(1) == day {
        "Yesterday".to_string()
    } else {
        day.format("%B %-d").to_string()
    }
}

/// A contact that appears in the loaded timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentContact {
    pub contact_id: String,
    pub name: String,
}

/// Up to ten distinct contacts, in the order they first appear
pub fn recent_contacts(records: &[DebriefRecord]) -> Vec<RecentContact> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| !r.contact_id.is_empty() && seen.insert(r.contact_id.as_str()))
        .take(RECENT_CONTACTS_LIMIT)
        .map(|r| RecentContact {
            contact_id: r.contact_id.clone(),
            name: if r.contact_name.is_empty() {
                UNKNOWN_CONTACT.to_string()
            } else {
                r.contact_name.clone()
            },
        })
        .collect()
}

/// Whether showing `index` of `len` loaded records should fetch the next page
pub fn should_load_more(index: usize, len: usize, threshold: usize) -> bool {
    index + threshold >= len
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn now() -> DateTime<FixedOffset> {
        FixedOffset::west_opt(5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 10, 9, 0, 0)
            .unwrap()
    }

    fn at(id: &str, local: (u32, u32, u32)) -> DebriefRecord {
        let (day, hour, min) = local;
        let when = now()
            .timezone()
            .with_ymd_and_hms(2026, 3, day, hour, min, 0)
            .unwrap()
            .with_timezone(&Utc);
        let mut r = DebriefRecord::new_local("u-1", "c-1", "Alice", when, 10.0);
        r.id = id.to_string();
        r
    }

    #[test]
    fn test_merge_dedupes_and_reports_confirmed() {
        let pending = vec![at("p-1", (10, 8, 0)), at("shared", (10, 7, 0))];
        let fetched = vec![at("shared", (10, 7, 0)), at("f-1", (9, 12, 0))];

        let outcome = merge(&pending, &fetched);
        let ids: Vec<&str> = outcome.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["p-1", "shared", "f-1"]);
        assert_eq!(outcome.confirmed, ["shared"]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let pending = vec![at("p-1", (10, 8, 0))];
        let page = vec![at("f-1", (10, 7, 0)), at("f-2", (9, 7, 0))];
        let mut twice = page.clone();
        twice.extend(page.clone());

        let once = merge(&pending, &page);
        let again = merge(&pending, &twice);
        assert_eq!(once.records, again.records);
    }

    #[test]
    fn test_pending_first_on_tie() {
        let pending = vec![at("p-1", (10, 8, 0))];
        let fetched = vec![at("f-1", (10, 8, 0))];
        let ids: Vec<String> = merge(&pending, &fetched).records.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["p-1", "f-1"]);
    }

    #[test]
    fn test_group_titles() {
        let records = vec![
            at("a", (10, 8, 30)),
            at("b", (10, 0, 5)),
            at("c", (9, 23, 59)),
            at("d", (4, 12, 0)),
        ];
        let sections = group(&records, &now());
        let titles: Vec<&str> = sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, ["Today", "Yesterday", "March 4"]);
        assert_eq!(sections[0].records.len(), 2);
        assert_eq!(sections[0].records[0].id, "a");
    }

    #[test]
    fn test_group_uses_viewer_zone() {
        // 03:00 UTC on the 10th is still the 9th at UTC-5
        let mut r = at("x", (9, 22, 0));
        r.occurred_at = Utc.with_ymd_and_hms(2026, 3, 10, 3, 0, 0).unwrap();
        let sections = group(&[r], &now());
        assert_eq!(sections[0].title, "Yesterday");
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let mut r = at("a", (10, 8, 0));
        r.summary = Some("Pricing discussion".to_string());
        assert!(matches_search(&r, "PRICING"));
        assert!(matches_search(&r, "alice"));
        assert!(matches_search(&r, "  "));
        assert!(!matches_search(&r, "renewal"));
    }

    #[test]
    fn test_recent_contacts_distinct_and_bounded() {
        let mut records = Vec::new();
        for i in 0..15 {
            let mut r = at(&format!("d-{}", i), (10, 8, 0));
            r.contact_id = format!("c-{}", i % 12);
            records.push(r);
        }
        let mut anonymous = at("anon", (10, 8, 0));
        anonymous.contact_id.clear();
        records.insert(0, anonymous);

        let recent = recent_contacts(&records);
        assert_eq!(recent.len(), RECENT_CONTACTS_LIMIT);
        assert_eq!(recent[0].contact_id, "c-0");
    }

    #[test]
    fn test_load_more_threshold() {
        assert!(!should_load_more(0, 20, 5));
        assert!(!should_load_more(14, 20, 5));
        assert!(should_load_more(15, 20, 5));
        assert!(should_load_more(19, 20, 5));
    }
}
