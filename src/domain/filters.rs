//! Timeline filters and the query predicate handed to the record store.

use chrono::{DateTime, Duration, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

use super::debrief::{DebriefRecord, DebriefStatus};

/// Preset date windows offered by the timeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateRangeOption {
    #[default]
    All,
    Today,
    /// Last 7 days
    ThisWeek,
    /// Last 30 days
    ThisMonth,
    Custom,
}

impl DateRangeOption {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::All => "All Time",
            Self::Today => "Today",
            Self::ThisWeek => "This Week",
            Self::ThisMonth => "This Month",
            Self::Custom => "Custom Range",
        }
    }
}

/// User-selected timeline filters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebriefFilters {
    pub contact_id: Option<String>,
    pub contact_name: Option<String>,
    pub date_option: DateRangeOption,
    /// First day of a custom range (inclusive)
    pub custom_start: Option<NaiveDate>,
    /// Last day of a custom range (inclusive)
    pub custom_end: Option<NaiveDate>,
    pub has_action_items: Option<bool>,
    pub status: Option<DebriefStatus>,
}

impl DebriefFilters {
    /// Whether any filter narrows the timeline
    pub fn is_active(&self) -> bool {
        self.contact_id.is_some()
            || self.date_option != DateRangeOption::All
            || self.has_action_items.is_some()
            || self.status.is_some()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Resolve relative date options against `now` in the viewer's zone
    pub fn to_query<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> RecordQuery {
        let tz = now.timezone();
        let today = now.date_naive();

        let (start, end) = match self.date_option {
            DateRangeOption::All => (None, None),
            DateRangeOption::Today => (start_of_day(&tz, today), None),
            DateRangeOption::ThisWeek => (Some(now.clone() - Duration::days(7)), None),
            DateRangeOption::ThisMonth => (Some(now.clone() - Duration::days(30)), None),
            DateRangeOption::Custom => (
                self.custom_start.and_then(|d| start_of_day(&tz, d)),
                self.custom_end
                    .and_then(|d| d.succ_opt())
                    .and_then(|d| start_of_day(&tz, d)),
            ),
        };

        RecordQuery {
            contact_id: self.contact_id.clone(),
            range: DateRange {
                start_ms: start.map(|d| d.timestamp_millis()),
                end_ms: end.map(|d| d.timestamp_millis()),
            },
            has_action_items: self.has_action_items,
            status: self.status,
        }
    }
}

/// Epoch-millisecond window: inclusive start, exclusive end
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl DateRange {
    pub fn contains(&self, millis: i64) -> bool {
        self.start_ms.map_or(true, |start| millis >= start)
            && self.end_ms.map_or(true, |end| millis < end)
    }
}

/// Predicate understood by every record store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub contact_id: Option<String>,
    pub range: DateRange,
    pub has_action_items: Option<bool>,
    pub status: Option<DebriefStatus>,
}

impl RecordQuery {
    pub fn matches(&self, record: &DebriefRecord) -> bool {
        if let Some(contact_id) = &self.contact_id {
            if &record.contact_id != contact_id {
                return false;
            }
        }
        if !self.range.contains(record.occurred_at.timestamp_millis()) {
            return false;
        }
        if let Some(wanted) = self.has_action_items {
            if record.action_items().is_empty() == wanted {
                return false;
            }
        }
        self.status.map_or(true, |s| s == record.status)
    }
}

/// Midnight of `date` in `tz` (earliest instant if the zone skips midnight)
pub fn start_of_day<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> Option<DateTime<Tz>> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&midnight).earliest()
}
