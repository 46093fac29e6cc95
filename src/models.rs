use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::calendar;
use crate::error::{MalformedEventError, ValidationError};

/// Event input from API
#[derive(Debug, Default, Deserialize)]
pub struct EventInput {
    /// Defaults to now.
    pub timestamp: Option<String>,
    /// Defaults to one visitor.
    pub count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BatchInput {
    pub events: Vec<EventInput>,
}

/// One timestamped visitor count. Immutable once appended.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    #[serde(with = "calendar::iso_seconds")]
    pub timestamp: NaiveDateTime,
    pub count: u32,
}

impl Event {
    /// Build an event, rejecting non-positive counts.
    pub fn new(timestamp: NaiveDateTime, count: i64) -> Result<Self, ValidationError> {
        if count <= 0 {
            return Err(ValidationError::NonPositiveCount(count));
        }
        let count = u32::try_from(count).map_err(|_| ValidationError::CountTooLarge(count))?;
        Ok(Self { timestamp, count })
    }

    pub fn from_input(input: &EventInput) -> Result<Self, ValidationError> {
        let timestamp = match input.timestamp.as_deref() {
            Some(raw) => calendar::parse_timestamp(raw)?,
            None => calendar::now(),
        };
        Self::new(timestamp, input.count.unwrap_or(1))
    }
}

/// Session file entry as it sits on disk, before validation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EventRecord {
    pub timestamp: String,
    pub count: i64,
}

impl EventRecord {
    pub fn decode(&self, index: usize) -> Result<Event, MalformedEventError> {
        let timestamp =
            calendar::parse_timestamp(&self.timestamp).map_err(|e| MalformedEventError {
                index,
                reason: e.to_string(),
            })?;
        Event::new(timestamp, self.count).map_err(|e| MalformedEventError {
            index,
            reason: e.to_string(),
        })
    }
}

impl From<&Event> for EventRecord {
    fn from(event: &Event) -> Self {
        Self {
            timestamp: calendar::format_timestamp(&event.timestamp),
            count: i64::from(event.count),
        }
    }
}

/// `HH:MM` (or `HH:M0`) slot → summed count, in key order.
pub type SlotCounts = BTreeMap<String, u64>;

/// Highest sum over consecutive log entries.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeakWindow {
    pub total: u64,
    #[serde(with = "calendar::iso_seconds::option")]
    pub start: Option<NaiveDateTime>,
    #[serde(with = "calendar::iso_seconds::option")]
    pub end: Option<NaiveDateTime>,
}

/// Frozen recap of a finished live session. Holds copies only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionSummary {
    /// The session ended without a single event.
    NoData {
        session_id: Uuid,
        #[serde(with = "calendar::iso_seconds")]
        ended_at: NaiveDateTime,
    },
    Recorded(RecordedSummary),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RecordedSummary {
    pub session_id: Uuid,
    pub total: u64,
    #[serde(with = "calendar::iso_seconds")]
    pub first_timestamp: NaiveDateTime,
    #[serde(with = "calendar::iso_seconds")]
    pub last_timestamp: NaiveDateTime,
    pub year: i32,
    pub minute_buckets: SlotCounts,
    pub peak: PeakWindow,
    pub average: f64,
}

impl SessionSummary {
    pub fn total(&self) -> u64 {
        match self {
            SessionSummary::NoData { .. } => 0,
            SessionSummary::Recorded(summary) => summary.total,
        }
    }
}

/// Per-slot historical statistic for one year.
///
/// `days` and `untracked_days` are extensions of the stable `{total, average}`
/// shape; both are omitted when empty so older readers see the same document.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TimeSlotStat {
    pub total: u64,
    pub average: f64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub days: BTreeSet<NaiveDate>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub untracked_days: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl TimeSlotStat {
    pub fn contributing_days(&self) -> u64 {
        self.days.len() as u64 + u64::from(self.untracked_days)
    }
}

/// Slot → stat for a single year.
pub type YearSlots = BTreeMap<String, TimeSlotStat>;

/// Year → slot → stat. Serialized with years as string keys.
pub type HistoricalArchive = BTreeMap<i32, YearSlots>;

/// Year → every archived entry of that year, oldest first.
pub type DetailedArchive = BTreeMap<i32, Vec<Event>>;

/// Per-year entries as read from disk, before validation.
pub type EntryRecords = BTreeMap<i32, Vec<EventRecord>>;

/// Persisted live-mode flag, so a restart resumes an open session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct LiveRecord {
    pub enabled: bool,
    #[serde(default, with = "calendar::iso_seconds::option")]
    pub since: Option<NaiveDateTime>,
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

/// API Response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Live status as reported to the dashboard page.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LiveStatus {
    pub is_live: bool,
    #[serde(with = "calendar::iso_seconds::option")]
    pub since: Option<NaiveDateTime>,
    pub session_id: Option<Uuid>,
    pub elapsed_seconds: i64,
}

/// Headline numbers for the current session.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Overview {
    pub total_count: u64,
    pub recent_count: u64,
    pub recent_window_minutes: i64,
    pub event_count: usize,
    pub live: bool,
}
