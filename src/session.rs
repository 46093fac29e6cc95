//! Live session state machine.
//!
//! `Off` is the initial state. The toggle is a pure flip; each direction
//! carries its side effects out as a [`Transition`] value for the caller to
//! act on (archiving, persistence), so this type never touches storage.

use chrono::NaiveDateTime;
use tracing::info;
use uuid::Uuid;

use crate::calendar;
use crate::error::{DashboardError, ValidationError};
use crate::models::{Event, LiveRecord, RecordedSummary, SessionSummary};
use crate::projections;
use crate::store::EventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiveState {
    #[default]
    Off,
    Live {
        since: NaiveDateTime,
        session_id: Uuid,
    },
}

impl LiveState {
    pub fn is_live(&self) -> bool {
        matches!(self, LiveState::Live { .. })
    }
}

/// What a toggle did.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Started {
        session_id: Uuid,
        since: NaiveDateTime,
    },
    /// `events` is the finished session, detached, ready for archiving.
    Ended {
        summary: SessionSummary,
        year: i32,
        events: Vec<Event>,
    },
}

#[derive(Debug, Default)]
pub struct LiveSession {
    state: LiveState,
    store: EventStore,
    summary: Option<SessionSummary>,
    peak_window: usize,
    /// The state changed since the live flag was last written.
    record_dirty: bool,
}

impl LiveSession {
    pub fn new(peak_window: usize) -> Self {
        Self {
            peak_window,
            ..Self::default()
        }
    }

    /// Rebuild from a persisted live flag and session; an `Off` record drops
    /// whatever session was left behind.
    pub fn restore(record: &LiveRecord, store: EventStore, peak_window: usize) -> Self {
        match (record.enabled, record.since) {
            (true, Some(since)) => Self {
                state: LiveState::Live {
                    since,
                    session_id: record.session_id.unwrap_or_else(Uuid::new_v4),
                },
                store,
                summary: None,
                peak_window,
                record_dirty: false,
            },
            _ => Self::new(peak_window),
        }
    }

    pub fn state(&self) -> LiveState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EventStore {
        &mut self.store
    }

    pub fn summary(&self) -> Option<&SessionSummary> {
        self.summary.as_ref()
    }

    pub fn is_record_dirty(&self) -> bool {
        self.record_dirty
    }

    pub fn mark_record_clean(&mut self) {
        self.record_dirty = false;
    }

    pub fn live_record(&self) -> LiveRecord {
        match self.state {
            LiveState::Off => LiveRecord::default(),
            LiveState::Live { since, session_id } => LiveRecord {
                enabled: true,
                since: Some(since),
                session_id: Some(session_id),
            },
        }
    }

    /// Flip between `Off` and `Live`.
    ///
    /// Off → Live clears the event store and the displayed summary.
    /// Live → Off freezes a summary and hands the events out, leaving the
    /// store empty. Neither direction can fail.
    pub fn toggle(&mut self, now: NaiveDateTime) -> Transition {
        self.record_dirty = true;
        match self.state {
            LiveState::Off => {
                let session_id = Uuid::new_v4();
                self.store.clear();
                self.summary = None;
                self.state = LiveState::Live {
                    since: now,
                    session_id,
                };
                info!(%session_id, since = %now, "live session started");
                Transition::Started {
                    session_id,
                    since: now,
                }
            }
            LiveState::Live { session_id, .. } => {
                let events = self.store.take();
                let summary = summarize(session_id, &events, now, self.peak_window);
                let year = events
                    .first()
                    .map_or_else(|| calendar::year(&now), |e| calendar::year(&e.timestamp));
                info!(%session_id, total = summary.total(), events = events.len(), "live session ended");
                self.summary = Some(summary.clone());
                self.state = LiveState::Off;
                Transition::Ended {
                    summary,
                    year,
                    events,
                }
            }
        }
    }

    /// Append while live; rejected with [`ValidationError::NotLive`] otherwise.
    pub fn append(&mut self, event: Event) -> Result<&Event, ValidationError> {
        if !self.is_live() {
            return Err(ValidationError::NotLive);
        }
        self.store.append(event)
    }

    pub fn undo_last(&mut self) -> Result<Event, DashboardError> {
        if !self.is_live() {
            return Err(ValidationError::NotLive.into());
        }
        self.store.undo_last()
    }

    /// Seconds since the session went live, 0 when off.
    pub fn elapsed_seconds(&self, now: NaiveDateTime) -> i64 {
        match self.state {
            LiveState::Off => 0,
            LiveState::Live { since, .. } => (now - since).num_seconds().max(0),
        }
    }
}

/// Freeze a detached recap of a finished session.
pub fn summarize(
    session_id: Uuid,
    events: &[Event],
    ended_at: NaiveDateTime,
    peak_window: usize,
) -> SessionSummary {
    let (Some(first), Some(last)) = (events.first(), events.last()) else {
        return SessionSummary::NoData {
            session_id,
            ended_at,
        };
    };
    SessionSummary::Recorded(RecordedSummary {
        session_id,
        total: projections::total(events),
        first_timestamp: first.timestamp,
        last_timestamp: last.timestamp,
        year: calendar::year(&first.timestamp),
        minute_buckets: projections::minute_buckets(events),
        peak: projections::windowed_peak(events, peak_window),
        average: projections::average(events),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> NaiveDateTime {
        calendar::parse_timestamp(raw).unwrap()
    }

    fn ev(raw: &str, count: i64) -> Event {
        Event::new(at(raw), count).unwrap()
    }

    #[test]
    fn test_starts_off_and_rejects_appends() {
        let mut session = LiveSession::new(2);

        assert_eq!(session.state(), LiveState::Off);
        assert_eq!(
            session.append(ev("2024-10-31T18:00:00", 1)),
            Err(ValidationError::NotLive)
        );
        assert!(session.store().is_empty());
    }

    #[test]
    fn test_toggle_on_then_off_produces_summary() {
        let mut session = LiveSession::new(2);
        assert!(!session.is_record_dirty());
        let started = session.toggle(at("2024-10-31T17:55:00"));
        assert!(matches!(started, Transition::Started { .. }));
        assert!(session.is_record_dirty());

        session.append(ev("2024-10-31T18:01:00", 1)).unwrap();
        session.append(ev("2024-10-31T18:01:30", 2)).unwrap();
        session.append(ev("2024-10-31T18:03:00", 1)).unwrap();

        let Transition::Ended { summary, year, events } = session.toggle(at("2024-10-31T21:00:00"))
        else {
            panic!("expected session to end");
        };
        assert_eq!(year, 2024);
        assert_eq!(events.len(), 3);
        assert!(!session.is_live());
        assert!(session.store().is_empty());

        let SessionSummary::Recorded(recap) = summary else {
            panic!("expected recorded summary");
        };
        assert_eq!(recap.total, 4);
        assert_eq!(recap.first_timestamp, at("2024-10-31T18:01:00"));
        assert_eq!(recap.last_timestamp, at("2024-10-31T18:03:00"));
        assert_eq!(recap.minute_buckets["18:01"], 3);
        assert_eq!(recap.peak.total, 3);
        assert_eq!(session.summary().map(SessionSummary::total), Some(4));
    }

    #[test]
    fn test_empty_session_ends_with_no_data() {
        let mut session = LiveSession::new(2);
        session.toggle(at("2024-10-31T18:00:00"));
        let ended = session.toggle(at("2024-10-31T18:00:05"));

        let Transition::Ended { summary, events, .. } = ended else {
            panic!("expected session to end");
        };
        assert!(events.is_empty());
        assert!(matches!(summary, SessionSummary::NoData { .. }));
        assert!(matches!(session.summary(), Some(SessionSummary::NoData { .. })));
    }

    #[test]
    fn test_new_session_clears_previous_summary_and_events() {
        let mut session = LiveSession::new(2);
        session.toggle(at("2024-10-31T18:00:00"));
        session.append(ev("2024-10-31T18:01:00", 1)).unwrap();
        session.toggle(at("2024-10-31T19:00:00"));
        assert!(session.summary().is_some());

        session.toggle(at("2024-10-31T19:30:00"));
        assert!(session.summary().is_none());
        assert!(session.store().is_empty());
        assert_eq!(session.elapsed_seconds(at("2024-10-31T19:31:00")), 60);
    }

    #[test]
    fn test_restore_resumes_live_session() {
        let session_id = Uuid::new_v4();
        let record = LiveRecord {
            enabled: true,
            since: Some(at("2024-10-31T18:00:00")),
            session_id: Some(session_id),
        };
        let store = EventStore::from_events(vec![ev("2024-10-31T18:01:00", 2)]);

        let session = LiveSession::restore(&record, store.clone(), 2);
        assert_eq!(session.live_record(), record);
        assert!(!session.is_record_dirty());
        assert_eq!(session.store().total(), 2);

        let off = LiveSession::restore(&LiveRecord::default(), store, 2);
        assert!(!off.is_live());
        assert!(off.store().is_empty());
    }
}
