//! Session context shared by every request worker.
//!
//! One value owns the live session (behind a read/write lock) and the
//! historical archive (behind an exclusive lock held across the whole
//! read-modify-write of a merge). Reads copy what they need out of the lock
//! and aggregate on the copy.

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{DashboardError, PersistenceError, ValidationError};
use crate::history::HistoricalComparator;
use crate::models::{
    DetailedArchive, Event, EventInput, HistoricalArchive, LiveStatus, Overview, PeakWindow,
    SessionSummary, SlotCounts,
};
use crate::persistence::Persistence;
use crate::projections::{self, RunningPoint, RunningTotal};
use crate::session::{LiveSession, LiveState, Transition};
use crate::store::EventStore;

pub type SharedDashboard = Arc<Dashboard>;

pub struct Dashboard {
    session: RwLock<LiveSession>,
    history: Mutex<HistoricalComparator>,
    backend: Arc<dyn Persistence>,
    peak_window: usize,
    recent_window: Duration,
}

#[derive(Debug, Serialize)]
pub struct AppendOutcome {
    pub event: Event,
    pub total_count: u64,
    /// False when the session file could not be written; the event is kept in memory.
    pub persisted: bool,
}

#[derive(Debug, Serialize)]
pub struct RejectedEntry {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    pub accepted: usize,
    pub rejected: Vec<RejectedEntry>,
    pub total_count: u64,
    pub persisted: bool,
}

#[derive(Debug, Serialize)]
pub struct UndoOutcome {
    pub removed: Event,
    pub total_count: u64,
    pub persisted: bool,
}

#[derive(Debug, Serialize)]
pub struct ToggleOutcome {
    pub live: LiveStatus,
    pub summary: Option<SessionSummary>,
    /// Storage failures hit while completing the toggle. The toggle itself
    /// always completes.
    pub persistence_errors: Vec<String>,
}

impl Dashboard {
    /// Restore live flag, session and archive from the backend.
    pub fn open(config: &Config, backend: Arc<dyn Persistence>) -> Result<Self, PersistenceError> {
        let live = backend.read_live()?;
        let mut store = EventStore::new();
        if live.enabled {
            let skipped = store.load_persisted(backend.as_ref())?;
            if skipped > 0 {
                warn!(skipped, "dropped unreadable records while restoring session");
            }
        }
        let session = LiveSession::restore(&live, store, config.peak_window_events);
        let mut history =
            HistoricalComparator::new(backend.read_archive()?, config.contribution_policy);
        let skipped = history.restore_entries(&backend.read_entries()?);
        if skipped > 0 {
            warn!(skipped, "dropped unreadable archived entries");
        }

        info!(
            live = session.is_live(),
            events = session.store().len(),
            years = ?history.years(),
            "dashboard state restored"
        );

        Ok(Self {
            session: RwLock::new(session),
            history: Mutex::new(history),
            backend,
            peak_window: config.peak_window_events,
            recent_window: config.recent_window(),
        })
    }

    pub fn recent_window(&self) -> Duration {
        self.recent_window
    }

    async fn snapshot(&self) -> Vec<Event> {
        self.session.read().await.store().snapshot()
    }

    /// Current session in chronological order.
    pub async fn current_data(&self) -> Vec<Event> {
        self.snapshot().await
    }

    pub async fn append(&self, input: &EventInput) -> Result<AppendOutcome, DashboardError> {
        let event = Event::from_input(input)?;
        let mut session = self.session.write().await;
        let event = *session.append(event)?;
        let persisted = self.persist_session(&mut session).is_empty();
        Ok(AppendOutcome {
            event,
            total_count: session.store().total(),
            persisted,
        })
    }

    /// Append in order; a bad entry is reported and skipped, the rest land.
    pub async fn append_batch(&self, inputs: &[EventInput]) -> Result<BatchOutcome, DashboardError> {
        let mut session = self.session.write().await;
        if !session.is_live() {
            return Err(ValidationError::NotLive.into());
        }
        let mut accepted = 0;
        let mut rejected = Vec::new();
        for (index, input) in inputs.iter().enumerate() {
            let result = Event::from_input(input).and_then(|event| session.append(event).map(|_| ()));
            match result {
                Ok(()) => accepted += 1,
                Err(e) => rejected.push(RejectedEntry {
                    index,
                    error: e.to_string(),
                }),
            }
        }
        let persisted = accepted == 0 || self.persist_session(&mut session).is_empty();
        info!(accepted, rejected = rejected.len(), "batch appended");
        Ok(BatchOutcome {
            accepted,
            rejected,
            total_count: session.store().total(),
            persisted,
        })
    }

    pub async fn undo_last(&self) -> Result<UndoOutcome, DashboardError> {
        let mut session = self.session.write().await;
        let removed = session.undo_last()?;
        info!(timestamp = %removed.timestamp, count = removed.count, "last entry removed");
        let persisted = self.persist_session(&mut session).is_empty();
        Ok(UndoOutcome {
            removed,
            total_count: session.store().total(),
            persisted,
        })
    }

    /// Write whatever part of the session the backend has not accepted yet,
    /// live flag first so a restart never drops a session file it should resume.
    ///
    /// Writes are synchronous and happen under the session write lock: there
    /// is a single writer at a time and files stay consistent with memory.
    fn persist_session(&self, session: &mut LiveSession) -> Vec<PersistenceError> {
        let mut errors = Vec::new();
        if session.is_record_dirty() {
            match self.backend.write_live(&session.live_record()) {
                Ok(()) => session.mark_record_clean(),
                Err(e) => {
                    error!(error = %e, "live flag write failed; will retry on next change");
                    errors.push(e);
                }
            }
        }
        if session.store().is_dirty() {
            if let Err(e) = session.store_mut().persist(self.backend.as_ref()) {
                error!(error = %e, "session write failed; will retry on next change");
                errors.push(e);
            }
        }
        errors
    }

    /// Retry session writes that failed earlier.
    pub async fn flush_session(&self) -> Result<(), PersistenceError> {
        let mut session = self.session.write().await;
        match self.persist_session(&mut session).into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn minute_stats(&self) -> SlotCounts {
        projections::minute_buckets(&self.snapshot().await)
    }

    pub async fn ten_minute_stats(&self) -> SlotCounts {
        projections::ten_minute_buckets(&self.snapshot().await)
    }

    pub async fn running_total(&self) -> Vec<RunningPoint> {
        RunningTotal::new(&self.snapshot().await).points()
    }

    pub async fn peak(&self, window: Option<usize>) -> PeakWindow {
        projections::windowed_peak(&self.snapshot().await, window.unwrap_or(self.peak_window))
    }

    pub async fn average(&self) -> f64 {
        projections::average(&self.snapshot().await)
    }

    pub async fn recent_window_sum(&self, now: NaiveDateTime, window: Option<Duration>) -> u64 {
        projections::recent_window_sum(
            &self.snapshot().await,
            now,
            window.unwrap_or(self.recent_window),
        )
    }

    pub async fn overview(&self, now: NaiveDateTime) -> Overview {
        let (events, live) = {
            let session = self.session.read().await;
            (session.store().snapshot(), session.is_live())
        };
        Overview {
            total_count: projections::total(&events),
            recent_count: projections::recent_window_sum(&events, now, self.recent_window),
            recent_window_minutes: self.recent_window.num_minutes(),
            event_count: events.len(),
            live,
        }
    }

    pub async fn historical_comparison(&self, years: Option<&[i32]>) -> HistoricalArchive {
        self.history.lock().await.compare(years)
    }

    pub async fn detailed_historical(&self, years: Option<&[i32]>) -> DetailedArchive {
        self.history.lock().await.detailed(years)
    }

    pub async fn live_status(&self, now: NaiveDateTime) -> LiveStatus {
        let session = self.session.read().await;
        live_status_of(&session, now)
    }

    pub async fn is_live(&self) -> bool {
        self.session.read().await.is_live()
    }

    pub async fn summary(&self) -> Option<SessionSummary> {
        self.session.read().await.summary().cloned()
    }

    /// Flip live mode. Never fails: storage problems are reported in the
    /// outcome and the in-memory state stays authoritative.
    pub async fn toggle_live(&self, now: NaiveDateTime) -> ToggleOutcome {
        let mut persistence_errors = Vec::new();

        let (transition, live) = {
            let mut session = self.session.write().await;
            let transition = session.toggle(now);
            persistence_errors.extend(
                self.persist_session(&mut session)
                    .iter()
                    .map(ToString::to_string),
            );
            (transition, live_status_of(&session, now))
        };

        let summary = match transition {
            Transition::Started { .. } => {
                // Nothing to merge; still a chance to flush an archive left dirty.
                if let Err(e) = self.flush_archive().await {
                    persistence_errors.push(e.to_string());
                }
                None
            }
            Transition::Ended {
                summary,
                year,
                events,
            } => {
                if let Err(e) = self.merge_session(year, &events).await {
                    persistence_errors.push(e.to_string());
                }
                Some(summary)
            }
        };

        ToggleOutcome {
            live,
            summary,
            persistence_errors,
        }
    }

    /// Fold a finished session into the archive and write it out.
    ///
    /// The archive lock is held across merge and write. A failed write leaves
    /// the merge in memory and marks the archive for the next attempt.
    pub async fn merge_session(&self, year: i32, events: &[Event]) -> Result<(), PersistenceError> {
        let mut history = self.history.lock().await;
        history.merge_session(year, events);
        if !history.is_dirty() {
            return Ok(());
        }
        self.write_archive(&mut history)
    }

    /// Retry a previously failed archive write.
    pub async fn flush_archive(&self) -> Result<(), PersistenceError> {
        let mut history = self.history.lock().await;
        if !history.is_dirty() {
            return Ok(());
        }
        self.write_archive(&mut history)
    }

    /// Slot stats and entries go out together; either failing keeps both
    /// pending. Runs synchronously under the archive lock, one writer at a time.
    fn write_archive(&self, history: &mut HistoricalComparator) -> Result<(), PersistenceError> {
        let written = self
            .backend
            .write_archive(history.archive())
            .and_then(|()| self.backend.write_entries(history.entries()));
        match written {
            Ok(()) => {
                history.mark_clean();
                Ok(())
            }
            Err(e) => {
                history.mark_dirty();
                error!(error = %e, "archive write failed; merge kept in memory");
                Err(e)
            }
        }
    }
}

fn live_status_of(session: &LiveSession, now: NaiveDateTime) -> LiveStatus {
    let (since, session_id) = match session.state() {
        LiveState::Off => (None, None),
        LiveState::Live { since, session_id } => (Some(since), Some(session_id)),
    };
    LiveStatus {
        is_live: session.is_live(),
        since,
        session_id,
        elapsed_seconds: session.elapsed_seconds(now),
    }
}
