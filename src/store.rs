use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::error::{DashboardError, PersistenceError, ValidationError};
use crate::models::Event;
use crate::persistence::Persistence;

/// Append-only event log for the active session.
/// Insertion order is chronological order; appends that would go backwards are rejected.
#[derive(Debug, Default, Clone)]
pub struct EventStore {
    events: Vec<Event>,
    /// Set when the last write to disk failed; the next persist retries.
    dirty: bool,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<Event>) -> Self {
        Self {
            events,
            dirty: false,
        }
    }

    /// Append one event. Never drops silently: it either lands or errors.
    pub fn append(&mut self, event: Event) -> Result<&Event, ValidationError> {
        if event.count == 0 {
            return Err(ValidationError::NonPositiveCount(0));
        }
        if let Some(last) = self.last_timestamp() {
            if event.timestamp < last {
                return Err(ValidationError::OutOfOrder {
                    got: event.timestamp,
                    last,
                });
            }
        }
        self.events.push(event);
        self.dirty = true;
        Ok(&self.events[self.events.len() - 1])
    }

    /// Remove the most recent event.
    pub fn undo_last(&mut self) -> Result<Event, DashboardError> {
        let removed = self.events.pop().ok_or(DashboardError::NothingToUndo)?;
        self.dirty = true;
        Ok(removed)
    }

    pub fn list(&self) -> &[Event] {
        &self.events
    }

    /// Detached copy for lock-free aggregation.
    pub fn snapshot(&self) -> Vec<Event> {
        self.list().to_vec()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.dirty = true;
    }

    /// Hand the events over and leave the store empty.
    pub fn take(&mut self) -> Vec<Event> {
        self.dirty = true;
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.events.iter().map(|e| u64::from(e.count)).sum()
    }

    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.events.last().map(|e| e.timestamp)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replace the in-memory session with whatever the backend holds.
    /// Malformed records are skipped and logged; out-of-order ones too.
    pub fn load_persisted(&mut self, backend: &dyn Persistence) -> Result<usize, PersistenceError> {
        let records = backend.read_session()?;
        let mut events: Vec<Event> = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            match record.decode(index) {
                Ok(event) => {
                    if events.last().is_some_and(|last| event.timestamp < last.timestamp) {
                        warn!(index, timestamp = %event.timestamp, "skipping out-of-order session record");
                        continue;
                    }
                    events.push(event);
                }
                Err(e) => warn!(error = %e, "skipping session record"),
            }
        }
        let skipped = records.len() - events.len();
        debug!(loaded = events.len(), skipped, "session loaded");
        *self = Self::from_events(events);
        Ok(skipped)
    }

    /// Write the session through the backend. Idempotent; on failure the
    /// in-memory events stay authoritative and the next call retries.
    pub fn persist(&mut self, backend: &dyn Persistence) -> Result<(), PersistenceError> {
        match backend.write_session(&self.events) {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                Err(e)
            }
        }
    }
}
