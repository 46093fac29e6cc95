use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::PersistenceError;
use crate::models::{DetailedArchive, EntryRecords, Event, EventRecord, HistoricalArchive, LiveRecord};

pub const SESSION_FILE: &str = "session.json";
pub const ARCHIVE_FILE: &str = "historical_data.json";
pub const LIVE_FILE: &str = "live_mode.json";
pub const ENTRIES_FILE: &str = "historical_entries.json";

/// Durable storage the core reads and writes.
///
/// Session and entry records come back undecoded so the caller can skip bad
/// ones individually instead of losing the whole file.
pub trait Persistence: Send + Sync {
    fn read_archive(&self) -> Result<HistoricalArchive, PersistenceError>;
    fn write_archive(&self, archive: &HistoricalArchive) -> Result<(), PersistenceError>;
    fn read_entries(&self) -> Result<EntryRecords, PersistenceError>;
    fn write_entries(&self, entries: &DetailedArchive) -> Result<(), PersistenceError>;
    fn read_session(&self) -> Result<Vec<EventRecord>, PersistenceError>;
    fn write_session(&self, events: &[Event]) -> Result<(), PersistenceError>;
    fn read_live(&self) -> Result<LiveRecord, PersistenceError>;
    fn write_live(&self, live: &LiveRecord) -> Result<(), PersistenceError>;
}

/// JSON files in one data directory. Missing files read as empty.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the data directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let store = Self::new(dir);
        fs::create_dir_all(&store.dir).map_err(|e| PersistenceError::io(&store.dir, e))?;
        Ok(store)
    }

    fn read_json<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, PersistenceError> {
        let path = self.dir.join(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(PersistenceError::io(path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| PersistenceError::json(path, e))
    }

    /// Write to `<name>.tmp`, fsync, then rename over the target so readers
    /// never observe a half-written file.
    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), PersistenceError> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let body = serde_json::to_vec_pretty(value).map_err(|e| PersistenceError::json(&path, e))?;

        let mut file = fs::File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
        file.write_all(&body).map_err(|e| PersistenceError::io(&tmp, e))?;
        file.sync_all().map_err(|e| PersistenceError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| PersistenceError::io(&path, e))
    }
}

impl Persistence for JsonFileStore {
    fn read_archive(&self) -> Result<HistoricalArchive, PersistenceError> {
        self.read_json(ARCHIVE_FILE)
    }

    fn write_archive(&self, archive: &HistoricalArchive) -> Result<(), PersistenceError> {
        self.write_json(ARCHIVE_FILE, archive)
    }

    fn read_entries(&self) -> Result<EntryRecords, PersistenceError> {
        let path = self.dir.join(ENTRIES_FILE);
        let raw: BTreeMap<i32, Vec<serde_json::Value>> = self.read_json(ENTRIES_FILE)?;
        Ok(raw
            .into_iter()
            .map(|(year, values)| (year, lenient_records(&path, values)))
            .collect())
    }

    fn write_entries(&self, entries: &DetailedArchive) -> Result<(), PersistenceError> {
        self.write_json(ENTRIES_FILE, entries)
    }

    fn read_session(&self) -> Result<Vec<EventRecord>, PersistenceError> {
        let path = self.dir.join(SESSION_FILE);
        let raw: Vec<serde_json::Value> = self.read_json(SESSION_FILE)?;
        Ok(lenient_records(&path, raw))
    }

    fn write_session(&self, events: &[Event]) -> Result<(), PersistenceError> {
        let records: Vec<EventRecord> = events.iter().map(EventRecord::from).collect();
        self.write_json(SESSION_FILE, &records)
    }

    fn read_live(&self) -> Result<LiveRecord, PersistenceError> {
        self.read_json(LIVE_FILE)
    }

    fn write_live(&self, live: &LiveRecord) -> Result<(), PersistenceError> {
        self.write_json(LIVE_FILE, live)
    }
}

/// Shape problems in one record must not poison the rest, so an unreadable
/// value becomes a record with an empty timestamp; decoding then reports it
/// as malformed at the right index.
fn lenient_records(path: &Path, values: Vec<serde_json::Value>) -> Vec<EventRecord> {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), index, error = %e, "unreadable event record");
                EventRecord {
                    timestamp: String::new(),
                    count: 0,
                }
            })
        })
        .collect()
}

/// In-memory backend with switchable write failures.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: std::sync::Mutex<MemoryInner>,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MemoryInner {
    archive: HistoricalArchive,
    entries: EntryRecords,
    session: Vec<EventRecord>,
    live: LiveRecord,
    fail_writes: bool,
    archive_writes: usize,
}

#[cfg(test)]
impl MemoryStore {
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_writes = fail;
    }

    pub fn seed_session(&self, records: Vec<EventRecord>) {
        self.inner.lock().unwrap().session = records;
    }

    pub fn seed_archive(&self, archive: HistoricalArchive) {
        self.inner.lock().unwrap().archive = archive;
    }

    pub fn seed_entries(&self, entries: EntryRecords) {
        self.inner.lock().unwrap().entries = entries;
    }

    pub fn seed_live(&self, live: LiveRecord) {
        self.inner.lock().unwrap().live = live;
    }

    pub fn archive_writes(&self) -> usize {
        self.inner.lock().unwrap().archive_writes
    }

    fn check(inner: &MemoryInner) -> Result<(), PersistenceError> {
        if inner.fail_writes {
            Err(PersistenceError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
impl Persistence for MemoryStore {
    fn read_archive(&self) -> Result<HistoricalArchive, PersistenceError> {
        Ok(self.inner.lock().unwrap().archive.clone())
    }

    fn write_archive(&self, archive: &HistoricalArchive) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        inner.archive = archive.clone();
        inner.archive_writes += 1;
        Ok(())
    }

    fn read_entries(&self) -> Result<EntryRecords, PersistenceError> {
        Ok(self.inner.lock().unwrap().entries.clone())
    }

    fn write_entries(&self, entries: &DetailedArchive) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        inner.entries = entries
            .iter()
            .map(|(year, events)| (*year, events.iter().map(EventRecord::from).collect()))
            .collect();
        Ok(())
    }

    fn read_session(&self) -> Result<Vec<EventRecord>, PersistenceError> {
        Ok(self.inner.lock().unwrap().session.clone())
    }

    fn write_session(&self, events: &[Event]) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        inner.session = events.iter().map(EventRecord::from).collect();
        Ok(())
    }

    fn read_live(&self) -> Result<LiveRecord, PersistenceError> {
        Ok(self.inner.lock().unwrap().live.clone())
    }

    fn write_live(&self, live: &LiveRecord) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        inner.live = live.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeSlotStat;

    #[test]
    fn test_missing_files_read_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        assert!(store.read_archive().unwrap().is_empty());
        assert!(store.read_entries().unwrap().is_empty());
        assert!(store.read_session().unwrap().is_empty());
        assert_eq!(store.read_live().unwrap(), LiveRecord::default());
    }

    #[test]
    fn test_archive_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        let mut archive = HistoricalArchive::new();
        archive.entry(2024).or_default().insert(
            "18:10".to_string(),
            TimeSlotStat {
                total: 10,
                average: 5.0,
                ..Default::default()
            },
        );
        store.write_archive(&archive).unwrap();

        let text = std::fs::read_to_string(dir.path().join(ARCHIVE_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["2024"]["18:10"]["total"], 10);
        assert_eq!(value["2024"]["18:10"]["average"], 5.0);
        assert!(value["2024"]["18:10"].get("days").is_none());
        assert!(!dir.path().join(format!("{ARCHIVE_FILE}.tmp")).exists());

        assert_eq!(store.read_archive().unwrap(), archive);
    }

    #[test]
    fn test_unreadable_session_record_is_kept_as_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SESSION_FILE),
            r#"[{"timestamp": "2024-10-31T18:00:00", "count": 1}, {"stamp": 3}]"#,
        )
        .unwrap();
        let store = JsonFileStore::new(dir.path());

        let records = store.read_session().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].decode(0).is_ok());
        assert!(records[1].decode(1).is_err());
    }

    #[test]
    fn test_entries_file_is_keyed_by_year() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let ts = crate::calendar::parse_timestamp("2023-10-31T18:00:00").unwrap();

        let mut entries = DetailedArchive::new();
        entries.insert(2023, vec![Event::new(ts, 2).unwrap()]);
        store.write_entries(&entries).unwrap();

        let text = std::fs::read_to_string(dir.path().join(ENTRIES_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["2023"][0]["timestamp"], "2023-10-31T18:00:00");
        assert_eq!(value["2023"][0]["count"], 2);

        std::fs::write(
            dir.path().join(ENTRIES_FILE),
            r#"{"2023": [{"timestamp": "2023-10-31T18:00:00", "count": 2}, "junk"]}"#,
        )
        .unwrap();
        let records = store.read_entries().unwrap();
        assert_eq!(records[&2023].len(), 2);
        assert!(records[&2023][1].decode(1).is_err());
    }

    #[test]
    fn test_corrupt_archive_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ARCHIVE_FILE), "{ not json").unwrap();
        let store = JsonFileStore::new(dir.path());

        assert!(matches!(
            store.read_archive(),
            Err(PersistenceError::Json { .. })
        ));
    }
}
