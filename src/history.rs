//! Historical comparator: folds finished sessions into the cross-year archive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::calendar;
use crate::models::{DetailedArchive, EntryRecords, Event, HistoricalArchive, TimeSlotStat};

/// How many "days" an average divides by.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContributionPolicy {
    /// Distinct calendar dates that saw at least one event in the slot.
    #[default]
    DistinctDates,
    /// Every merged session touching the slot counts once.
    PerSession,
}

/// Owns the archive. Mutated only through [`HistoricalComparator::merge_session`].
#[derive(Debug, Clone, Default)]
pub struct HistoricalComparator {
    archive: HistoricalArchive,
    /// Raw entries behind the slot stats, for per-arrival views.
    entries: DetailedArchive,
    policy: ContributionPolicy,
    /// The in-memory archive has changes the backend has not accepted yet.
    dirty: bool,
}

impl HistoricalComparator {
    pub fn new(mut archive: HistoricalArchive, policy: ContributionPolicy) -> Self {
        for slots in archive.values_mut() {
            for stat in slots.values_mut() {
                adopt_legacy_days(stat);
            }
        }
        Self {
            archive,
            entries: DetailedArchive::new(),
            policy,
            dirty: false,
        }
    }

    /// Load persisted per-year entries, skipping records that do not decode.
    /// Returns how many were skipped.
    pub fn restore_entries(&mut self, records: &EntryRecords) -> usize {
        let mut skipped = 0;
        for (year, year_records) in records {
            let events = self.entries.entry(*year).or_default();
            for (index, record) in year_records.iter().enumerate() {
                match record.decode(index) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        warn!(year, error = %e, "skipping archived entry");
                        skipped += 1;
                    }
                }
            }
            events.sort_by_key(|e| e.timestamp);
        }
        skipped
    }

    pub fn archive(&self) -> &HistoricalArchive {
        &self.archive
    }

    pub fn entries(&self) -> &DetailedArchive {
        &self.entries
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Add every minute bucket of `events` into `archive[year]` and the
    /// entries themselves into that year's entry list.
    ///
    /// Totals add up, contributing dates are a set union and entries are
    /// re-sorted by timestamp, so the outcome does not depend on the order
    /// sessions are merged in.
    pub fn merge_session(&mut self, year: i32, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let year_entries = self.entries.entry(year).or_default();
        year_entries.extend_from_slice(events);
        year_entries.sort_by_key(|e| e.timestamp);

        let slots = self.archive.entry(year).or_default();

        let mut touched: BTreeMap<String, Vec<&Event>> = BTreeMap::new();
        for event in events {
            touched
                .entry(calendar::minute_key(&event.timestamp))
                .or_default()
                .push(event);
        }

        for (slot, slot_events) in touched {
            let stat = slots.entry(slot).or_default();
            stat.total += slot_events.iter().map(|e| u64::from(e.count)).sum::<u64>();
            match self.policy {
                ContributionPolicy::DistinctDates => {
                    stat.days.extend(
                        slot_events
                            .iter()
                            .map(|e| calendar::calendar_date(&e.timestamp)),
                    );
                }
                ContributionPolicy::PerSession => stat.untracked_days += 1,
            }
            stat.average = stat.total as f64 / stat.contributing_days().max(1) as f64;
        }
        self.dirty = true;
    }

    /// Slot stats for the requested years, or every year when `years` is `None`.
    /// Years with no data come back as empty maps so charts get a series per year asked.
    pub fn compare(&self, years: Option<&[i32]>) -> HistoricalArchive {
        select_years(&self.archive, years)
    }

    /// Archived entries per year, oldest first; same year selection as [`compare`](Self::compare).
    pub fn detailed(&self, years: Option<&[i32]>) -> DetailedArchive {
        select_years(&self.entries, years)
    }

    pub fn years(&self) -> Vec<i32> {
        self.archive.keys().copied().collect()
    }
}

fn select_years<T: Clone + Default>(
    by_year: &BTreeMap<i32, T>,
    years: Option<&[i32]>,
) -> BTreeMap<i32, T> {
    match years {
        None => by_year.clone(),
        Some(years) => years
            .iter()
            .map(|year| (*year, by_year.get(year).cloned().unwrap_or_default()))
            .collect(),
    }
}

/// Slots written before dates were tracked only carry `{total, average}`;
/// recover how many days went into that average.
fn adopt_legacy_days(stat: &mut TimeSlotStat) {
    if stat.days.is_empty() && stat.untracked_days == 0 && stat.total > 0 && stat.average > 0.0 {
        let inferred = (stat.total as f64 / stat.average).round();
        stat.untracked_days = if inferred >= 1.0 { inferred as u32 } else { 1 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(raw: &str, count: i64) -> Event {
        Event::new(calendar::parse_timestamp(raw).unwrap(), count).unwrap()
    }

    #[test]
    fn test_merge_into_legacy_slot_counts_prior_days() {
        let mut archive = HistoricalArchive::new();
        archive.entry(2024).or_default().insert(
            "08:10".to_string(),
            TimeSlotStat {
                total: 10,
                average: 5.0,
                ..Default::default()
            },
        );
        let mut comparator = HistoricalComparator::new(archive, ContributionPolicy::DistinctDates);

        comparator.merge_session(2024, &[ev("2024-10-31T08:10:00", 5)]);

        let stat = &comparator.archive()[&2024]["08:10"];
        assert_eq!(stat.total, 15);
        assert_eq!(stat.contributing_days(), 3);
        assert_eq!(stat.average, 5.0);
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = vec![ev("2024-10-31T18:00:00", 2), ev("2024-10-31T18:01:00", 1)];
        let b = vec![ev("2024-11-01T18:00:30", 3), ev("2024-11-01T18:05:00", 1)];

        let mut ab = HistoricalComparator::default();
        ab.merge_session(2024, &a);
        ab.merge_session(2024, &b);

        let mut ba = HistoricalComparator::default();
        ba.merge_session(2024, &b);
        ba.merge_session(2024, &a);

        assert_eq!(ab.archive(), ba.archive());
        let stat = &ab.archive()[&2024]["18:00"];
        assert_eq!(stat.total, 5);
        assert_eq!(stat.contributing_days(), 2);
        assert_eq!(stat.average, 2.5);
    }

    #[test]
    fn test_same_day_is_not_double_counted() {
        let mut comparator = HistoricalComparator::default();
        comparator.merge_session(
            2024,
            &[ev("2024-10-31T18:00:00", 2), ev("2024-10-31T18:00:40", 2)],
        );
        // A second session on the same evening.
        comparator.merge_session(2024, &[ev("2024-10-31T18:00:10", 4)]);

        let stat = &comparator.archive()[&2024]["18:00"];
        assert_eq!(stat.total, 8);
        assert_eq!(stat.contributing_days(), 1);
        assert_eq!(stat.average, 8.0);
    }

    #[test]
    fn test_per_session_policy_counts_merges() {
        let mut comparator =
            HistoricalComparator::new(HistoricalArchive::new(), ContributionPolicy::PerSession);
        comparator.merge_session(2024, &[ev("2024-10-31T18:00:00", 2)]);
        comparator.merge_session(2024, &[ev("2024-10-31T18:00:10", 4)]);

        let stat = &comparator.archive()[&2024]["18:00"];
        assert_eq!(stat.contributing_days(), 2);
        assert_eq!(stat.average, 3.0);
    }

    #[test]
    fn test_empty_session_leaves_archive_untouched() {
        let mut comparator = HistoricalComparator::default();
        comparator.merge_session(2024, &[]);

        assert!(comparator.archive().is_empty());
        assert!(!comparator.is_dirty());
    }

    #[test]
    fn test_compare_selects_years() {
        let mut comparator = HistoricalComparator::default();
        comparator.merge_session(2023, &[ev("2023-10-31T18:00:00", 1)]);
        comparator.merge_session(2024, &[ev("2024-10-31T19:00:00", 1)]);

        let all = comparator.compare(None);
        assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![2023, 2024]);

        let some = comparator.compare(Some(&[2024, 2025]));
        assert_eq!(some.len(), 2);
        assert!(some[&2024].contains_key("19:00"));
        assert!(some[&2025].is_empty());
    }

    #[test]
    fn test_entries_stay_sorted_across_merges() {
        let mut comparator = HistoricalComparator::default();
        comparator.merge_session(2024, &[ev("2024-11-01T18:00:00", 3)]);
        comparator.merge_session(
            2024,
            &[ev("2024-10-31T18:05:00", 1), ev("2024-10-31T18:01:00", 2)],
        );
        comparator.merge_session(2023, &[ev("2023-10-31T19:00:00", 4)]);

        let detailed = comparator.detailed(Some(&[2024, 2022]));
        let stamps: Vec<_> = detailed[&2024]
            .iter()
            .map(|e| calendar::format_timestamp(&e.timestamp))
            .collect();
        assert_eq!(
            stamps,
            vec!["2024-10-31T18:01:00", "2024-10-31T18:05:00", "2024-11-01T18:00:00"]
        );
        assert!(detailed[&2022].is_empty());
        assert!(!detailed.contains_key(&2023));
        assert_eq!(comparator.detailed(None).len(), 2);
    }

    #[test]
    fn test_restore_entries_skips_malformed_records() {
        let mut records = EntryRecords::new();
        records.insert(
            2023,
            vec![
                crate::models::EventRecord {
                    timestamp: "2023-10-31T19:00:00".into(),
                    count: 2,
                },
                crate::models::EventRecord {
                    timestamp: "".into(),
                    count: 0,
                },
                crate::models::EventRecord {
                    timestamp: "2023-10-31T18:00:00".into(),
                    count: 1,
                },
            ],
        );
        let mut comparator = HistoricalComparator::default();

        assert_eq!(comparator.restore_entries(&records), 1);
        let entries = &comparator.entries()[&2023];
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].count, 1);
        assert!(!comparator.is_dirty());
    }
}
