//! Aggregator: pure, stateless views derived from an event sequence.
//!
//! Nothing here holds state or fails on empty input; callers pass a
//! snapshot of the session and get zero-valued results for an empty one.

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::calendar;
use crate::models::{Event, PeakWindow, SlotCounts};

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(raw: &str, count: i64) -> Event {
        Event::new(calendar::parse_timestamp(raw).unwrap(), count).unwrap()
    }

    fn sample() -> Vec<Event> {
        vec![
            ev("2024-10-31T08:01:00", 1),
            ev("2024-10-31T08:01:30", 2),
            ev("2024-10-31T08:03:00", 1),
        ]
    }

    #[test]
    fn test_minute_buckets() {
        let buckets = minute_buckets(&sample());

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets["08:01"], 3);
        assert_eq!(buckets["08:03"], 1);
    }

    #[test]
    fn test_bucket_sum_matches_event_sum() {
        let events = vec![
            ev("2024-10-31T17:58:00", 2),
            ev("2024-10-31T18:00:01", 1),
            ev("2024-10-31T18:09:59", 5),
            ev("2024-10-31T18:10:00", 1),
            ev("2024-10-31T19:45:00", 7),
        ];
        let total = total(&events);

        assert_eq!(minute_buckets(&events).values().sum::<u64>(), total);
        assert_eq!(ten_minute_buckets(&events).values().sum::<u64>(), total);
    }

    #[test]
    fn test_ten_minute_buckets() {
        let events = vec![
            ev("2024-10-31T18:00:01", 1),
            ev("2024-10-31T18:09:59", 5),
            ev("2024-10-31T18:10:00", 1),
        ];
        let buckets = ten_minute_buckets(&events);

        assert_eq!(buckets["18:00"], 6);
        assert_eq!(buckets["18:10"], 1);
    }

    #[test]
    fn test_running_total_fills_gaps() {
        let running = RunningTotal::new(&sample());
        let points: Vec<_> = running.iter().collect();

        assert_eq!(
            points,
            vec![
                ("08:01".to_string(), 3),
                ("08:02".to_string(), 3),
                ("08:03".to_string(), 4),
            ]
        );
    }

    #[test]
    fn test_running_total_is_restartable_and_non_decreasing() {
        let events = vec![
            ev("2024-10-31T18:00:00", 1),
            ev("2024-10-31T18:00:40", 1),
            ev("2024-10-31T18:07:00", 3),
            ev("2024-10-31T18:30:00", 2),
        ];
        let running = RunningTotal::new(&events);

        let first: Vec<_> = running.iter().collect();
        let second: Vec<_> = (&running).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 31);
        assert!(first.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(first.last().unwrap().1, total(&events));
    }

    #[test]
    fn test_running_total_crosses_midnight() {
        let events = vec![ev("2024-10-31T23:59:10", 1), ev("2024-11-01T00:01:00", 1)];
        let labels: Vec<_> = RunningTotal::new(&events).iter().map(|(l, _)| l).collect();

        assert_eq!(labels, vec!["23:59", "00:00", "00:01"]);
    }

    #[test]
    fn test_windowed_peak_is_index_based() {
        // Entries far apart in time still form one window.
        let events = vec![
            ev("2024-10-31T18:00:00", 1),
            ev("2024-10-31T18:05:00", 4),
            ev("2024-10-31T19:30:00", 5),
            ev("2024-10-31T19:35:00", 1),
        ];
        let peak = windowed_peak(&events, 2);

        assert_eq!(peak.total, 9);
        assert_eq!(peak.start, Some(events[1].timestamp));
        assert_eq!(peak.end, Some(events[2].timestamp));
    }

    #[test]
    fn test_windowed_peak_short_and_empty() {
        let events = sample();
        assert_eq!(windowed_peak(&events, 10).total, 4);
        assert_eq!(windowed_peak(&events, 0), PeakWindow::default());
        assert_eq!(windowed_peak(&[], 2), PeakWindow::default());
    }

    #[test]
    fn test_recent_window_sum_is_inclusive() {
        let events = vec![
            ev("2024-10-31T18:00:00", 1),
            ev("2024-10-31T18:05:00", 2),
            ev("2024-10-31T18:08:00", 4),
            ev("2024-10-31T18:10:00", 8),
        ];
        let now = calendar::parse_timestamp("2024-10-31T18:10:00").unwrap();

        assert_eq!(recent_window_sum(&events, now, Duration::minutes(5)), 14);
        assert_eq!(recent_window_sum(&events, now, Duration::minutes(1)), 8);
        assert_eq!(recent_window_sum(&[], now, Duration::minutes(5)), 0);
    }

    #[test]
    fn test_recent_window_wider_than_calendar_covers_everything() {
        let events = sample();
        let now = calendar::parse_timestamp("2024-10-31T08:05:00").unwrap();
        let huge = Duration::try_minutes(200_000_000_000).unwrap();

        assert_eq!(recent_window_sum(&events, now, huge), 4);
    }

    #[test]
    fn test_average() {
        assert_eq!(average(&[]), 0.0);
        assert!((average(&sample()) - 4.0 / 3.0).abs() < f64::EPSILON);
    }
}

pub fn total(events: &[Event]) -> u64 {
    events.iter().map(|e| u64::from(e.count)).sum()
}

/// Counts summed per local `HH:MM`.
pub fn minute_buckets(events: &[Event]) -> SlotCounts {
    bucket_by(events, calendar::minute_key)
}

/// Counts summed per local `HH:M0`.
pub fn ten_minute_buckets(events: &[Event]) -> SlotCounts {
    bucket_by(events, calendar::ten_minute_key)
}

fn bucket_by(events: &[Event], key: impl Fn(&NaiveDateTime) -> String) -> SlotCounts {
    let mut buckets = SlotCounts::new();
    for event in events {
        *buckets.entry(key(&event.timestamp)).or_insert(0) += u64::from(event.count);
    }
    buckets
}

/// Cumulative count at every minute from the first event's minute to the
/// last event's minute, inclusive. Empty minutes repeat the previous value.
///
/// Built once in O(n); [`RunningTotal::iter`] walks it lazily and can be
/// called any number of times.
#[derive(Debug, Clone, Default)]
pub struct RunningTotal {
    per_minute: BTreeMap<NaiveDateTime, u64>,
}

impl RunningTotal {
    pub fn new(events: &[Event]) -> Self {
        let mut per_minute = BTreeMap::new();
        for event in events {
            *per_minute
                .entry(calendar::floor_minute(&event.timestamp))
                .or_insert(0) += u64::from(event.count);
        }
        Self { per_minute }
    }

    pub fn iter(&self) -> RunningTotalIter<'_> {
        // Chronological input makes first/last the min/max minute.
        let bounds = self
            .per_minute
            .keys()
            .next()
            .copied()
            .zip(self.per_minute.keys().next_back().copied());
        RunningTotalIter {
            per_minute: &self.per_minute,
            cursor: bounds.map(|(start, _)| start),
            end: bounds.map(|(_, end)| end),
            cumulative: 0,
        }
    }

    /// Collected as `{minute, total}` points for charting.
    pub fn points(&self) -> Vec<RunningPoint> {
        self.iter()
            .map(|(minute, total)| RunningPoint { minute, total })
            .collect()
    }
}

impl<'a> IntoIterator for &'a RunningTotal {
    type Item = (String, u64);
    type IntoIter = RunningTotalIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct RunningTotalIter<'a> {
    per_minute: &'a BTreeMap<NaiveDateTime, u64>,
    cursor: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
    cumulative: u64,
}

impl Iterator for RunningTotalIter<'_> {
    type Item = (String, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let minute = self.cursor?;
        if self.end.map_or(true, |end| minute > end) {
            self.cursor = None;
            return None;
        }
        self.cumulative += self.per_minute.get(&minute).copied().unwrap_or(0);
        self.cursor = Some(minute + Duration::minutes(1));
        Some((calendar::minute_key(&minute), self.cumulative))
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct RunningPoint {
    pub minute: String,
    pub total: u64,
}

/// Largest sum over `window_size` consecutive entries of the log.
///
/// The window slides over list positions, not over time: with one entry per
/// five minutes a window of two approximates a ten-minute peak, but irregular
/// gaps are not corrected for. Fewer entries than the window means the whole
/// list is the only window.
pub fn windowed_peak(events: &[Event], window_size: usize) -> PeakWindow {
    if events.is_empty() || window_size == 0 {
        return PeakWindow::default();
    }
    let width = window_size.min(events.len());

    let mut sum: u64 = events[..width].iter().map(|e| u64::from(e.count)).sum();
    let (mut best, mut best_start) = (sum, 0);
    for start in 1..=events.len() - width {
        sum = sum - u64::from(events[start - 1].count) + u64::from(events[start + width - 1].count);
        if sum > best {
            best = sum;
            best_start = start;
        }
    }

    PeakWindow {
        total: best,
        start: Some(events[best_start].timestamp),
        end: Some(events[best_start + width - 1].timestamp),
    }
}

/// Sum of counts with `now - window <= timestamp <= now`.
///
/// A window reaching past the representable calendar covers everything up to `now`.
pub fn recent_window_sum(events: &[Event], now: NaiveDateTime, window: Duration) -> u64 {
    let from = now.checked_sub_signed(window).unwrap_or(NaiveDateTime::MIN);
    events
        .iter()
        .filter(|e| e.timestamp >= from && e.timestamp <= now)
        .map(|e| u64::from(e.count))
        .sum()
}

/// Mean count per entry; an empty session averages 0.
pub fn average(events: &[Event]) -> f64 {
    total(events) as f64 / events.len().max(1) as f64
}
