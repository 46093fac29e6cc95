//! Local calendar keys.
//!
//! Every timestamp in the system is a naive local wall-clock instant with
//! second precision. All bucketing (minute slots, ten-minute slots, calendar
//! dates, years) goes through this module so the time zone is interpreted in
//! exactly one place.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, Timelike};

use crate::error::TimestampError;

/// Format used when writing timestamps back out.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Current local time, truncated to the second.
pub fn now() -> NaiveDateTime {
    truncate_subsec(Local::now().naive_local())
}

/// Parse an ISO-8601-ish timestamp into local wall-clock time.
///
/// Accepts an optional `T` or space separator, optional fractional seconds
/// (dropped), and an optional `Z`/offset suffix (converted into the local
/// zone). Hours `24..=47` written by old counter firmware wrap to `hour - 24`
/// on the same date.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, TimestampError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TimestampError(raw.to_string()));
    }
    let fixed = wrap_overflow_hour(trimmed);

    if let Ok(with_offset) = DateTime::parse_from_rfc3339(&fixed) {
        return Ok(truncate_subsec(
            with_offset.with_timezone(&Local).naive_local(),
        ));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&fixed, fmt).ok())
        .map(truncate_subsec)
        .ok_or_else(|| TimestampError(raw.to_string()))
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// `HH:MM` slot key.
pub fn minute_key(ts: &NaiveDateTime) -> String {
    ts.format("%H:%M").to_string()
}

/// `HH:M0` slot key, the minute floored to a multiple of ten.
pub fn ten_minute_key(ts: &NaiveDateTime) -> String {
    format!("{:02}:{:02}", ts.hour(), (ts.minute() / 10) * 10)
}

/// The start of the minute containing `ts`.
pub fn floor_minute(ts: &NaiveDateTime) -> NaiveDateTime {
    *ts - Duration::seconds(i64::from(ts.second()))
        - Duration::nanoseconds(i64::from(ts.nanosecond()))
}

pub fn calendar_date(ts: &NaiveDateTime) -> NaiveDate {
    ts.date()
}

pub fn year(ts: &NaiveDateTime) -> i32 {
    ts.year()
}

fn truncate_subsec(ts: NaiveDateTime) -> NaiveDateTime {
    ts - Duration::nanoseconds(i64::from(ts.nanosecond()))
}

fn wrap_overflow_hour(raw: &str) -> String {
    let Some(sep) = raw.find(['T', ' ']) else {
        return raw.to_string();
    };
    let hour_digits = raw.get(sep + 1..sep + 3);
    match hour_digits.and_then(|h| h.parse::<u32>().ok()) {
        Some(hour) if (24..48).contains(&hour) => {
            format!("{}{:02}{}", &raw[..=sep], hour - 24, &raw[sep + 3..])
        }
        _ => raw.to_string(),
    }
}

/// Serde adapter writing `YYYY-MM-DDTHH:MM:SS` and reading anything
/// [`parse_timestamp`] accepts.
pub mod iso_seconds {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<NaiveDateTime>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_some(&super::super::format_timestamp(ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<NaiveDateTime>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| super::super::parse_timestamp(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
