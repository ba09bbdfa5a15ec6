// Arrival time helpers: clock strings in Hong Kong time and minute countdowns.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Hong_Kong;

const NOT_AVAILABLE: &str = "N/A";

/// Parses an upstream timestamp.
///
/// RFC 3339 strings carry their own offset. Offset-less date-times are taken
/// as Hong Kong local time, since that is what the KMB feed publishes. A
/// bare `YYYY-MM-DD` is midnight UTC.
pub fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    let trimmed = timestamp.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let local = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .and_then(|naive| Hong_Kong.from_local_datetime(&naive).earliest())
        .map(|dt| dt.with_timezone(&Utc));

    local.or_else(|| {
        NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

/// `HH:MM:SS` in Hong Kong time. Empty input gives `"N/A"`, anything that
/// does not parse is handed back untouched.
pub fn format_time_of_day(timestamp: &str) -> String {
    if timestamp.is_empty() {
        return NOT_AVAILABLE.to_string();
    }

    match parse_timestamp(timestamp) {
        Some(dt) => dt.with_timezone(&Hong_Kong).format("%H:%M:%S").to_string(),
        None => timestamp.to_string(),
    }
}

/// Whole minutes from `now` until `timestamp`, rounded, never negative.
pub fn minutes_until(timestamp: &str, now: DateTime<Utc>) -> Option<i64> {
    let eta = parse_timestamp(timestamp)?;
    let diff_ms = (eta - now).num_milliseconds();
    let minutes = (diff_ms as f64 / 60_000.0).round() as i64;
    Some(minutes.max(0))
}

/// Same as [`minutes_until`] with the reference instant given as a string.
pub fn minutes_until_str(timestamp: &str, reference_now: &str) -> Option<i64> {
    let now = parse_timestamp(reference_now)?;
    minutes_until(timestamp, now)
}

pub fn minutes_until_now(timestamp: &str) -> Option<i64> {
    minutes_until(timestamp, Utc::now())
}

/// Countdown label for a board row: `"5 min"`, or `"-"` when unknown.
pub fn format_countdown(timestamp: &str, now: DateTime<Utc>) -> String {
    match minutes_until(timestamp, now) {
        Some(minutes) => format!("{} min", minutes),
        None => "-".to_string(),
    }
}
