//! IST display formatting for UTC timestamps.
//!
//! Every record that enters the service goes through this module exactly once,
//! so all feeds share one formatting path. The display zone is fixed to Indian
//! Standard Time (UTC+05:30) and never derived from the host locale.

use crate::error::{FeedError, FeedResult};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// UTC+05:30, no daylight saving.
const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

const TIME_FORMAT: &str = "%H:%M:%S";
const DATE_FORMAT: &str = "%d/%m/%Y";

/// Display-only wall clock values derived from a UTC instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStamp {
    /// 24-hour `HH:MM:SS` in IST
    pub local_time: String,
    /// `DD/MM/YYYY` in IST
    pub local_date: String,
}

/// The fixed display timezone.
pub fn ist() -> FixedOffset {
    FixedOffset::east_opt(IST_OFFSET_SECS).expect("IST offset is within one day")
}

/// Parse an ISO-8601-like timestamp as a UTC instant.
///
/// Accepts `T` or a space between date and time and optional fractional
/// seconds. A string carrying neither `Z` nor a numeric offset is read as UTC.
pub fn parse_utc(raw: &str) -> FeedResult<DateTime<Utc>> {
    let trimmed = raw.trim();

    let mut normalized = if trimmed.as_bytes().get(10) == Some(&b' ') {
        format!("{}T{}", &trimmed[..10], &trimmed[11..])
    } else {
        trimmed.to_string()
    };

    if !has_zone_designator(&normalized) {
        normalized.push('Z');
    }

    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| FeedError::InvalidTimestamp(raw.to_string()))
}

/// Format a UTC timestamp string for display in IST.
pub fn format(raw: &str) -> FeedResult<LocalStamp> {
    parse_utc(raw).map(format_instant)
}

/// Format an already-parsed instant for display in IST.
pub fn format_instant(instant: DateTime<Utc>) -> LocalStamp {
    let local = instant.with_timezone(&ist());

    LocalStamp {
        local_time: local.format(TIME_FORMAT).to_string(),
        local_date: local.format(DATE_FORMAT).to_string(),
    }
}

fn has_zone_designator(value: &str) -> bool {
    if value.ends_with('Z') || value.ends_with('z') {
        return true;
    }

    // Anything after the date that carries a sign is a numeric offset.
    value
        .get(11..)
        .map_or(false, |time| time.contains(|c| c == '+' || c == '-'))
}
